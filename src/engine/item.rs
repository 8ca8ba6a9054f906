//! The delivery strategy a call site plugs into a work queue.

use std::future::Future;

use crate::error::ProcessingError;
use crate::model::ProcessResult;

/// Performs one delivery attempt for one item.
///
/// The processor alone decides between [`ProcessResult::Retry`] and
/// [`ProcessResult::Failed`]; the queue never looks at the payload. An `Err`
/// or a panic counts as `Failed` for that item and does not stop the queue.
/// Downstream timeouts are the implementation's job.
pub trait ItemProcessor<T>: Send + Sync + 'static {
    fn process(
        &self,
        item: &T,
    ) -> impl Future<Output = Result<ProcessResult, ProcessingError>> + Send;

    /// Human-readable description for logs and `last_error`. Must not
    /// include secrets.
    fn convert_to_debug_string(&self, item: &T) -> String;
}
