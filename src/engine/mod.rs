//! Work queue engine: the retrying background consumer and its pluggable
//! item processor.

pub mod item;
pub mod processor;
mod worker;

pub use item::ItemProcessor;
pub use processor::{DropReason, SubmitResult, WorkQueueProcessor};
