//! workq CLI: inspect and drive persistent queues in a SQLite file.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use workq::config::Config;
use workq::engine::{ItemProcessor, WorkQueueProcessor};
use workq::error::ProcessingError;
use workq::model::{ProcessResult, QueuedItem};
use workq::storage::{KvStore, SqliteStore};
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::{PersistentDeque, WorkQueueSettings};

#[derive(Parser)]
#[command(name = "workq", about = "Crash-tolerant persistent work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Raw deque operations on one partition
    Deque {
        /// Partition (queue) name
        partition: String,
        #[command(subcommand)]
        action: DequeAction,
    },
    /// Queue a JSON work item for a processor
    Submit {
        /// Queue name
        queue: String,
        /// JSON payload
        payload: String,
    },
    /// Process a queue until it is empty, printing each item
    Drain {
        /// Queue name
        queue: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum DequeAction {
    /// Insert an item (at the tail unless --front)
    Push {
        item: String,
        #[arg(long)]
        front: bool,
    },
    /// Remove and print an item (from the head unless --back)
    Pop {
        #[arg(long)]
        back: bool,
    },
    /// Print an item without removing it
    Peek {
        #[arg(long)]
        back: bool,
    },
    /// Print all items, head to tail
    List {
        #[arg(long)]
        reverse: bool,
    },
    /// Print the number of items
    Size,
    /// Remove every item
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&config.db_path)?);

    match cli.command {
        Command::Deque { partition, action } => {
            let deque = PersistentDeque::open(store, partition)?;
            cmd_deque(&deque, action)
        }
        Command::Submit { queue, payload } => {
            let deque = PersistentDeque::open(store, queue)?;
            cmd_submit(&deque, &config.queue, &payload)
        }
        Command::Drain {
            queue,
            timeout_secs,
        } => {
            let deque = Arc::new(PersistentDeque::open(store, queue.clone())?);
            cmd_drain(queue, deque, config.queue, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn cmd_deque(deque: &PersistentDeque, action: DequeAction) -> anyhow::Result<()> {
    match action {
        DequeAction::Push { item, front } => {
            if front {
                deque.add_first(&item)?;
            } else {
                deque.add_last(&item)?;
            }
            println!("size {}", deque.size()?);
        }
        DequeAction::Pop { back } => {
            let item = if back {
                deque.poll_last()?
            } else {
                deque.poll_first()?
            };
            print_optional(item);
        }
        DequeAction::Peek { back } => {
            let item = if back {
                deque.peek_last()?
            } else {
                deque.peek_first()?
            };
            print_optional(item);
        }
        DequeAction::List { reverse } => {
            let iter = if reverse {
                deque.descending_iter()?
            } else {
                deque.iter()?
            };
            for item in iter {
                println!("{}", item?);
            }
        }
        DequeAction::Size => println!("{}", deque.size()?),
        DequeAction::Clear => {
            deque.clear()?;
            println!("cleared {}", deque.partition());
        }
    }
    Ok(())
}

fn print_optional(item: Option<String>) {
    match item {
        Some(item) => println!("{item}"),
        None => println!("(empty)"),
    }
}

fn cmd_submit(
    deque: &PersistentDeque,
    settings: &WorkQueueSettings,
    payload: &str,
) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    let queued = QueuedItem::new(value);
    let raw = serde_json::to_string(&queued)?;

    if !deque.add_last_within(&raw, settings.max_events())? {
        anyhow::bail!(
            "{} is full ({} items), item dropped",
            deque.partition(),
            settings.max_events()
        );
    }
    println!("Queued {} ({})", deque.partition(), queued.id);
    Ok(())
}

async fn cmd_drain(
    queue: String,
    deque: Arc<PersistentDeque>,
    settings: WorkQueueSettings,
    timeout: Duration,
) -> anyhow::Result<()> {
    let processor = WorkQueueProcessor::<serde_json::Value>::new(queue, deque, settings, Printer);

    let drained = tokio::time::timeout(timeout, async {
        while processor.queue_size() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();

    processor.close().await;
    for (key, value) in processor.debug_info() {
        println!("{key:>16}: {value}");
    }

    if !drained {
        anyhow::bail!(
            "{} items still queued after {}s",
            processor.queue_size(),
            timeout.as_secs()
        );
    }
    Ok(())
}

/// Prints each item to stdout and reports success.
struct Printer;

impl ItemProcessor<serde_json::Value> for Printer {
    async fn process(&self, item: &serde_json::Value) -> Result<ProcessResult, ProcessingError> {
        println!("{item}");
        Ok(ProcessResult::Success)
    }

    fn convert_to_debug_string(&self, item: &serde_json::Value) -> String {
        item.to_string()
    }
}
