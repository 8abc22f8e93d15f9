//! rmq CLI: operator interface to rmq queues.

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rmq::config::Config;
use rmq::telemetry::{TelemetryConfig, init_telemetry};
use rmq::{BatchOptions, Connection, Delivery, Queue, batch_consumer_fn, consumer_fn};
use serde::Serialize;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rmq", about = "Operate rmq work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a payload
    Publish {
        queue: String,
        payload: String,
        /// Deliver no earlier than this many seconds from now
        #[arg(long)]
        delay_secs: Option<u64>,
    },
    /// Show ready, unacked, rejected, and delayed counts
    Counts {
        queue: String,
        /// Read the unacked list of this connection (default: a fresh one)
        #[arg(long)]
        connection: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete every entry of one list
    Purge { queue: String, list: PurgeList },
    /// Move rejected deliveries back to ready
    ReturnRejected {
        queue: String,
        /// How many to return (default: all)
        #[arg(long)]
        count: Option<usize>,
    },
    /// Move a connection's unacked deliveries back to ready
    ReturnUnacked {
        queue: String,
        /// Name of the connection that left them, as printed by `consume`
        #[arg(long)]
        connection: String,
    },
    /// Consume and ack deliveries until interrupted
    Consume {
        queue: String,
        #[arg(long)]
        prefetch: Option<usize>,
        #[arg(long)]
        poll_ms: Option<u64>,
        /// Consume in batches of this size
        #[arg(long)]
        batch: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PurgeList {
    Ready,
    Rejected,
    Delayed,
}

#[derive(Serialize)]
struct Counts {
    queue: String,
    ready: usize,
    unacked: usize,
    rejected: usize,
    delayed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "rmq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let connection = Connection::connect("rmq-cli", &config).await?;

    match cli.command {
        Command::Publish {
            queue,
            payload,
            delay_secs,
        } => {
            let queue = connection.open_queue(&queue).await?;
            match delay_secs {
                Some(secs) => {
                    let due = Utc::now() + chrono::Duration::seconds(secs as i64);
                    queue.publish_on_delay(&payload, due).await?;
                    println!("Scheduled for {due}");
                }
                None => {
                    queue.publish(&payload).await?;
                    println!("Published to {}", queue.name());
                }
            }
        }
        Command::Counts {
            queue,
            connection: name,
            json,
        } => {
            let connection = match name {
                Some(name) => attach(&connection, &name),
                None => connection,
            };
            let queue = connection.open_queue(&queue).await?;
            cmd_counts(&queue, json).await?;
        }
        Command::Purge { queue, list } => {
            let queue = connection.open_queue(&queue).await?;
            let purged = match list {
                PurgeList::Ready => queue.purge_ready().await,
                PurgeList::Rejected => queue.purge_rejected().await,
                PurgeList::Delayed => queue.purge_delayed().await,
            };
            println!("Purged {purged} entries");
        }
        Command::ReturnRejected { queue, count } => {
            let queue = connection.open_queue(&queue).await?;
            let returned = match count {
                Some(count) => queue.return_rejected(count).await?,
                None => queue.return_all_rejected().await?,
            };
            println!("Returned {returned} rejected deliveries");
        }
        Command::ReturnUnacked {
            queue,
            connection: name,
        } => {
            let queue = attach(&connection, &name).open_queue(&queue).await?;
            let returned = queue.return_all_unacked().await?;
            println!("Returned {returned} unacked deliveries");
        }
        Command::Consume {
            queue,
            prefetch,
            poll_ms,
            batch,
        } => {
            let queue = connection.open_queue(&queue).await?;
            let mut options = config.consume_options();
            if let Some(prefetch) = prefetch {
                options.prefetch_limit = prefetch;
            }
            if let Some(poll_ms) = poll_ms {
                options.poll_interval = Duration::from_millis(poll_ms);
            }
            cmd_consume(&queue, options, batch).await?;
        }
    }

    Ok(())
}

/// A handle on another process's connection, sharing this one's store.
fn attach(connection: &Connection, name: &str) -> Connection {
    Connection::with_name(name, connection.keys().clone(), connection.store())
}

async fn cmd_counts(queue: &Queue, json: bool) -> anyhow::Result<()> {
    let counts = Counts {
        queue: queue.name().to_string(),
        ready: queue.ready_count().await,
        unacked: queue.unacked_count().await,
        rejected: queue.rejected_count().await,
        delayed: queue.delayed_count().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    println!(
        "{:<24}  {:>8}  {:>8}  {:>8}  {:>8}",
        "QUEUE", "READY", "UNACKED", "REJECTED", "DELAYED"
    );
    println!(
        "{:<24}  {:>8}  {:>8}  {:>8}  {:>8}",
        counts.queue, counts.ready, counts.unacked, counts.rejected, counts.delayed
    );
    Ok(())
}

async fn ack_logged(delivery: Delivery) {
    tracing::info!(payload = delivery.payload(), "consumed");
    if let Err(e) = delivery.ack().await {
        tracing::error!(error = %e, "ack failed");
    }
}

async fn cmd_consume(
    queue: &Queue,
    options: rmq::ConsumeOptions,
    batch: Option<usize>,
) -> anyhow::Result<()> {
    queue.start_consuming(options).await?;

    let consumer = match batch {
        Some(size) => {
            queue
                .add_batch_consumer_with_options(
                    "rmq-cli",
                    BatchOptions::new(size),
                    batch_consumer_fn(|batch: Vec<Delivery>| async move {
                        tracing::info!(size = batch.len(), "batch received");
                        for delivery in batch {
                            ack_logged(delivery).await;
                        }
                    }),
                )
                .await?
        }
        None => queue.add_consumer("rmq-cli", consumer_fn(ack_logged)).await?,
    };
    println!(
        "Consuming {} as {consumer} on connection {}, ctrl-c to stop",
        queue.name(),
        queue.connection_name()
    );

    tokio::signal::ctrl_c().await?;
    queue.stop_consuming();
    queue.wait_stopped().await?;
    queue.remove_consumer(&consumer).await?;
    println!("Stopped");
    Ok(())
}
