//! taskq CLI: operator interface to a taskq database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use taskq::Engine;
use taskq::config::Config;
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taskq", about = "Embedded SQLite task queue")]
struct Cli {
    /// TOML config file. Without it, configuration comes from TASKQ_* env vars.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append a payload to a queue
    Enqueue { queue: String, payload: String },
    /// Take the oldest payload from a queue
    Dequeue { queue: String },
    /// Number of items waiting in a queue
    Len { queue: String },
    /// Delete every queued item equal to the payload
    Remove { queue: String, payload: String },
    /// Clear a queue, its schedule, and all results
    Flush { queue: String },
    /// Hold a payload until a due time
    Schedule {
        queue: String,
        payload: String,
        /// Absolute due time (RFC 3339)
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<DateTime<Utc>>,
        /// Due this many seconds from now
        #[arg(long)]
        in_secs: Option<i64>,
    },
    /// Remove and print every due entry without enqueuing it
    Drain { queue: String },
    /// Run the promoter loop: move due entries onto the queue until Ctrl-C
    Promote {
        queue: String,
        #[arg(long, default_value_t = 1)]
        interval_secs: u64,
    },
    /// Result store operations
    Result {
        #[command(subcommand)]
        action: ResultAction,
    },
    /// Publish a JSON message on an event channel
    Emit { channel: String, message: String },
    /// Long-poll a channel and print each event as it arrives
    Listen {
        channel: String,
        /// Stop after this many seconds without events
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ResultAction {
    /// Store a value, replacing any previous one
    Put { key: String, value: String },
    /// Print a value without consuming it
    Peek { key: String },
    /// Print and consume a value
    Get { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "taskq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let engine = Arc::new(Engine::open(&config.engine)?);

    match cli.command {
        Command::Enqueue { queue, payload } => engine.enqueue(&queue, payload.as_bytes())?,
        Command::Dequeue { queue } => print_payload(engine.dequeue(&queue)?),
        Command::Len { queue } => {
            println!(
                "{queue}: {} queued, {} scheduled",
                engine.queue_len(&queue)?,
                engine.scheduled_len(&queue)?
            );
        }
        Command::Remove { queue, payload } => {
            let removed = engine.remove(&queue, payload.as_bytes())?;
            println!("removed {removed} item(s)");
        }
        Command::Flush { queue } => engine.flush(&queue)?,
        Command::Schedule {
            queue,
            payload,
            at,
            in_secs,
        } => {
            let due_at = match (at, in_secs) {
                (Some(at), _) => at,
                (None, Some(secs)) => Utc::now() + chrono::Duration::seconds(secs),
                (None, None) => anyhow::bail!("either --at or --in-secs is required"),
            };
            engine.schedule(&queue, payload.as_bytes(), due_at)?;
            println!("scheduled for {}", due_at.to_rfc3339());
        }
        Command::Drain { queue } => {
            for payload in engine.drain_due(&queue, Utc::now())? {
                println!("{}", String::from_utf8_lossy(&payload));
            }
        }
        Command::Promote {
            queue,
            interval_secs,
        } => cmd_promote(engine, queue, Duration::from_secs(interval_secs.max(1))).await?,
        Command::Result { action } => match action {
            ResultAction::Put { key, value } => engine.put_result(&key, value.as_bytes())?,
            ResultAction::Peek { key } => print_payload(engine.peek_result(&key)?),
            ResultAction::Get { key } => print_payload(engine.get_result(&key)?),
        },
        Command::Emit { channel, message } => {
            let message: serde_json::Value = serde_json::from_str(&message)?;
            engine.emit_event(&channel, &message)?;
        }
        Command::Listen {
            channel,
            timeout_secs,
        } => cmd_listen(engine, channel, timeout_secs.map(Duration::from_secs)).await?,
    }

    Ok(())
}

/// Print a payload, or "(empty)" on stderr when there is none.
fn print_payload(payload: Option<Vec<u8>>) {
    match payload {
        Some(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        None => eprintln!("(empty)"),
    }
}

async fn cmd_promote(engine: Arc<Engine>, queue: String, interval: Duration) -> anyhow::Result<()> {
    info!(%queue, ?interval, "promoter started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("promoter shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let engine = Arc::clone(&engine);
                let name = queue.clone();
                let promoted =
                    tokio::task::spawn_blocking(move || engine.promote_due(&name, Utc::now()))
                        .await?;
                match promoted {
                    Ok(0) => {}
                    Ok(count) => info!(%queue, count, "promoted due entries"),
                    // A producer or worker that cannot reach storage must halt.
                    Err(e) => {
                        error!(%queue, "promotion failed: {e}");
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

/// Upper bound on one blocking poll, so Ctrl-C is not stuck behind it.
const LISTEN_CHUNK: Duration = Duration::from_secs(5);

/// Length of the next poll: a full chunk, or what is left before `deadline`.
/// `None` once the deadline has passed.
fn next_chunk(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    match deadline {
        None => Some(LISTEN_CHUNK),
        Some(deadline) => deadline
            .checked_duration_since(now)
            .filter(|left| !left.is_zero())
            .map(|left| left.min(LISTEN_CHUNK)),
    }
}

async fn cmd_listen(
    engine: Arc<Engine>,
    channel: String,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    // The deadline restarts after every batch of events.
    let deadline_from = |now: Instant| timeout.and_then(|t| now.checked_add(t));
    let mut deadline = deadline_from(Instant::now());

    loop {
        let Some(chunk) = next_chunk(deadline, Instant::now()) else {
            info!(%channel, "no events before timeout");
            return Ok(());
        };

        let engine = Arc::clone(&engine);
        let name = channel.clone();
        let poll =
            tokio::task::spawn_blocking(move || engine.read_events_timeout(&name, chunk));

        let events = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            events = poll => events??,
        };

        if events.is_empty() {
            continue;
        }
        for event in events {
            println!("{event}");
        }
        deadline = deadline_from(Instant::now());
    }
}
