use anyhow::Context;
use clap::Parser;
use cvt_core::IngestRequest;
use cvt_notify::{Notifier, NotifierConfig, WebhookTargetProvider};
use cvt_pipeline::{
    BrokerRunner, ConversationProcessor, ConversationTracker, IngestionCoordinator, InlineRunner,
    JobRunner, PipelineHandlers, RetryPolicy,
};
use cvt_storage::ConversationStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Conversation-analytics worker. Reads one ingestion request per line (JSON)
/// from stdin, runs the ingest -> process chain, and exits once the input is
/// drained. The HTTP layer that normally produces these requests lives
/// elsewhere; this binary hosts the queue worker.
#[derive(Parser, Debug)]
#[command(name = "cvt-daemon")]
struct Args {
    /// Path to the sqlite database (created if missing).
    #[arg(long, default_value = "chatvitals.db")]
    db: String,
    /// Queue strategy: run jobs inline or through the broker worker.
    #[arg(long, default_value = "broker", value_parser = ["inline", "broker"])]
    queue: String,
    /// Retry attempts per job in broker mode.
    #[arg(long, default_value_t = 3)]
    attempts: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let store = Arc::new(Mutex::new(
        ConversationStore::open(&args.db)
            .with_context(|| format!("opening database at {}", args.db))?,
    ));

    let provider = WebhookTargetProvider::from_env(store.clone());
    let notifier = Arc::new(Notifier::new(provider, NotifierConfig::default()));

    let coordinator = IngestionCoordinator::new(store.clone());
    let processor = ConversationProcessor::new(store.clone(), notifier);
    let handlers = Arc::new(PipelineHandlers::new(coordinator, processor));

    let policy = RetryPolicy {
        attempts: args.attempts,
        ..RetryPolicy::default()
    };

    let (runner, worker): (Arc<dyn JobRunner>, _) = match args.queue.as_str() {
        "inline" => (Arc::new(InlineRunner::new(handlers)), None),
        _ => {
            let (runner, worker) = BrokerRunner::start(handlers, policy);
            (runner.clone() as Arc<dyn JobRunner>, Some((runner, worker)))
        }
    };
    let tracker = ConversationTracker::new(runner);

    info!(db = %args.db, queue = %args.queue, "chatvitals worker started");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => match serde_json::from_str::<IngestRequest>(&line) {
                        Ok(request) => match tracker.track(request).await {
                            Ok(()) => accepted += 1,
                            Err(err) => {
                                rejected += 1;
                                warn!("rejected ingestion request: {err}");
                            }
                        },
                        Err(err) => {
                            rejected += 1;
                            warn!("unparseable ingestion request: {err}");
                        }
                    },
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, draining queue");
                break;
            }
        }
    }

    if let Some((broker, worker)) = worker {
        broker.drain();
        if let Err(err) = worker.await {
            error!("queue worker panicked: {err}");
        }
    }

    info!(accepted, rejected, "chatvitals worker finished");
    Ok(())
}
