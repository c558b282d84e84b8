use crate::ingest::{IngestError, IngestionCoordinator};
use crate::{ConversationProcessor, PipelineError, ProcessingReport};
use async_trait::async_trait;
use chrono::Utc;
use cvt_core::IngestRequest;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub enum Job {
    Ingest(IngestRequest),
    Process { conversation_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Ingest(_) => "ingest",
            Job::Process { .. } => "process",
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: the base delay doubles after each failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// The job-side face of the pipeline. Both runner strategies invoke the same
/// handlers; an ingest completion chains a process job through the runner that
/// carried it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle_ingest(&self, request: &IngestRequest) -> Result<String, IngestError>;
    async fn handle_process(&self, conversation_id: &str)
        -> Result<ProcessingReport, PipelineError>;
}

pub struct PipelineHandlers {
    coordinator: IngestionCoordinator,
    processor: ConversationProcessor,
}

impl PipelineHandlers {
    pub fn new(coordinator: IngestionCoordinator, processor: ConversationProcessor) -> Self {
        Self {
            coordinator,
            processor,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineHandlers {
    async fn handle_ingest(&self, request: &IngestRequest) -> Result<String, IngestError> {
        self.coordinator.ingest(request, Utc::now()).await
    }

    async fn handle_process(
        &self,
        conversation_id: &str,
    ) -> Result<ProcessingReport, PipelineError> {
        self.processor
            .process_conversation(conversation_id, Utc::now())
            .await
    }
}

/// Queue strategy, selected at construction time: [`InlineRunner`] when no
/// broker is configured, [`BrokerRunner`] otherwise.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Hand a job over. Inline mode executes the job (and anything it chains)
    /// before returning and surfaces its errors; broker mode returns as soon
    /// as the job is enqueued.
    async fn submit(&self, job: Job) -> Result<(), QueueError>;
}

/// Executes jobs synchronously in the caller's flow: a submitted ingest job
/// runs the ingest handler and then the process handler before returning.
pub struct InlineRunner {
    handler: Arc<dyn JobHandler>,
}

impl InlineRunner {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl JobRunner for InlineRunner {
    async fn submit(&self, job: Job) -> Result<(), QueueError> {
        match job {
            Job::Ingest(request) => {
                let conversation_id = self.handler.handle_ingest(&request).await?;
                self.handler.handle_process(&conversation_id).await?;
                Ok(())
            }
            Job::Process { conversation_id } => {
                self.handler.handle_process(&conversation_id).await?;
                Ok(())
            }
        }
    }
}

enum Envelope {
    Job(Job),
    Drain,
}

/// Queue-backed strategy: jobs land on a channel and a worker task consumes
/// them with retry and exponential backoff. A job that exhausts its attempts
/// is dropped with an error log; there is no custom dead-letter path.
pub struct BrokerRunner {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl BrokerRunner {
    pub fn start(
        handler: Arc<dyn JobHandler>,
        policy: RetryPolicy,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_tx = tx.clone();
        let worker = tokio::spawn(async move {
            worker_loop(handler, policy, worker_tx, rx).await;
        });
        (Arc::new(Self { tx }), worker)
    }

    /// Finish everything already enqueued, including jobs enqueued by those
    /// jobs, then let the worker exit.
    pub fn drain(&self) {
        let _ = self.tx.send(Envelope::Drain);
    }
}

#[async_trait]
impl JobRunner for BrokerRunner {
    async fn submit(&self, job: Job) -> Result<(), QueueError> {
        self.tx
            .send(Envelope::Job(job))
            .map_err(|_| QueueError::Closed)
    }
}

async fn worker_loop(
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<Envelope>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut draining = false;
    loop {
        let envelope = if draining {
            match rx.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            }
        } else {
            match rx.recv().await {
                Some(envelope) => envelope,
                None => break,
            }
        };

        match envelope {
            Envelope::Drain => draining = true,
            Envelope::Job(job) => run_with_retry(handler.as_ref(), &policy, &tx, job).await,
        }
    }
}

async fn run_with_retry(
    handler: &dyn JobHandler,
    policy: &RetryPolicy,
    tx: &mpsc::UnboundedSender<Envelope>,
    job: Job,
) {
    for attempt in 1..=policy.attempts {
        let outcome: Result<(), QueueError> = match &job {
            Job::Ingest(request) => match handler.handle_ingest(request).await {
                Ok(conversation_id) => {
                    let _ = tx.send(Envelope::Job(Job::Process { conversation_id }));
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },
            Job::Process { conversation_id } => handler
                .handle_process(conversation_id)
                .await
                .map(|_| ())
                .map_err(QueueError::from),
        };

        match outcome {
            Ok(()) => return,
            Err(QueueError::Ingest(IngestError::Validation(err))) => {
                // Validation does not heal with retries.
                error!("dropping invalid ingest job: {err}");
                return;
            }
            Err(err) if attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    "{} job failed, retrying in {delay:?}: {err}",
                    job.kind()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    "{} job failed after {} attempts: {err}",
                    job.kind(),
                    policy.attempts
                );
            }
        }
    }
}

/// Entry point the external request layer calls. Validation happens before
/// anything is enqueued, so a malformed request is rejected synchronously in
/// both queue modes.
pub struct ConversationTracker {
    runner: Arc<dyn JobRunner>,
}

impl ConversationTracker {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner }
    }

    pub async fn track(&self, request: IngestRequest) -> Result<(), QueueError> {
        request.normalize().map_err(IngestError::Validation)?;
        self.runner.submit(Job::Ingest(request)).await
    }

    pub async fn reprocess(&self, conversation_id: &str) -> Result<(), QueueError> {
        self.runner
            .submit(Job::Process {
                conversation_id: conversation_id.to_string(),
            })
            .await
    }
}
