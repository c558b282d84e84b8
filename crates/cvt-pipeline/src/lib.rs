pub mod ingest;
pub mod queue;

pub use ingest::{IngestError, IngestionCoordinator};
pub use queue::{
    BrokerRunner, ConversationTracker, InlineRunner, Job, JobHandler, JobRunner, PipelineHandlers,
    QueueError, RetryPolicy,
};

use chrono::{DateTime, Utc};
use cvt_notify::Notifier;
use cvt_scoring::{infer_failures, score_simple};
use cvt_storage::{ConversationStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of one processing invocation, for logs and tests. Stage failures
/// that the pipeline absorbs show up here as cleared flags, not errors.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingReport {
    pub conversation_id: String,
    pub score: i64,
    pub clarifications: usize,
    pub failures_recorded: usize,
    pub failure_alerts_sent: usize,
    pub low_health_alerted: bool,
    pub embedded: bool,
    pub patterns_detected: usize,
}

/// Runs the per-conversation analysis chain: score, persist, alert, embed,
/// classify. Stages after the health-score write are individually
/// fault-tolerant; an embedding or pattern failure never rolls back what
/// earlier stages committed.
pub struct ConversationProcessor {
    store: Arc<Mutex<ConversationStore>>,
    notifier: Arc<Notifier>,
}

impl ConversationProcessor {
    pub fn new(store: Arc<Mutex<ConversationStore>>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn process_conversation(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProcessingReport, PipelineError> {
        let messages = self
            .store
            .lock()
            .await
            .messages_for_conversation(conversation_id)?;

        let scored = score_simple(&messages);
        let failures = infer_failures(&messages, now);

        // The score write is the one stage whose failure aborts: everything
        // after it assumes a scored conversation, and the job layer retries.
        self.store
            .lock()
            .await
            .set_health_score(conversation_id, scored.score, now)?;

        let mut report = ProcessingReport {
            conversation_id: conversation_id.to_string(),
            score: scored.score,
            clarifications: scored.clarifications,
            ..ProcessingReport::default()
        };

        report.low_health_alerted = self
            .notifier
            .alert_low_health(conversation_id, scored.score)
            .await;

        if !failures.is_empty() {
            // Bind the insert result first: the alert calls below re-enter the
            // store through the notifier's target lookup.
            let inserted = self
                .store
                .lock()
                .await
                .insert_failures(conversation_id, &failures);
            match inserted {
                Ok(failure_ids) => {
                    report.failures_recorded = failure_ids.len();

                    let mut alerted = Vec::new();
                    for (failure_id, failure) in failure_ids.iter().zip(&failures) {
                        if self
                            .notifier
                            .alert_failure(conversation_id, failure.kind)
                            .await
                        {
                            alerted.push(failure_id.clone());
                        }
                    }
                    report.failure_alerts_sent = alerted.len();

                    if !alerted.is_empty() {
                        if let Err(err) = self.store.lock().await.mark_failures_alerted(&alerted) {
                            warn!(%conversation_id, "failed to mark failures alerted: {err}");
                        }
                    }
                }
                Err(err) => {
                    warn!(%conversation_id, "failed to record failures: {err}");
                }
            }
        }

        match cvt_embedding::embed_conversation(
            &*self.store.lock().await,
            conversation_id,
            &messages,
            now,
        ) {
            Ok(_) => report.embedded = true,
            Err(err) => warn!(%conversation_id, "embedding stage failed: {err}"),
        }

        match cvt_patterns::record_patterns(
            &*self.store.lock().await,
            conversation_id,
            &messages,
            now,
        ) {
            Ok(patterns) => report.patterns_detected = patterns.detected.len(),
            Err(err) => warn!(%conversation_id, "pattern stage failed: {err}"),
        }

        info!(
            %conversation_id,
            score = report.score,
            failures = report.failures_recorded,
            patterns = report.patterns_detected,
            "processed conversation"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvt_notify::{NotifierConfig, WebhookTargetProvider};
    use chrono::TimeZone;

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_000_000_000 + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn silent_notifier(store: Arc<Mutex<ConversationStore>>) -> Arc<Notifier> {
        // No stored target, no env fallback: every send resolves to "not
        // delivered" without any network traffic.
        let provider = WebhookTargetProvider::new(store, None, Arc::new(cvt_notify::SystemClock));
        Arc::new(Notifier::new(provider, NotifierConfig {
            low_health_threshold: cvt_notify::DEFAULT_LOW_HEALTH_THRESHOLD,
            dashboard_base_url: "http://localhost:3000".to_string(),
        }))
    }

    #[tokio::test]
    async fn processing_a_missing_conversation_fails_at_the_score_write() {
        let store = Arc::new(Mutex::new(
            ConversationStore::open_in_memory().expect("open db"),
        ));
        let processor = ConversationProcessor::new(store.clone(), silent_notifier(store));

        let err = processor
            .process_conversation("missing-conv", ts(0))
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::MissingConversation(_))
        ));
    }
}
