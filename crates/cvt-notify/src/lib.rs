use chrono::{DateTime, Duration, Utc};
use cvt_core::FailureKind;
use cvt_storage::ConversationStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_LOW_HEALTH_THRESHOLD: i64 = 40;
pub const WEBHOOK_CACHE_TTL_MS: i64 = 60_000;

pub const WEBHOOK_URL_ENV: &str = "CHATVITALS_WEBHOOK_URL";
pub const BASE_URL_ENV: &str = "CHATVITALS_BASE_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:3000";

/// Time source for the webhook-target cache. Injected so tests advance time
/// explicitly instead of waiting out the TTL.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct CachedTarget {
    url: Option<String>,
    expires_at: DateTime<Utc>,
}

/// Resolves the outbound webhook target: the stored settings value wins, the
/// environment default fills in when no value is stored, and the resolved
/// answer (including "nothing configured") is cached for a short TTL to avoid
/// a store round-trip per alert.
pub struct WebhookTargetProvider {
    store: Arc<Mutex<ConversationStore>>,
    env_fallback: Option<String>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedTarget>>,
}

impl WebhookTargetProvider {
    pub fn new(
        store: Arc<Mutex<ConversationStore>>,
        env_fallback: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            env_fallback,
            ttl: Duration::milliseconds(WEBHOOK_CACHE_TTL_MS),
            clock,
            cached: Mutex::new(None),
        }
    }

    /// Standard wiring: environment fallback from `CHATVITALS_WEBHOOK_URL`,
    /// wall-clock time.
    pub fn from_env(store: Arc<Mutex<ConversationStore>>) -> Self {
        Self::new(
            store,
            std::env::var(WEBHOOK_URL_ENV).ok(),
            Arc::new(SystemClock),
        )
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn webhook_url(&self) -> Option<String> {
        let now = self.clock.now();

        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > now {
                return entry.url.clone();
            }
        }

        let stored = match self.store.lock().await.webhook_url() {
            Ok(url) => url,
            Err(err) => {
                warn!("webhook target lookup failed, using env fallback: {err}");
                None
            }
        };
        let resolved = stored.or_else(|| self.env_fallback.clone());

        *cached = Some(CachedTarget {
            url: resolved.clone(),
            expires_at: now + self.ttl,
        });
        resolved
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub low_health_threshold: i64,
    pub dashboard_base_url: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            low_health_threshold: DEFAULT_LOW_HEALTH_THRESHOLD,
            dashboard_base_url: std::env::var(BASE_URL_ENV)
                .ok()
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

/// Best-effort alert delivery. Every operation swallows its failures and
/// reports only a boolean so callers can record delivery without ever failing
/// processing on it.
pub struct Notifier {
    client: reqwest::Client,
    provider: WebhookTargetProvider,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(provider: WebhookTargetProvider, config: NotifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            config,
        }
    }

    /// Announce a newly detected failure. Returns whether the webhook accepted
    /// the message; `false` covers both delivery failure and "no target
    /// configured".
    pub async fn alert_failure(&self, conversation_id: &str, kind: FailureKind) -> bool {
        let payload = failure_payload(&self.config.dashboard_base_url, conversation_id, kind);
        self.send(payload).await
    }

    /// Announce a low health score. Scores at or above the threshold
    /// short-circuit as delivered without sending anything.
    pub async fn alert_low_health(&self, conversation_id: &str, score: i64) -> bool {
        if score >= self.config.low_health_threshold {
            return true;
        }
        let payload = low_health_payload(
            &self.config.dashboard_base_url,
            conversation_id,
            score,
            self.config.low_health_threshold,
        );
        self.send(payload).await
    }

    async fn send(&self, payload: Value) -> bool {
        let Some(url) = self.provider.webhook_url().await else {
            debug!("no webhook target configured, skipping alert");
            return false;
        };

        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("webhook rejected alert: {}", response.status());
                false
            }
            Err(err) => {
                warn!("webhook delivery failed: {err}");
                false
            }
        }
    }
}

pub fn failure_payload(base_url: &str, conversation_id: &str, kind: FailureKind) -> Value {
    let link = conversations_link(base_url);
    json!({
        "text": format!(":rotating_light: New failure detected: {kind} (conversation {conversation_id})"),
        "blocks": [
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*New failure* • *{kind}*") }
            },
            {
                "type": "context",
                "elements": [
                    { "type": "mrkdwn", "text": format!("Conversation: {conversation_id}") }
                ]
            },
            {
                "type": "actions",
                "elements": [
                    {
                        "type": "button",
                        "text": { "type": "plain_text", "text": "View conversations" },
                        "url": link
                    }
                ]
            }
        ]
    })
}

pub fn low_health_payload(
    base_url: &str,
    conversation_id: &str,
    score: i64,
    threshold: i64,
) -> Value {
    let link = conversations_link(base_url);
    json!({
        "text": format!(":thermometer: Low conversation health: {score} (conversation {conversation_id})"),
        "blocks": [
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Low health* • Score: *{score}* (< {threshold})") }
            },
            {
                "type": "context",
                "elements": [
                    { "type": "mrkdwn", "text": format!("Conversation: {conversation_id}") }
                ]
            },
            {
                "type": "actions",
                "elements": [
                    {
                        "type": "button",
                        "text": { "type": "plain_text", "text": "View conversations" },
                        "url": link
                    }
                ]
            }
        ]
    })
}

fn conversations_link(base_url: &str) -> String {
    format!("{}/conversations", base_url.trim_end_matches('/'))
}
