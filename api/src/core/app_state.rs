use std::sync::Arc;

use llm_service::ResilientLlmClient;
use review_store::Store;
use tokio::sync::Notify;

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    /// Source of truth for jobs, events, and the connector registry.
    pub store: Store,
    /// Resilient LLM client shared with the worker pool.
    pub llm: Arc<ResilientLlmClient>,
    /// Wakes idle workers right after an enqueue.
    pub notify: Arc<Notify>,
    /// Queue depth above which manual triggers get 503.
    pub queue_watermark: i64,
    /// Webhook handler budget for the inline reply path.
    pub reply_budget: std::time::Duration,
}
