//! Worker pool: lease review jobs, run the pipeline, post the results.
//!
//! Each worker is a Tokio task on the shared store. The loop:
//! lease → fetch context → warrant → build context → plan → run → post →
//! complete, with every failure routed through the error taxonomy into
//! job-level retry or discard.
//!
//! Guarantees:
//! - bounded polling (1 s default) plus a [`Notify`] wakeup from enqueue so
//!   idle workers don't hammer the queue;
//! - a per-job wall-clock budget (10 min default); an expired budget fails
//!   the job with a retryable error;
//! - per-MR posting serialization via an in-process advisory lock keyed by
//!   the MR fingerprint, with a head-SHA re-check inside the lock: results
//!   captured for a superseded head are discarded with an audit event, not
//!   posted;
//! - lease loss ends the iteration immediately without posting anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use llm_service::ResilientLlmClient;
use review_store::Store;
use review_store::events::EventKind as AuditKind;
use review_store::jobs::ReviewJob;

use crate::errors::{ConfigError, Error, PipelineResult};
use crate::learning;
use crate::model::{ProviderKind, UnifiedEvent};
use crate::processor::plan::PlanConfig;
use crate::processor::{self, Scenario, context::ContextConfig, run::PassState};
use crate::providers::{ProviderClient, ProviderConfig};
use crate::publish;

/// Worker pool knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Wall-clock budget for one job.
    pub job_budget: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            poll_interval: Duration::from_secs(1),
            // Lease outlives the job budget so a slow-but-alive worker is
            // not raced by a reclaiming peer.
            lease_duration: Duration::from_secs(12 * 60),
            job_budget: Duration::from_secs(10 * 60),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LIVEREVIEW_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.pool_size = n.clamp(1, 64);
            }
        }
        if let Ok(v) = std::env::var("LIVEREVIEW_JOB_BUDGET_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.job_budget = Duration::from_secs(n.max(30));
            }
        }
        cfg
    }
}

/// What the orchestrator enqueues: the converted event, verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub event: UnifiedEvent,
}

lazy_static! {
    /// Advisory locks serializing post-to-forge per MR fingerprint.
    static ref MR_LOCKS: Mutex<HashMap<String, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());
}

async fn mr_lock(fingerprint: &str) -> Arc<Mutex<()>> {
    let mut map = MR_LOCKS.lock().await;
    map.entry(fingerprint.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Spawns the worker pool. Workers run until `shutdown` flips to true and
/// the current job (if any) finishes.
pub fn spawn_workers(
    store: Store,
    llm: Arc<ResilientLlmClient>,
    notify: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    cfg: WorkerConfig,
) -> Vec<JoinHandle<()>> {
    (0..cfg.pool_size)
        .map(|i| {
            let store = store.clone();
            let llm = Arc::clone(&llm);
            let notify = Arc::clone(&notify);
            let mut shutdown = shutdown.clone();
            let cfg = cfg.clone();
            let worker_id = format!("worker-{i}-{}", uuid::Uuid::new_v4());
            tokio::spawn(async move {
                info!(worker = %worker_id, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match store.lease(&worker_id, cfg.lease_duration).await {
                        Ok(Some(job)) => {
                            run_leased_job(&store, &llm, &worker_id, &job, &cfg).await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = notify.notified() => {}
                                _ = tokio::time::sleep(cfg.poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(e) => {
                            warn!(worker = %worker_id, error = %e, "lease query failed");
                            tokio::time::sleep(cfg.poll_interval).await;
                        }
                    }
                }
                info!(worker = %worker_id, "worker stopped");
            })
        })
        .collect()
}

/// Runs one leased job end to end and settles it (complete/fail).
async fn run_leased_job(
    store: &Store,
    llm: &Arc<ResilientLlmClient>,
    worker_id: &str,
    job: &ReviewJob,
    cfg: &WorkerConfig,
) {
    let started = Instant::now();
    info!(worker = %worker_id, job_id = %job.id, attempt = job.attempt, "job picked");

    let outcome = tokio::time::timeout(cfg.job_budget, process_job(store, llm, job)).await;
    let result = match outcome {
        Ok(r) => r,
        Err(_) => Err(Error::Budget(format!(
            "job exceeded {}s wall-clock budget",
            cfg.job_budget.as_secs()
        ))),
    };

    match result {
        Ok(()) => {
            if let Err(e) = store.complete(&job.id, worker_id).await {
                // Lease lost after the work happened; posting was
                // idempotent, so stop quietly.
                warn!(job_id = %job.id, error = %e, "complete failed");
            } else {
                info!(
                    job_id = %job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job done"
                );
            }
        }
        Err(Error::State(msg)) => {
            warn!(job_id = %job.id, %msg, "state error, ending iteration without posting");
        }
        Err(e) => {
            let retryable = e.is_retryable();
            if let Err(fe) = store.fail(&job.id, worker_id, &e.to_string(), retryable).await {
                warn!(job_id = %job.id, error = %fe, "fail() could not settle job");
            }
        }
    }
}

/// The pipeline for one job.
async fn process_job(
    store: &Store,
    llm: &Arc<ResilientLlmClient>,
    job: &ReviewJob,
) -> PipelineResult<()> {
    let payload: JobPayload = serde_json::from_str(&job.payload)
        .map_err(|e| Error::State(format!("job payload unreadable: {e}")))?;
    let event = payload.event;
    let review_id = &job.id;

    let connector = store
        .connector(event.provider.as_str(), &event.connector_id)
        .await?;
    if !connector.enabled {
        return Err(ConfigError::ConnectorDisabled(event.connector_id.clone()).into());
    }
    let provider_cfg = ProviderConfig::from_connector(event.provider, &connector);
    let client = ProviderClient::from_config(&provider_cfg)?;

    // Refresh context; the captured head decides what this pass reviews.
    let ctx = client.fetch_context(&event.merge_request).await?;
    let mr = ctx.merge_request.clone();
    let captured_head = mr.head_sha.clone();
    debug!(job_id = %review_id, head = %captured_head, "context fetched");

    let mut working_event = event.clone();
    working_event.merge_request = mr.clone();

    let (should_respond, scenario) =
        processor::warrant(&working_event, &ctx.timeline, &provider_cfg.bot_user_id);
    if !should_respond {
        debug!(job_id = %review_id, "warrant says ignore");
        return Ok(());
    }

    if scenario == Scenario::ReplyToReviewer {
        return reply_path(&provider_cfg, llm, &working_event, &ctx).await;
    }

    let review_ctx = processor::context::build_context(
        &working_event,
        &mr,
        &ctx.diff,
        &ctx.timeline,
        &ContextConfig::default(),
    );
    let plan_cfg = PlanConfig::from_env();
    let plan = processor::plan::plan(&review_ctx.diff, &plan_cfg);

    let learnings = store
        .learnings(mr.repo.provider.as_str(), &mr.repo.repo_id, 10)
        .await
        .unwrap_or_default();

    let (response, state) = processor::run::run(
        &review_ctx,
        &plan,
        llm,
        store,
        review_id,
        &learnings,
        &plan_cfg,
    )
    .await?;

    if response.inline_comments.is_empty() && state == PassState::Partial {
        // Nothing usable came back; let the job retry.
        return Err(Error::Budget("no batch produced results".into()));
    }

    // Serialize posting per MR; a newer head must not interleave with an
    // older in-flight pass.
    let lock = mr_lock(&mr.fingerprint()).await;
    let _guard = lock.lock().await;

    let current = client.fetch_meta(&mr).await?;
    if current.head_sha != captured_head {
        store
            .record_event(
                review_id,
                AuditKind::Posted,
                &serde_json::json!({
                    "discarded_stale_head": captured_head,
                    "current_head": current.head_sha,
                }),
            )
            .await?;
        info!(job_id = %review_id, "head moved since capture, results discarded");
        return Ok(());
    }

    publish::post_review(&provider_cfg, &mr, &ctx.diff, &response, store, review_id).await?;

    // Post-hoc learning extraction; never blocks review posting.
    {
        let store = store.clone();
        let mr = mr.clone();
        let timeline = ctx.timeline.clone();
        tokio::spawn(async move {
            if let Err(e) = learning::extract_learnings(&store, &mr, &timeline).await {
                warn!(error = %e, "learning extraction failed");
            }
        });
    }

    Ok(())
}

/// Short-latency path used by the webhook orchestrator for comment
/// events: fetch context, run the warrant, and — when the comment is a
/// reviewer reply to a bot comment — answer with a single-turn LLM call.
///
/// Returns `true` when a reply was posted, `false` when the warrant said
/// ignore.
pub async fn handle_comment_inline(
    store: &Store,
    llm: &Arc<ResilientLlmClient>,
    event: &UnifiedEvent,
) -> PipelineResult<bool> {
    let connector = store
        .connector(event.provider.as_str(), &event.connector_id)
        .await?;
    if !connector.enabled {
        return Err(ConfigError::ConnectorDisabled(event.connector_id.clone()).into());
    }
    let provider_cfg = ProviderConfig::from_connector(event.provider, &connector);
    let client = ProviderClient::from_config(&provider_cfg)?;
    let ctx = client.fetch_context(&event.merge_request).await?;

    let mut working_event = event.clone();
    working_event.merge_request = ctx.merge_request.clone();

    let (should_respond, scenario) =
        processor::warrant(&working_event, &ctx.timeline, &provider_cfg.bot_user_id);
    if !should_respond || scenario != Scenario::ReplyToReviewer {
        return Ok(false);
    }
    reply_path(&provider_cfg, llm, &working_event, &ctx).await?;
    Ok(true)
}

/// The lighter single-turn path for reply-to-reviewer scenarios.
async fn reply_path(
    provider_cfg: &ProviderConfig,
    llm: &Arc<ResilientLlmClient>,
    event: &UnifiedEvent,
    ctx: &crate::providers::MrContext,
) -> PipelineResult<()> {
    let comment = event
        .comment
        .as_ref()
        .ok_or_else(|| Error::State("reply scenario without a comment".into()))?;
    let resolved = ctx.timeline.find(&comment.id).unwrap_or(comment);

    let thread_key = resolved
        .thread_id
        .clone()
        .or_else(|| resolved.parent_id.clone())
        .unwrap_or_else(|| resolved.id.clone());
    let thread = ctx.timeline.thread(&thread_key);

    let prompt =
        processor::build_reply_prompt(&thread, resolved, &event.merge_request.title);
    let invoked = llm
        .invoke::<ReplyText>(&prompt, Some(REPLY_SYSTEM_PROMPT))
        .await?;

    publish::post_reply(
        provider_cfg,
        &event.merge_request,
        resolved,
        invoked.value.reply.trim(),
    )
    .await
}

const REPLY_SYSTEM_PROMPT: &str = "\
You are a code review assistant. Return ONLY JSON: {\"reply\": \"...\"} — \
the Markdown body of your reply, nothing else.";

/// Schema for the single-turn reply call.
#[derive(Debug, Deserialize)]
struct ReplyText {
    reply: String,
}

/// Convenience used by the orchestrator: is this provider kind valid for a
/// manual-trigger URL?
pub fn provider_for_manual_url(url: &str) -> Option<(ProviderKind, String, u64)> {
    // https://github.com/owner/repo/pull/42
    // https://gitlab.com/group/project/-/merge_requests/12
    // https://bitbucket.org/workspace/repo/pull-requests/8
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://github.com/") {
        let (slug, n) = rest.split_once("/pull/")?;
        return Some((ProviderKind::GitHub, slug.to_string(), n.parse().ok()?));
    }
    if let Some(rest) = trimmed.strip_prefix("https://gitlab.com/") {
        let (slug, n) = rest.split_once("/-/merge_requests/")?;
        return Some((ProviderKind::GitLab, slug.to_string(), n.parse().ok()?));
    }
    if let Some(rest) = trimmed.strip_prefix("https://bitbucket.org/") {
        let (slug, n) = rest.split_once("/pull-requests/")?;
        return Some((ProviderKind::Bitbucket, slug.to_string(), n.parse().ok()?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_url_parsing() {
        assert_eq!(
            provider_for_manual_url("https://github.com/acme/api/pull/42"),
            Some((ProviderKind::GitHub, "acme/api".into(), 42))
        );
        assert_eq!(
            provider_for_manual_url("https://gitlab.com/team/app/-/merge_requests/12/"),
            Some((ProviderKind::GitLab, "team/app".into(), 12))
        );
        assert_eq!(
            provider_for_manual_url("https://bitbucket.org/ws/app/pull-requests/8"),
            Some((ProviderKind::Bitbucket, "ws/app".into(), 8))
        );
        assert!(provider_for_manual_url("https://example.com/x").is_none());
        assert!(provider_for_manual_url("https://github.com/acme/api/issues/42").is_none());
    }

    #[tokio::test]
    async fn mr_locks_are_shared_per_fingerprint() {
        let a = mr_lock("github:1:7").await;
        let b = mr_lock("github:1:7").await;
        let c = mr_lock("github:1:8").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err(), "same fingerprint serializes");
        assert!(c.try_lock().is_ok(), "different MR unaffected");
    }

    #[test]
    fn job_payload_roundtrip() {
        use crate::model::*;
        let event = UnifiedEvent {
            kind: EventKind::ManualTrigger,
            provider: ProviderKind::GitHub,
            connector_id: "c1".into(),
            merge_request: UnifiedMergeRequest {
                repo: RepoDescriptor {
                    provider: ProviderKind::GitHub,
                    repo_id: "1".into(),
                    slug: "o/r".into(),
                    api_base: "x".into(),
                },
                number: 5,
                title: "t".into(),
                description: None,
                source_branch: "s".into(),
                target_branch: "m".into(),
                head_sha: "h".into(),
                base_sha: "b".into(),
                author: UnifiedUser {
                    provider_id: "1".into(),
                    login: "u".into(),
                    display_name: None,
                    is_bot: false,
                },
                metadata: Default::default(),
            },
            comment: None,
            raw_capture: None,
        };
        let json = serde_json::to_string(&JobPayload { event }).unwrap();
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event.kind, EventKind::ManualTrigger);
        assert_eq!(back.event.merge_request.number, 5);
    }
}
