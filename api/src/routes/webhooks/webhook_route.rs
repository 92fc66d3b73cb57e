//! POST /api/v1/webhooks/:provider/:connector_id
//!
//! The webhook orchestrator: read raw headers + body, pick the provider by
//! header detection, gate on the connector's webhook secret, convert to a
//! unified event, then either answer a reviewer reply on the short-latency
//! path or enqueue a durable review job. The handler always returns a
//! terminal status quickly; long work goes to the queue.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{debug, info, warn};

use review_pipeline::model::EventKind;
use review_pipeline::providers::{self, ConvertContext};
use review_pipeline::worker::{self, JobPayload};

use crate::core::app_state::AppState;
use crate::error_handler::{AppError, AppResult};

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path((provider_segment, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    // 1) Header-only provider detection against the registry.
    let hooks = providers::detect(&headers)
        .ok_or_else(|| AppError::BadRequest("no provider claims this request".into()))?;
    if hooks.kind.as_str() != provider_segment {
        return Err(AppError::BadRequest(format!(
            "payload headers identify {}, endpoint is {}",
            hooks.kind, provider_segment
        )));
    }

    // 2) Connector + signature gate. No secret configured → accept with a
    //    warning (manual-trigger compatibility).
    let connector = state
        .store
        .connector(hooks.kind.as_str(), &connector_id)
        .await?;
    match state
        .store
        .webhook_secret(hooks.kind.as_str(), &connector_id)
        .await?
    {
        Some(secret) => {
            if let Some(sig) = &hooks.signature {
                (sig.verify)(&headers, &body, &secret).map_err(|e| {
                    warn!(provider = %hooks.kind, connector = %connector_id, error = %e,
                          "webhook signature rejected");
                    AppError::InvalidSignature
                })?;
            }
        }
        None => {
            warn!(provider = %hooks.kind, connector = %connector_id,
                  "no webhook secret configured, accepting unsigned request");
        }
    }

    // 3) Convert. Recognized-but-irrelevant events are acknowledged as-is.
    let ctx = ConvertContext {
        connector_id: &connector_id,
        api_base: &connector.api_base,
        bot_user_id: &connector.bot_user_id,
    };
    let Some(event) = (hooks.convert)(ctx, &headers, &body)? else {
        debug!(provider = %hooks.kind, "event discarded by conversion");
        return Ok(Json(serde_json::json!({ "accepted": true })));
    };

    // 4) Classify: comment events may be answered inline; review triggers
    //    are enqueued.
    match event.kind {
        EventKind::IssueComment | EventKind::ReviewComment => {
            let store = state.store.clone();
            let llm = Arc::clone(&state.llm);
            let budget = state.reply_budget;
            tokio::spawn(async move {
                let res = tokio::time::timeout(
                    budget,
                    worker::handle_comment_inline(&store, &llm, &event),
                )
                .await;
                match res {
                    Ok(Ok(true)) => info!("reviewer reply answered inline"),
                    Ok(Ok(false)) => debug!("comment event ignored by warrant"),
                    Ok(Err(e)) => warn!(error = %e, "inline reply path failed"),
                    Err(_) => warn!("inline reply path exceeded its budget"),
                }
            });
        }
        _ => {
            let key = event.merge_request.idempotency_key(event.kind);
            let payload = serde_json::to_string(&JobPayload { event })
                .map_err(|e| AppError::Storage(e.to_string()))?;
            let job_id = state.store.enqueue(&key, &payload).await?;
            state.notify.notify_one();
            info!(%job_id, %key, "review job enqueued");
        }
    }

    Ok(Json(serde_json::json!({ "accepted": true })))
}
