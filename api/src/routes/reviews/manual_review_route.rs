//! POST /api/v1/reviews/manual
//!
//! Manual trigger by MR/PR URL. Unlike webhooks (which must stay
//! at-least-once), manual triggers are shed with 503 when the queue depth
//! is over the watermark.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use tracing::info;

use review_pipeline::model::{
    EventKind, RepoDescriptor, UnifiedEvent, UnifiedMergeRequest, UnifiedUser,
};
use review_pipeline::worker::{JobPayload, provider_for_manual_url};

use crate::core::app_state::AppState;
use crate::error_handler::{AppError, AppResult};
use crate::routes::reviews::manual_review_request::ManualReviewRequest;
use crate::routes::reviews::manual_review_response::ManualReviewResponse;

pub async fn trigger_manual_review(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ManualReviewRequest>,
) -> AppResult<(StatusCode, Json<ManualReviewResponse>)> {
    if state.store.queue_depth().await? > state.queue_watermark {
        return Err(AppError::Backpressure);
    }

    let (provider, slug, number) = provider_for_manual_url(&req.mr_url)
        .ok_or_else(|| AppError::BadRequest(format!("unrecognized MR URL: {}", req.mr_url)))?;

    let connector = state.store.default_connector(provider.as_str()).await?;

    // A skeleton MR record: the worker refreshes metadata (head SHA
    // included) before reviewing, so only the coordinates matter here.
    let merge_request = UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider,
            repo_id: slug.clone(),
            slug,
            api_base: connector.api_base.clone(),
        },
        number,
        title: String::new(),
        description: None,
        source_branch: String::new(),
        target_branch: String::new(),
        head_sha: String::new(),
        base_sha: String::new(),
        author: UnifiedUser {
            provider_id: String::new(),
            login: String::new(),
            display_name: None,
            is_bot: false,
        },
        metadata: Default::default(),
    };
    let event = UnifiedEvent {
        kind: EventKind::ManualTrigger,
        provider,
        connector_id: connector.id.clone(),
        merge_request,
        comment: None,
        raw_capture: None,
    };

    let key = event.merge_request.idempotency_key(event.kind);
    let payload =
        serde_json::to_string(&JobPayload { event }).map_err(|e| AppError::Storage(e.to_string()))?;
    let job_id = state.store.enqueue(&key, &payload).await?;
    state.notify.notify_one();
    info!(%job_id, url = %req.mr_url, "manual review enqueued");

    Ok((StatusCode::ACCEPTED, Json(ManualReviewResponse { job_id })))
}
