use serde::Serialize;

/// 202 body for an accepted manual trigger.
#[derive(Debug, Serialize)]
pub struct ManualReviewResponse {
    pub job_id: String,
}
