use serde::Deserialize;

/// Body for POST /api/v1/reviews/manual.
#[derive(Debug, Deserialize)]
pub struct ManualReviewRequest {
    /// MR/PR web URL, e.g. "https://github.com/owner/repo/pull/42".
    pub mr_url: String,
}
