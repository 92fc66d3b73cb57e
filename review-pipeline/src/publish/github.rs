//! GitHub publisher.
//!
//! API:
//! - POST /repos/:slug/issues/:n/comments              (summary)
//! - POST /repos/:slug/pulls/:n/comments               (inline, legacy
//!   position form: line offset within the file's patch)
//! - POST /repos/:slug/pulls/:n/comments/:id/replies   (threaded reply)
//! - GET  /repos/:slug/pulls/:n/comments + issues/:n/comments (markers)

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::diff::position::{AnchorStyle, Anchor, HeaderMode, resolve_anchor};
use crate::errors::{ForgeError, PipelineResult, PositionError};
use crate::model::diff::UnifiedDiff;
use crate::model::response::InlineComment;
use crate::model::{UnifiedComment, UnifiedMergeRequest};
use crate::providers::ProviderConfig;
use crate::publish::{ExistingMarkers, ForgeAnchor};

const PER_PAGE: usize = 100;

pub struct GitHubPublisher {
    http: Client,
    cfg: ProviderConfig,
}

impl GitHubPublisher {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    /// GitHub wants the patch-position integer; headers after the first
    /// hunk count.
    pub fn resolve(
        &self,
        diff: &UnifiedDiff,
        c: &InlineComment,
    ) -> Result<ForgeAnchor, PositionError> {
        match resolve_anchor(
            diff,
            &c.path,
            c.side,
            c.line,
            AnchorStyle::PatchPosition(HeaderMode::Counted),
        )? {
            Anchor::PatchPosition(p) => Ok(ForgeAnchor::Position(p)),
            Anchor::LineSide { .. } => unreachable!("requested patch position"),
        }
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> PipelineResult<()> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.token)
            .header("Accept", "application/vnd.github+json")
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ForgeError::from_status(status.as_u16(), text).into());
        }
        Ok(())
    }

    pub async fn post_summary(&self, mr: &UnifiedMergeRequest, body: &str) -> PipelineResult<()> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        debug!(%url, "github: summary POST");
        self.post_json(&url, &serde_json::json!({ "body": body })).await
    }

    pub async fn post_inline(
        &self,
        mr: &UnifiedMergeRequest,
        c: &InlineComment,
        anchor: &ForgeAnchor,
        body: &str,
    ) -> PipelineResult<()> {
        let ForgeAnchor::Position(position) = anchor else {
            return Err(ForgeError::InvalidResponse("github expects a patch position".into()).into());
        };
        let url = format!(
            "{}/repos/{}/pulls/{}/comments",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        debug!(path = %c.path, position, "github: inline POST");
        self.post_json(
            &url,
            &serde_json::json!({
                "body": body,
                "commit_id": mr.head_sha,
                "path": c.path,
                "position": position,
            }),
        )
        .await
    }

    /// Review-comment replies thread under the root comment; issue
    /// comments have no threading, so those replies post as new issue
    /// comments quoting nothing.
    pub async fn post_reply(
        &self,
        mr: &UnifiedMergeRequest,
        parent: &UnifiedComment,
        body: &str,
    ) -> PipelineResult<()> {
        if parent.position.is_some() {
            let root = parent.thread_id.as_deref().unwrap_or(&parent.id);
            let url = format!(
                "{}/repos/{}/pulls/{}/comments/{}/replies",
                self.cfg.base_api, mr.repo.slug, mr.number, root
            );
            debug!(parent = %root, "github: reply POST");
            self.post_json(&url, &serde_json::json!({ "body": body })).await
        } else {
            self.post_summary(mr, body).await
        }
    }

    pub async fn existing_markers(
        &self,
        mr: &UnifiedMergeRequest,
    ) -> PipelineResult<ExistingMarkers> {
        let mut markers = ExistingMarkers::default();
        for endpoint in ["issues", "pulls"] {
            let mut page = 1usize;
            loop {
                let url = format!(
                    "{}/repos/{}/{}/{}/comments?per_page={}&page={}",
                    self.cfg.base_api, mr.repo.slug, endpoint, mr.number, PER_PAGE, page
                );
                let resp = self
                    .http
                    .get(&url)
                    .bearer_auth(&self.cfg.token)
                    .header("Accept", "application/vnd.github+json")
                    .send()
                    .await?;
                let status = resp.status();
                if !status.is_success() {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(ForgeError::from_status(status.as_u16(), text).into());
                }
                let batch: Vec<GhCommentBody> = resp
                    .json()
                    .await
                    .map_err(|e| ForgeError::InvalidResponse(e.to_string()))?;
                let n = batch.len();
                for c in batch {
                    if let Some(b) = c.body {
                        markers.absorb(&b);
                    }
                }
                if n < PER_PAGE {
                    break;
                }
                page += 1;
            }
        }
        Ok(markers)
    }
}

#[derive(Debug, Deserialize)]
struct GhCommentBody {
    body: Option<String>,
}
