//! GitLab publisher.
//!
//! API:
//! - POST /projects/:id/merge_requests/:iid/notes                    (summary)
//! - POST /projects/:id/merge_requests/:iid/discussions              (inline)
//! - POST /projects/:id/merge_requests/:iid/discussions/:id/notes    (reply)
//! - GET  /projects/:id/merge_requests/:iid/discussions              (markers)
//!
//! Inline positions need head/base/start SHAs from MR metadata; `start_sha`
//! travels in the merge request's metadata bag.

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::diff::position::{Anchor, AnchorStyle, resolve_anchor};
use crate::errors::{ForgeError, PipelineResult, PositionError};
use crate::model::diff::UnifiedDiff;
use crate::model::response::InlineComment;
use crate::model::{Side, UnifiedComment, UnifiedMergeRequest};
use crate::providers::ProviderConfig;
use crate::providers::gitlab::META_START_SHA;
use crate::publish::{ExistingMarkers, ForgeAnchor};

const PER_PAGE: usize = 100;

pub struct GitLabPublisher {
    http: Client,
    cfg: ProviderConfig,
}

impl GitLabPublisher {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    fn project_path(&self, mr: &UnifiedMergeRequest) -> String {
        if mr.repo.repo_id.is_empty() {
            urlencoding::encode(&mr.repo.slug).into_owned()
        } else {
            mr.repo.repo_id.clone()
        }
    }

    /// GitLab takes a validated (line, side) pair.
    pub fn resolve(
        &self,
        diff: &UnifiedDiff,
        c: &InlineComment,
    ) -> Result<ForgeAnchor, PositionError> {
        match resolve_anchor(diff, &c.path, c.side, c.line, AnchorStyle::LineSide)? {
            Anchor::LineSide { line, side } => Ok(ForgeAnchor::Line {
                line,
                old_side: side == Side::Old,
            }),
            Anchor::PatchPosition(_) => unreachable!("requested line/side"),
        }
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> PipelineResult<()> {
        let resp = self
            .http
            .post(url)
            .header("PRIVATE-TOKEN", &self.cfg.token)
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
            "{}/projects/{}/merge_requests/{}/notes",
            self.cfg.base_api,
            self.project_path(mr),
            mr.number
        );
        debug!(%url, "gitlab: summary POST");
        self.post_json(&url, &serde_json::json!({ "body": body })).await
    }

    pub async fn post_inline(
        &self,
        mr: &UnifiedMergeRequest,
        c: &InlineComment,
        anchor: &ForgeAnchor,
        body: &str,
    ) -> PipelineResult<()> {
        let ForgeAnchor::Line { line, old_side } = anchor else {
            return Err(ForgeError::InvalidResponse("gitlab expects line/side".into()).into());
        };
        let url = format!(
            "{}/projects/{}/merge_requests/{}/discussions",
            self.cfg.base_api,
            self.project_path(mr),
            mr.number
        );
        let start_sha = mr
            .metadata
            .get(META_START_SHA)
            .cloned()
            .unwrap_or_else(|| mr.base_sha.clone());

        let mut position = serde_json::json!({
            "position_type": "text",
            "head_sha": mr.head_sha,
            "base_sha": mr.base_sha,
            "start_sha": start_sha,
            "new_path": c.path,
        });
        if *old_side {
            position["old_path"] = serde_json::Value::String(c.path.clone());
            position["old_line"] = serde_json::json!(line);
        } else {
            position["new_line"] = serde_json::json!(line);
        }

        debug!(path = %c.path, line, old_side, "gitlab: inline POST");
        self.post_json(&url, &serde_json::json!({ "body": body, "position": position }))
            .await
    }

    /// Replies land in the parent's discussion, which is how GitLab
    /// preserves thread context.
    pub async fn post_reply(
        &self,
        mr: &UnifiedMergeRequest,
        parent: &UnifiedComment,
        body: &str,
    ) -> PipelineResult<()> {
        let Some(discussion_id) = parent.thread_id.as_deref() else {
            return self.post_summary(mr, body).await;
        };
        let url = format!(
            "{}/projects/{}/merge_requests/{}/discussions/{}/notes",
            self.cfg.base_api,
            self.project_path(mr),
            mr.number,
            discussion_id
        );
        debug!(discussion = %discussion_id, "gitlab: reply POST");
        self.post_json(&url, &serde_json::json!({ "body": body })).await
    }

    pub async fn existing_markers(
        &self,
        mr: &UnifiedMergeRequest,
    ) -> PipelineResult<ExistingMarkers> {
        let mut markers = ExistingMarkers::default();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/projects/{}/merge_requests/{}/discussions?per_page={}&page={}",
                self.cfg.base_api,
                self.project_path(mr),
                mr.number,
                PER_PAGE,
                page
            );
            let resp = self
                .http
                .get(&url)
                .header("PRIVATE-TOKEN", &self.cfg.token)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ForgeError::from_status(status.as_u16(), text).into());
            }
            let batch: Vec<GlDiscussionBodies> = resp
                .json()
                .await
                .map_err(|e| ForgeError::InvalidResponse(e.to_string()))?;
            let n = batch.len();
            for d in batch {
                for note in d.notes {
                    if let Some(b) = note.body {
                        markers.absorb(&b);
                    }
                }
            }
            if n < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(markers)
    }
}

#[derive(Debug, Deserialize)]
struct GlNoteBody {
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlDiscussionBodies {
    notes: Vec<GlNoteBody>,
}
