//! Bitbucket Cloud publisher.
//!
//! API:
//! - POST /repositories/:slug/pullrequests/:id/comments
//!   (summary: content only; inline: content + `inline {path, to|from}`;
//!   reply: content + `parent {id}`)
//! - GET  /repositories/:slug/pullrequests/:id/comments (markers, cursor
//!   pagination)

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::diff::position::{Anchor, AnchorStyle, resolve_anchor};
use crate::errors::{ForgeError, PipelineResult, PositionError};
use crate::model::diff::UnifiedDiff;
use crate::model::response::InlineComment;
use crate::model::{Side, UnifiedComment, UnifiedMergeRequest};
use crate::providers::ProviderConfig;
use crate::publish::{ExistingMarkers, ForgeAnchor};

pub struct BitbucketPublisher {
    http: Client,
    cfg: ProviderConfig,
}

impl BitbucketPublisher {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    /// Bitbucket takes a validated (line, side) pair (`to` = new side,
    /// `from` = old side).
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

    fn comments_url(&self, mr: &UnifiedMergeRequest) -> String {
        format!(
            "{}/repositories/{}/pullrequests/{}/comments",
            self.cfg.base_api, mr.repo.slug, mr.number
        )
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> PipelineResult<()> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.token)
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
        debug!("bitbucket: summary POST");
        self.post_json(
            &self.comments_url(mr),
            &serde_json::json!({ "content": { "raw": body } }),
        )
        .await
    }

    pub async fn post_inline(
        &self,
        mr: &UnifiedMergeRequest,
        c: &InlineComment,
        anchor: &ForgeAnchor,
        body: &str,
    ) -> PipelineResult<()> {
        let ForgeAnchor::Line { line, old_side } = anchor else {
            return Err(ForgeError::InvalidResponse("bitbucket expects line/side".into()).into());
        };
        let inline = if *old_side {
            serde_json::json!({ "path": c.path, "from": line })
        } else {
            serde_json::json!({ "path": c.path, "to": line })
        };
        debug!(path = %c.path, line, old_side, "bitbucket: inline POST");
        self.post_json(
            &self.comments_url(mr),
            &serde_json::json!({ "content": { "raw": body }, "inline": inline }),
        )
        .await
    }

    pub async fn post_reply(
        &self,
        mr: &UnifiedMergeRequest,
        parent: &UnifiedComment,
        body: &str,
    ) -> PipelineResult<()> {
        let parent_id: u64 = parent
            .id
            .parse()
            .map_err(|_| ForgeError::InvalidResponse(format!("bad comment id {}", parent.id)))?;
        debug!(parent = parent_id, "bitbucket: reply POST");
        self.post_json(
            &self.comments_url(mr),
            &serde_json::json!({ "content": { "raw": body }, "parent": { "id": parent_id } }),
        )
        .await
    }

    pub async fn existing_markers(
        &self,
        mr: &UnifiedMergeRequest,
    ) -> PipelineResult<ExistingMarkers> {
        let mut markers = ExistingMarkers::default();
        let mut url = format!("{}?pagelen=100", self.comments_url(mr));
        loop {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.cfg.token)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ForgeError::from_status(status.as_u16(), text).into());
            }
            let page: BbCommentPage = resp
                .json()
                .await
                .map_err(|e| ForgeError::InvalidResponse(e.to_string()))?;
            for c in page.values {
                if let Some(raw) = c.content.and_then(|ct| ct.raw) {
                    markers.absorb(&raw);
                }
            }
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(markers)
    }
}

#[derive(Debug, Deserialize)]
struct BbContentBody {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbCommentEntry {
    content: Option<BbContentBody>,
}

#[derive(Debug, Deserialize)]
struct BbCommentPage {
    values: Vec<BbCommentEntry>,
    next: Option<String>,
}
