//! Bitbucket Cloud provider (API 2.0) — detection, webhook conversion,
//! context fetch.
//!
//! Webhook events handled (`X-Event-Key`):
//! - `pullrequest:created` / `pullrequest:updated`
//! - `pullrequest:comment_created`
//!
//! Fetch endpoints:
//! - GET /repositories/:slug/pullrequests/:id
//! - GET /repositories/:slug/pullrequests/:id/diff      (raw unified patch)
//! - GET /repositories/:slug/pullrequests/:id/comments  (cursor-paginated)

use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::diff::parse_patch;
use crate::errors::{ConversionError, ForgeError, PipelineResult, SignatureError};
use crate::model::diff::UnifiedDiff;
use crate::model::{
    CommentPosition, EventKind, ProviderKind, RepoDescriptor, Side, UnifiedComment, UnifiedEvent,
    UnifiedMergeRequest, UnifiedTimeline, UnifiedUser,
};
use crate::providers::{ConvertContext, MrContext, ProviderConfig, signature};

/// Header-only detection: Bitbucket always sends `X-Event-Key`.
pub fn detect(headers: &HeaderMap) -> bool {
    headers.contains_key("x-event-key")
}

/// `X-Hub-Signature: sha256=<hex>` over the raw body.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(), SignatureError> {
    let header = headers
        .get("x-hub-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader("X-Hub-Signature"))?;
    let hex = header
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    signature::verify_hmac_hex(secret, body, hex)
}

/// Payload → unified event.
pub fn convert(
    ctx: ConvertContext<'_>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<UnifiedEvent>, ConversionError> {
    let event = headers
        .get("x-event-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ConversionError::MissingField("X-Event-Key", "bitbucket"))?;

    let raw: serde_json::Value = serde_json::from_slice(body)?;

    match event {
        "pullrequest:created" | "pullrequest:updated" => {
            let payload: PullRequestPayload = shape(raw, event)?;
            let kind = if event == "pullrequest:created" {
                EventKind::NewMergeRequest
            } else {
                EventKind::UpdatedMergeRequest
            };
            Ok(Some(UnifiedEvent {
                kind,
                provider: ProviderKind::Bitbucket,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_pr(&ctx, &payload.pullrequest, &payload.repository),
                comment: None,
                raw_capture: Some(String::from_utf8_lossy(body).into_owned()),
            }))
        }
        "pullrequest:comment_created" => {
            let payload: CommentPayload = shape(raw, event)?;
            let c = &payload.comment;
            let position = c.inline.as_ref().and_then(|i| {
                if let Some(line) = i.to {
                    Some(CommentPosition {
                        path: i.path.clone(),
                        side: Side::New,
                        line,
                    })
                } else {
                    i.from.map(|line| CommentPosition {
                        path: i.path.clone(),
                        side: Side::Old,
                        line,
                    })
                }
            });
            let kind = if position.is_some() {
                EventKind::ReviewComment
            } else {
                EventKind::IssueComment
            };
            let parent_id = c.parent.as_ref().map(|p| p.id.to_string());
            let comment = UnifiedComment {
                id: c.id.to_string(),
                author: unify_user(&ctx, &c.user),
                body: c.content.raw.clone().unwrap_or_default(),
                created_at: c.created_on.unwrap_or_else(Utc::now),
                position,
                thread_id: parent_id.clone(),
                parent_id,
                in_reply_to_bot: false,
            };
            Ok(Some(UnifiedEvent {
                kind,
                provider: ProviderKind::Bitbucket,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_pr(&ctx, &payload.pullrequest, &payload.repository),
                comment: Some(comment),
                raw_capture: Some(String::from_utf8_lossy(body).into_owned()),
            }))
        }
        _ => Ok(None),
    }
}

fn shape<T: serde::de::DeserializeOwned>(
    raw: serde_json::Value,
    event: &str,
) -> Result<T, ConversionError> {
    serde_json::from_value(raw).map_err(|e| ConversionError::ShapeMismatch {
        event: event.to_string(),
        detail: e.to_string(),
    })
}

fn unify_user(ctx: &ConvertContext<'_>, u: &BbUser) -> UnifiedUser {
    let id = u.uuid.clone().unwrap_or_default();
    UnifiedUser {
        is_bot: !id.is_empty() && id == ctx.bot_user_id,
        provider_id: id,
        login: u.nickname.clone().or_else(|| u.display_name.clone()).unwrap_or_default(),
        display_name: u.display_name.clone(),
    }
}

fn unify_pr(ctx: &ConvertContext<'_>, pr: &BbPullRequest, repo: &BbRepo) -> UnifiedMergeRequest {
    UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider: ProviderKind::Bitbucket,
            repo_id: repo.uuid.clone().unwrap_or_else(|| repo.full_name.clone()),
            slug: repo.full_name.clone(),
            api_base: ctx.api_base.to_string(),
        },
        number: pr.id,
        title: pr.title.clone().unwrap_or_default(),
        description: pr.description.clone(),
        source_branch: pr.source.branch.name.clone(),
        target_branch: pr.destination.branch.name.clone(),
        head_sha: pr.source.commit.as_ref().map(|c| c.hash.clone()).unwrap_or_default(),
        base_sha: pr
            .destination
            .commit
            .as_ref()
            .map(|c| c.hash.clone())
            .unwrap_or_default(),
        author: unify_user(ctx, &pr.author),
        metadata: Default::default(),
    }
}

/* ===========================================================================
Context fetch
======================================================================== */

#[derive(Debug, Clone)]
pub struct BitbucketClient {
    http: Client,
    cfg: ProviderConfig,
}

impl BitbucketClient {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> PipelineResult<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.cfg.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForgeError::from_status(status.as_u16(), body).into());
        }
        resp.json::<T>()
            .await
            .map_err(|e| ForgeError::InvalidResponse(e.to_string()).into())
    }

    pub async fn get_meta(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedMergeRequest> {
        let url = format!(
            "{}/repositories/{}/pullrequests/{}",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        let pr: BbPullRequest = self.get_json(&url).await?;
        let ctx = ConvertContext {
            connector_id: &self.cfg.connector_id,
            api_base: &self.cfg.base_api,
            bot_user_id: &self.cfg.bot_user_id,
        };
        let repo = BbRepo {
            uuid: Some(mr.repo.repo_id.clone()),
            full_name: mr.repo.slug.clone(),
        };
        Ok(unify_pr(&ctx, &pr, &repo))
    }

    /// Bitbucket serves the whole PR diff as one raw unified patch.
    async fn get_diff(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedDiff> {
        let url = format!(
            "{}/repositories/{}/pullrequests/{}/diff",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForgeError::from_status(status.as_u16(), body).into());
        }
        let raw = resp
            .text()
            .await
            .map_err(|e| ForgeError::InvalidResponse(e.to_string()))?;
        let diff = parse_patch(&raw);
        debug!(files = diff.files.len(), "bitbucket: diff fetched");
        Ok(diff)
    }

    /// Comments with cursor pagination (`next` links), exhausting every
    /// page before returning.
    async fn get_timeline(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedTimeline> {
        let ctx = ConvertContext {
            connector_id: &self.cfg.connector_id,
            api_base: &self.cfg.base_api,
            bot_user_id: &self.cfg.bot_user_id,
        };

        let mut raw_comments: Vec<BbComment> = Vec::new();
        let mut url = format!(
            "{}/repositories/{}/pullrequests/{}/comments?pagelen=100",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        loop {
            let page: BbPage<BbComment> = self.get_json(&url).await?;
            raw_comments.extend(page.values);
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }

        // Parent author lookup for bot tagging.
        let authors: std::collections::HashMap<u64, String> = raw_comments
            .iter()
            .map(|c| (c.id, c.user.uuid.clone().unwrap_or_default()))
            .collect();

        let comments = raw_comments
            .into_iter()
            .filter(|c| !c.deleted.unwrap_or(false))
            .map(|c| {
                let position = c.inline.as_ref().and_then(|i| {
                    if let Some(line) = i.to {
                        Some(CommentPosition {
                            path: i.path.clone(),
                            side: Side::New,
                            line,
                        })
                    } else {
                        i.from.map(|line| CommentPosition {
                            path: i.path.clone(),
                            side: Side::Old,
                            line,
                        })
                    }
                });
                let parent_id = c.parent.as_ref().map(|p| p.id.to_string());
                let in_reply_to_bot = c
                    .parent
                    .as_ref()
                    .and_then(|p| authors.get(&p.id))
                    .is_some_and(|a| *a == self.cfg.bot_user_id);
                UnifiedComment {
                    id: c.id.to_string(),
                    author: unify_user(&ctx, &c.user),
                    body: c.content.raw.unwrap_or_default(),
                    created_at: c.created_on.unwrap_or_else(Utc::now),
                    position,
                    thread_id: parent_id.clone(),
                    parent_id,
                    in_reply_to_bot,
                }
            })
            .collect();

        Ok(UnifiedTimeline::new(comments))
    }

    pub async fn fetch_context(&self, mr: &UnifiedMergeRequest) -> PipelineResult<MrContext> {
        let merge_request = self.get_meta(mr).await?;
        let diff = self.get_diff(&merge_request).await?;
        let timeline = self.get_timeline(&merge_request).await?;
        Ok(MrContext {
            merge_request,
            diff,
            timeline,
        })
    }
}

/* ===========================================================================
Bitbucket payload shapes (subset of fields we actually read)
======================================================================== */

#[derive(Debug, Deserialize)]
struct BbUser {
    uuid: Option<String>,
    display_name: Option<String>,
    nickname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbRepo {
    uuid: Option<String>,
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct BbBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BbCommit {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct BbEndpoint {
    branch: BbBranch,
    commit: Option<BbCommit>,
}

#[derive(Debug, Deserialize)]
struct BbPullRequest {
    id: u64,
    title: Option<String>,
    description: Option<String>,
    author: BbUser,
    source: BbEndpoint,
    destination: BbEndpoint,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    pullrequest: BbPullRequest,
    repository: BbRepo,
}

#[derive(Debug, Deserialize)]
struct BbContent {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbInline {
    path: String,
    to: Option<u32>,
    from: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BbParentRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct BbComment {
    id: u64,
    content: BbContent,
    user: BbUser,
    created_on: Option<DateTime<Utc>>,
    parent: Option<BbParentRef>,
    inline: Option<BbInline>,
    deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    pullrequest: BbPullRequest,
    repository: BbRepo,
    comment: BbComment,
}

#[derive(Debug, Deserialize)]
struct BbPage<T> {
    values: Vec<T>,
    next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn ctx<'a>() -> ConvertContext<'a> {
        ConvertContext {
            connector_id: "c3",
            api_base: "https://api.bitbucket.org/2.0",
            bot_user_id: "{bot-uuid}",
        }
    }

    fn headers(event: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-event-key", HeaderValue::from_static(event));
        h
    }

    fn pr_payload() -> serde_json::Value {
        serde_json::json!({
            "pullrequest": {
                "id": 8,
                "title": "Harden webhook",
                "description": "desc",
                "author": {"uuid": "{u-1}", "display_name": "Ann", "nickname": "ann"},
                "source": {"branch": {"name": "harden"}, "commit": {"hash": "aabbcc"}},
                "destination": {"branch": {"name": "main"}, "commit": {"hash": "ddeeff"}}
            },
            "repository": {"uuid": "{r-1}", "full_name": "ws/app"}
        })
    }

    #[test]
    fn created_and_updated_convert() {
        let body = pr_payload().to_string();
        let ev = convert(ctx(), &headers("pullrequest:created"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::NewMergeRequest);
        assert_eq!(ev.merge_request.head_sha, "aabbcc");
        assert_eq!(ev.merge_request.repo.repo_id, "{r-1}");

        let ev = convert(ctx(), &headers("pullrequest:updated"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::UpdatedMergeRequest);
    }

    #[test]
    fn inline_comment_reply_converts() {
        let mut payload = pr_payload();
        payload["comment"] = serde_json::json!({
            "id": 71,
            "content": {"raw": "should this be old-side?"},
            "user": {"uuid": "{u-2}", "nickname": "rev"},
            "created_on": "2026-05-03T12:00:00Z",
            "parent": {"id": 70},
            "inline": {"path": "src/hooks.rs", "from": 160, "to": null}
        });
        let body = payload.to_string();
        let ev = convert(ctx(), &headers("pullrequest:comment_created"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::ReviewComment);
        let c = ev.comment.unwrap();
        assert!(c.is_reply());
        assert_eq!(c.parent_id.as_deref(), Some("70"));
        let pos = c.position.unwrap();
        assert_eq!(pos.side, Side::Old);
        assert_eq!(pos.line, 160);
    }

    #[test]
    fn unknown_event_key_is_discarded() {
        let body = pr_payload().to_string();
        assert!(convert(ctx(), &headers("repo:push"), body.as_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn signature_uses_x_hub_signature() {
        let mut h = HeaderMap::new();
        let sig = format!("sha256={}", signature::hmac_sha256_hex("sec", b"payload"));
        h.insert("x-hub-signature", HeaderValue::from_str(&sig).unwrap());
        assert!(verify_signature(&h, b"payload", "sec").is_ok());
        assert!(verify_signature(&h, b"payload", "wrong").is_err());
    }
}
