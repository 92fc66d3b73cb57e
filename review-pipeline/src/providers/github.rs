//! GitHub provider (REST v3) — detection, webhook conversion, context fetch.
//!
//! Webhook events handled:
//! - `pull_request` (opened/ready_for_review → new, synchronize/reopened →
//!   updated, review_requested → reviewer added)
//! - `issue_comment` (created, on PRs only)
//! - `pull_request_review_comment` (created; inline, possibly threaded)
//!
//! Fetch endpoints:
//! - GET /repos/:slug/pulls/:n
//! - GET /repos/:slug/pulls/:n/files        (paginated)
//! - GET /repos/:slug/issues/:n/comments    (paginated)
//! - GET /repos/:slug/pulls/:n/comments     (paginated)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::diff::file_diff_from_fragment;
use crate::errors::{ConversionError, ForgeError, PipelineResult, SignatureError};
use crate::model::diff::{FileStatus, UnifiedDiff};
use crate::model::{
    CommentPosition, EventKind, ProviderKind, RepoDescriptor, Side, UnifiedComment, UnifiedEvent,
    UnifiedMergeRequest, UnifiedTimeline, UnifiedUser,
};
use crate::providers::{ConvertContext, MrContext, ProviderConfig, signature};

/// Header-only detection: GitHub always sends `X-GitHub-Event`.
pub fn detect(headers: &HeaderMap) -> bool {
    headers.contains_key("x-github-event")
}

/// `X-Hub-Signature-256: sha256=<hex>` over the raw body.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(), SignatureError> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader("X-Hub-Signature-256"))?;
    let hex = header
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    signature::verify_hmac_hex(secret, body, hex)
}

/// Payload → unified event. Discards events with no review impact.
pub fn convert(
    ctx: ConvertContext<'_>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<UnifiedEvent>, ConversionError> {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or(ConversionError::MissingField("X-GitHub-Event", "github"))?;

    let raw: serde_json::Value = serde_json::from_slice(body)?;

    match event {
        "pull_request" => {
            let payload: PullRequestEvent = shape(raw, "pull_request")?;
            let kind = match payload.action.as_str() {
                "opened" | "ready_for_review" => EventKind::NewMergeRequest,
                "synchronize" | "reopened" => EventKind::UpdatedMergeRequest,
                "review_requested" => EventKind::ReviewerAdded,
                _ => return Ok(None),
            };
            Ok(Some(UnifiedEvent {
                kind,
                provider: ProviderKind::GitHub,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_pr(&ctx, &payload.pull_request, &payload.repository),
                comment: None,
                raw_capture: Some(String::from_utf8_lossy(body).into_owned()),
            }))
        }
        "issue_comment" => {
            let payload: IssueCommentEvent = shape(raw, "issue_comment")?;
            if payload.action != "created" {
                return Ok(None);
            }
            // Only comments on pull requests matter.
            if payload.issue.pull_request.is_none() {
                return Ok(None);
            }
            let mr = mr_from_issue(&ctx, &payload.issue, &payload.repository);
            let comment = UnifiedComment {
                id: payload.comment.id.to_string(),
                author: unify_user(&ctx, &payload.comment.user),
                body: payload.comment.body.clone().unwrap_or_default(),
                created_at: payload.comment.created_at,
                position: None,
                parent_id: None,
                thread_id: None,
                in_reply_to_bot: false,
            };
            Ok(Some(UnifiedEvent {
                kind: EventKind::IssueComment,
                provider: ProviderKind::GitHub,
                connector_id: ctx.connector_id.to_string(),
                merge_request: mr,
                comment: Some(comment),
                raw_capture: Some(String::from_utf8_lossy(body).into_owned()),
            }))
        }
        "pull_request_review_comment" => {
            let payload: ReviewCommentEvent = shape(raw, "pull_request_review_comment")?;
            if payload.action != "created" {
                return Ok(None);
            }
            let c = &payload.comment;
            let position = match (&c.path, c.line.or(c.original_line)) {
                (Some(path), Some(line)) => Some(CommentPosition {
                    path: path.clone(),
                    side: match c.side.as_deref() {
                        Some("LEFT") => Side::Old,
                        _ => Side::New,
                    },
                    line: line as u32,
                }),
                _ => None,
            };
            let comment = UnifiedComment {
                id: c.id.to_string(),
                author: unify_user(&ctx, &c.user),
                body: c.body.clone().unwrap_or_default(),
                created_at: c.created_at,
                position,
                parent_id: c.in_reply_to_id.map(|i| i.to_string()),
                thread_id: c.in_reply_to_id.map(|i| i.to_string()),
                in_reply_to_bot: false,
            };
            Ok(Some(UnifiedEvent {
                kind: EventKind::ReviewComment,
                provider: ProviderKind::GitHub,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_pr(&ctx, &payload.pull_request, &payload.repository),
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

fn unify_user(ctx: &ConvertContext<'_>, u: &GhUser) -> UnifiedUser {
    let id = u.id.to_string();
    UnifiedUser {
        is_bot: u.user_type.as_deref() == Some("Bot") || id == ctx.bot_user_id,
        provider_id: id,
        login: u.login.clone(),
        display_name: None,
    }
}

fn unify_pr(ctx: &ConvertContext<'_>, pr: &GhPullRequest, repo: &GhRepo) -> UnifiedMergeRequest {
    UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider: ProviderKind::GitHub,
            repo_id: repo.id.to_string(),
            slug: repo.full_name.clone(),
            api_base: ctx.api_base.to_string(),
        },
        number: pr.number,
        title: pr.title.clone().unwrap_or_default(),
        description: pr.body.clone(),
        source_branch: pr.head.branch.clone(),
        target_branch: pr.base.branch.clone(),
        head_sha: pr.head.sha.clone(),
        base_sha: pr.base.sha.clone(),
        author: unify_user(ctx, &pr.user),
        metadata: Default::default(),
    }
}

/// issue_comment payloads carry no head SHA; the worker refreshes metadata
/// via `fetch_context` before anything SHA-bound happens.
fn mr_from_issue(ctx: &ConvertContext<'_>, issue: &GhIssue, repo: &GhRepo) -> UnifiedMergeRequest {
    UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider: ProviderKind::GitHub,
            repo_id: repo.id.to_string(),
            slug: repo.full_name.clone(),
            api_base: ctx.api_base.to_string(),
        },
        number: issue.number,
        title: issue.title.clone().unwrap_or_default(),
        description: None,
        source_branch: String::new(),
        target_branch: String::new(),
        head_sha: String::new(),
        base_sha: String::new(),
        author: unify_user(ctx, &issue.user),
        metadata: Default::default(),
    }
}

/* ===========================================================================
Context fetch
======================================================================== */

const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: Client,
    cfg: ProviderConfig,
}

impl GitHubClient {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> PipelineResult<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.cfg.token)
            .header("Accept", "application/vnd.github+json")
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

    /// Refreshed PR metadata (head/base SHA may have moved since the
    /// webhook fired).
    pub async fn get_meta(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedMergeRequest> {
        let url = format!(
            "{}/repos/{}/pulls/{}",
            self.cfg.base_api, mr.repo.slug, mr.number
        );
        let pr: GhPullRequest = self.get_json(&url).await?;
        let ctx = ConvertContext {
            connector_id: &self.cfg.connector_id,
            api_base: &self.cfg.base_api,
            bot_user_id: &self.cfg.bot_user_id,
        };
        Ok(UnifiedMergeRequest {
            repo: mr.repo.clone(),
            number: pr.number,
            title: pr.title.clone().unwrap_or_default(),
            description: pr.body.clone(),
            source_branch: pr.head.branch.clone(),
            target_branch: pr.base.branch.clone(),
            head_sha: pr.head.sha.clone(),
            base_sha: pr.base.sha.clone(),
            author: unify_user(&ctx, &pr.user),
            metadata: Default::default(),
        })
    }

    /// All changed files with patches, every page exhausted.
    async fn get_diff(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedDiff> {
        let mut files = Vec::new();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/repos/{}/pulls/{}/files?per_page={}&page={}",
                self.cfg.base_api, mr.repo.slug, mr.number, PER_PAGE, page
            );
            let batch: Vec<GhFile> = self.get_json(&url).await?;
            let n = batch.len();
            for f in batch {
                let status = match f.status.as_str() {
                    "added" => FileStatus::Added,
                    "removed" => FileStatus::Deleted,
                    "renamed" => FileStatus::Renamed,
                    _ => FileStatus::Modified,
                };
                files.push(file_diff_from_fragment(
                    &f.filename,
                    f.previous_filename.as_deref(),
                    status,
                    f.patch.as_deref(),
                ));
            }
            if n < PER_PAGE {
                break;
            }
            page += 1;
        }
        debug!(files = files.len(), "github: diff fetched");
        Ok(UnifiedDiff { files })
    }

    /// Issue comments + review comments merged into one timeline, with
    /// reply/bot tagging resolved against parent authors.
    async fn get_timeline(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedTimeline> {
        let ctx = ConvertContext {
            connector_id: &self.cfg.connector_id,
            api_base: &self.cfg.base_api,
            bot_user_id: &self.cfg.bot_user_id,
        };

        let mut comments: Vec<UnifiedComment> = Vec::new();

        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/repos/{}/issues/{}/comments?per_page={}&page={}",
                self.cfg.base_api, mr.repo.slug, mr.number, PER_PAGE, page
            );
            let batch: Vec<GhIssueComment> = self.get_json(&url).await?;
            let n = batch.len();
            for c in batch {
                comments.push(UnifiedComment {
                    id: c.id.to_string(),
                    author: unify_user(&ctx, &c.user),
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                    position: None,
                    parent_id: None,
                    thread_id: None,
                    in_reply_to_bot: false,
                });
            }
            if n < PER_PAGE {
                break;
            }
            page += 1;
        }

        let mut review_comments: Vec<GhReviewComment> = Vec::new();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/repos/{}/pulls/{}/comments?per_page={}&page={}",
                self.cfg.base_api, mr.repo.slug, mr.number, PER_PAGE, page
            );
            let batch: Vec<GhReviewComment> = self.get_json(&url).await?;
            let n = batch.len();
            review_comments.extend(batch);
            if n < PER_PAGE {
                break;
            }
            page += 1;
        }

        // Parent author lookup for bot tagging.
        let authors: HashMap<u64, String> = review_comments
            .iter()
            .map(|c| (c.id, c.user.id.to_string()))
            .collect();

        for c in review_comments {
            let position = match (&c.path, c.line.or(c.original_line)) {
                (Some(path), Some(line)) => Some(CommentPosition {
                    path: path.clone(),
                    side: match c.side.as_deref() {
                        Some("LEFT") => Side::Old,
                        _ => Side::New,
                    },
                    line: line as u32,
                }),
                _ => None,
            };
            let in_reply_to_bot = c
                .in_reply_to_id
                .and_then(|p| authors.get(&p))
                .is_some_and(|author| *author == self.cfg.bot_user_id);
            comments.push(UnifiedComment {
                id: c.id.to_string(),
                author: unify_user(&ctx, &c.user),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
                position,
                parent_id: c.in_reply_to_id.map(|i| i.to_string()),
                thread_id: c.in_reply_to_id.map(|i| i.to_string()),
                in_reply_to_bot,
            });
        }

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
GitHub payload shapes (subset of fields we actually read)
======================================================================== */

#[derive(Debug, Deserialize)]
struct GhUser {
    id: u64,
    login: String,
    #[serde(rename = "type")]
    user_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    id: u64,
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct GhBranchRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    user: GhUser,
    head: GhBranchRef,
    base: GhBranchRef,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: GhPullRequest,
    repository: GhRepo,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: Option<String>,
    user: GhUser,
    /// Present iff the issue is a pull request.
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GhIssueComment {
    id: u64,
    body: Option<String>,
    user: GhUser,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEvent {
    action: String,
    issue: GhIssue,
    comment: GhIssueComment,
    repository: GhRepo,
}

#[derive(Debug, Deserialize)]
struct GhReviewComment {
    id: u64,
    body: Option<String>,
    user: GhUser,
    created_at: DateTime<Utc>,
    path: Option<String>,
    line: Option<u64>,
    original_line: Option<u64>,
    side: Option<String>,
    in_reply_to_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReviewCommentEvent {
    action: String,
    comment: GhReviewComment,
    pull_request: GhPullRequest,
    repository: GhRepo,
}

#[derive(Debug, Deserialize)]
struct GhFile {
    filename: String,
    status: String,
    previous_filename: Option<String>,
    patch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn ctx<'a>() -> ConvertContext<'a> {
        ConvertContext {
            connector_id: "c1",
            api_base: "https://api.github.com",
            bot_user_id: "9000",
        }
    }

    fn headers(event: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-github-event", HeaderValue::from_static(event));
        h
    }

    fn pr_payload(action: &str) -> serde_json::Value {
        serde_json::json!({
            "action": action,
            "number": 42,
            "pull_request": {
                "number": 42,
                "title": "Add retry logic",
                "body": "please review",
                "user": {"id": 7, "login": "alice"},
                "head": {"ref": "feat/retry", "sha": "abc123"},
                "base": {"ref": "main", "sha": "000aaa"}
            },
            "repository": {"id": 99, "full_name": "acme/api"}
        })
    }

    #[test]
    fn pull_request_opened_converts_to_new_mr() {
        let body = pr_payload("opened").to_string();
        let ev = convert(ctx(), &headers("pull_request"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::NewMergeRequest);
        let mr = &ev.merge_request;
        assert_eq!(mr.number, 42);
        assert_eq!(mr.head_sha, "abc123");
        assert_eq!(mr.repo.repo_id, "99");
        assert_eq!(mr.repo.slug, "acme/api");
        assert_eq!(mr.author.provider_id, "7");
        assert!(ev.raw_capture.is_some());
    }

    #[test]
    fn synchronize_is_updated_and_label_is_discarded() {
        let body = pr_payload("synchronize").to_string();
        let ev = convert(ctx(), &headers("pull_request"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::UpdatedMergeRequest);

        let body = pr_payload("labeled").to_string();
        assert!(convert(ctx(), &headers("pull_request"), body.as_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn shape_mismatch_fails_fast() {
        let body = serde_json::json!({"action": "opened", "pull_request": {"number": "not-a-number"}})
            .to_string();
        let err = convert(ctx(), &headers("pull_request"), body.as_bytes()).unwrap_err();
        assert!(matches!(err, ConversionError::ShapeMismatch { .. }));

        let err = convert(ctx(), &headers("pull_request"), b"{not json").unwrap_err();
        assert!(matches!(err, ConversionError::Json(_)));
    }

    #[test]
    fn review_comment_reply_carries_position_and_parent() {
        let body = serde_json::json!({
            "action": "created",
            "comment": {
                "id": 555,
                "body": "what about nulls?",
                "user": {"id": 7, "login": "alice"},
                "created_at": "2026-05-01T10:00:00Z",
                "path": "src/app.rs",
                "line": 52,
                "side": "RIGHT",
                "in_reply_to_id": 500
            },
            "pull_request": pr_payload("opened")["pull_request"],
            "repository": {"id": 99, "full_name": "acme/api"}
        })
        .to_string();
        let ev = convert(ctx(), &headers("pull_request_review_comment"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::ReviewComment);
        let c = ev.comment.unwrap();
        assert!(c.is_reply());
        assert_eq!(c.parent_id.as_deref(), Some("500"));
        let pos = c.position.unwrap();
        assert_eq!(pos.path, "src/app.rs");
        assert_eq!(pos.side, Side::New);
        assert_eq!(pos.line, 52);
    }

    #[test]
    fn issue_comment_on_plain_issue_is_discarded() {
        let body = serde_json::json!({
            "action": "created",
            "issue": {"number": 3, "title": "bug", "user": {"id": 1, "login": "z"}},
            "comment": {"id": 1, "body": "ping", "user": {"id": 1, "login": "z"},
                        "created_at": "2026-05-01T10:00:00Z"},
            "repository": {"id": 99, "full_name": "acme/api"}
        })
        .to_string();
        assert!(convert(ctx(), &headers("issue_comment"), body.as_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn bot_comments_tagged_by_identity_not_name() {
        let u = GhUser {
            id: 9000,
            login: "totally-a-human".into(),
            user_type: None,
        };
        assert!(unify_user(&ctx(), &u).is_bot);

        let u = GhUser {
            id: 1,
            login: "livereview-bot".into(),
            user_type: None,
        };
        assert!(!unify_user(&ctx(), &u).is_bot);
    }

    #[test]
    fn signature_header_required_and_prefixed() {
        let mut h = HeaderMap::new();
        let err = verify_signature(&h, b"x", "s").unwrap_err();
        assert!(matches!(err, SignatureError::MissingHeader(_)));

        h.insert("x-hub-signature-256", HeaderValue::from_static("nope"));
        assert!(matches!(
            verify_signature(&h, b"x", "s").unwrap_err(),
            SignatureError::Malformed
        ));

        let sig = format!("sha256={}", signature::hmac_sha256_hex("s", b"x"));
        h.insert("x-hub-signature-256", HeaderValue::from_str(&sig).unwrap());
        assert!(verify_signature(&h, b"x", "s").is_ok());
    }
}
