//! GitLab provider (REST v4) — detection, webhook conversion, context fetch.
//!
//! Webhook events handled:
//! - `Merge Request Hook` (open → new, update/reopen → updated)
//! - `Note Hook` on merge requests (plain and diff notes; system notes are
//!   discarded)
//!
//! Fetch endpoints:
//! - GET /projects/:id/merge_requests/:iid
//! - GET /projects/:id/merge_requests/:iid/diffs        (paginated)
//! - GET /projects/:id/merge_requests/:iid/discussions  (paginated)

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

/// Metadata key for the start SHA GitLab positions require.
pub const META_START_SHA: &str = "gitlab_start_sha";

/// Header-only detection: GitLab always sends `X-Gitlab-Event`.
pub fn detect(headers: &HeaderMap) -> bool {
    headers.contains_key("x-gitlab-event")
}

/// `X-Gitlab-Token` (plain shared secret) or `X-Gitlab-Signature`
/// (HMAC-SHA256 hex). Both compare in constant time.
pub fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(), SignatureError> {
    if let Some(token) = headers.get("x-gitlab-token").and_then(|v| v.to_str().ok()) {
        return signature::verify_token(secret, token);
    }
    if let Some(sig) = headers
        .get("x-gitlab-signature")
        .and_then(|v| v.to_str().ok())
    {
        return signature::verify_hmac_hex(secret, body, sig);
    }
    Err(SignatureError::MissingHeader("X-Gitlab-Token"))
}

/// Payload → unified event. System notes and non-MR noteables are
/// discarded.
pub fn convert(
    ctx: ConvertContext<'_>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<UnifiedEvent>, ConversionError> {
    let event = headers
        .get("x-gitlab-event")
        .and_then(|v| v.to_str().ok())
        .ok_or(ConversionError::MissingField("X-Gitlab-Event", "gitlab"))?;

    let raw: serde_json::Value = serde_json::from_slice(body)?;

    match event {
        "Merge Request Hook" => {
            let payload: MergeRequestHook = shape(raw, "Merge Request Hook")?;
            let attrs = &payload.object_attributes;
            let kind = match attrs.action.as_deref() {
                Some("open") => EventKind::NewMergeRequest,
                Some("update") | Some("reopen") => EventKind::UpdatedMergeRequest,
                _ => return Ok(None),
            };
            Ok(Some(UnifiedEvent {
                kind,
                provider: ProviderKind::GitLab,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_mr_hook(&ctx, &payload),
                comment: None,
                raw_capture: Some(String::from_utf8_lossy(body).into_owned()),
            }))
        }
        "Note Hook" => {
            let payload: NoteHook = shape(raw, "Note Hook")?;
            let attrs = &payload.object_attributes;
            if attrs.noteable_type.as_deref() != Some("MergeRequest") {
                return Ok(None);
            }
            if attrs.system.unwrap_or(false) {
                return Ok(None);
            }
            let mr = payload
                .merge_request
                .as_ref()
                .ok_or(ConversionError::MissingField("merge_request", "gitlab"))?;

            let position = attrs.position.as_ref().and_then(|p| {
                if let Some(line) = p.new_line {
                    Some(CommentPosition {
                        path: p.new_path.clone()?,
                        side: Side::New,
                        line,
                    })
                } else if let Some(line) = p.old_line {
                    Some(CommentPosition {
                        path: p.old_path.clone().or_else(|| p.new_path.clone())?,
                        side: Side::Old,
                        line,
                    })
                } else {
                    None
                }
            });

            let kind = if position.is_some() {
                EventKind::ReviewComment
            } else {
                EventKind::IssueComment
            };

            let comment = UnifiedComment {
                id: attrs.id.to_string(),
                author: unify_user(&ctx, &payload.user),
                body: attrs.note.clone().unwrap_or_default(),
                created_at: attrs.created_at.unwrap_or_else(Utc::now),
                position,
                parent_id: None,
                thread_id: attrs.discussion_id.clone(),
                in_reply_to_bot: false,
            };

            Ok(Some(UnifiedEvent {
                kind,
                provider: ProviderKind::GitLab,
                connector_id: ctx.connector_id.to_string(),
                merge_request: unify_mr_brief(&ctx, mr, &payload.project),
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

fn unify_user(ctx: &ConvertContext<'_>, u: &GlUser) -> UnifiedUser {
    let id = u.id.to_string();
    UnifiedUser {
        is_bot: id == ctx.bot_user_id,
        provider_id: id,
        login: u.username.clone(),
        display_name: u.name.clone(),
    }
}

fn unify_mr_hook(ctx: &ConvertContext<'_>, p: &MergeRequestHook) -> UnifiedMergeRequest {
    let attrs = &p.object_attributes;
    UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider: ProviderKind::GitLab,
            repo_id: p.project.id.to_string(),
            slug: p.project.path_with_namespace.clone(),
            api_base: ctx.api_base.to_string(),
        },
        number: attrs.iid,
        title: attrs.title.clone().unwrap_or_default(),
        description: attrs.description.clone(),
        source_branch: attrs.source_branch.clone().unwrap_or_default(),
        target_branch: attrs.target_branch.clone().unwrap_or_default(),
        head_sha: attrs
            .last_commit
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        base_sha: String::new(),
        author: unify_user(ctx, &p.user),
        metadata: Default::default(),
    }
}

fn unify_mr_brief(
    ctx: &ConvertContext<'_>,
    mr: &GlMrBrief,
    project: &GlProject,
) -> UnifiedMergeRequest {
    UnifiedMergeRequest {
        repo: RepoDescriptor {
            provider: ProviderKind::GitLab,
            repo_id: project.id.to_string(),
            slug: project.path_with_namespace.clone(),
            api_base: ctx.api_base.to_string(),
        },
        number: mr.iid,
        title: mr.title.clone().unwrap_or_default(),
        description: None,
        source_branch: mr.source_branch.clone().unwrap_or_default(),
        target_branch: mr.target_branch.clone().unwrap_or_default(),
        head_sha: mr
            .last_commit
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        base_sha: String::new(),
        author: UnifiedUser {
            provider_id: mr.author_id.map(|i| i.to_string()).unwrap_or_default(),
            login: String::new(),
            display_name: None,
            is_bot: false,
        },
        metadata: Default::default(),
    }
}

/* ===========================================================================
Context fetch
======================================================================== */

const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: Client,
    cfg: ProviderConfig,
}

impl GitLabClient {
    pub fn new(http: Client, cfg: ProviderConfig) -> Self {
        Self { http, cfg }
    }

    fn project_path(&self, mr: &UnifiedMergeRequest) -> String {
        // Numeric project id preferred; fall back to the URL-encoded path.
        if mr.repo.repo_id.is_empty() {
            urlencoding::encode(&mr.repo.slug).into_owned()
        } else {
            mr.repo.repo_id.clone()
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> PipelineResult<T> {
        let resp = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.cfg.token)
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

    /// MR metadata including `diff_refs` (base/start/head SHAs).
    pub async fn get_meta(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedMergeRequest> {
        let url = format!(
            "{}/projects/{}/merge_requests/{}",
            self.cfg.base_api,
            self.project_path(mr),
            mr.number
        );
        let resp: GlMrFull = self.get_json(&url).await?;

        let mut out = UnifiedMergeRequest {
            repo: mr.repo.clone(),
            number: mr.number,
            title: resp.title,
            description: resp.description,
            source_branch: resp.source_branch,
            target_branch: resp.target_branch,
            head_sha: resp.diff_refs.head_sha,
            base_sha: resp.diff_refs.base_sha,
            author: UnifiedUser {
                is_bot: resp.author.id.to_string() == self.cfg.bot_user_id,
                provider_id: resp.author.id.to_string(),
                login: resp.author.username,
                display_name: resp.author.name,
            },
            metadata: Default::default(),
        };
        out.metadata
            .insert(META_START_SHA.to_string(), resp.diff_refs.start_sha);
        Ok(out)
    }

    /// File-level diffs, every page exhausted.
    async fn get_diff(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedDiff> {
        let mut files = Vec::new();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/projects/{}/merge_requests/{}/diffs?per_page={}&page={}",
                self.cfg.base_api,
                self.project_path(mr),
                mr.number,
                PER_PAGE,
                page
            );
            let batch: Vec<GlDiffFile> = self.get_json(&url).await?;
            let n = batch.len();
            for f in batch {
                let status = if f.new_file {
                    FileStatus::Added
                } else if f.deleted_file {
                    FileStatus::Deleted
                } else if f.renamed_file {
                    FileStatus::Renamed
                } else {
                    FileStatus::Modified
                };
                let old_path = if f.renamed_file || f.deleted_file {
                    Some(f.old_path.as_str())
                } else {
                    None
                };
                files.push(file_diff_from_fragment(
                    &f.new_path,
                    old_path,
                    status,
                    f.diff.as_deref(),
                ));
            }
            if n < PER_PAGE {
                break;
            }
            page += 1;
        }
        debug!(files = files.len(), "gitlab: diff fetched");
        Ok(UnifiedDiff { files })
    }

    /// Discussions flattened into the timeline. The first note of a
    /// discussion is the thread root; later notes are replies to it, which
    /// is how GitLab marks threading.
    async fn get_timeline(&self, mr: &UnifiedMergeRequest) -> PipelineResult<UnifiedTimeline> {
        let mut comments: Vec<UnifiedComment> = Vec::new();
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
            let batch: Vec<GlDiscussion> = self.get_json(&url).await?;
            let n = batch.len();
            for d in batch {
                let mut root: Option<(String, String)> = None; // (id, author id)
                for note in d.notes {
                    if note.system.unwrap_or(false) {
                        continue;
                    }
                    let author_id = note.author.id.to_string();
                    let position = note.position.as_ref().and_then(|p| {
                        if let Some(line) = p.new_line {
                            Some(CommentPosition {
                                path: p.new_path.clone()?,
                                side: Side::New,
                                line,
                            })
                        } else if let Some(line) = p.old_line {
                            Some(CommentPosition {
                                path: p.old_path.clone().or_else(|| p.new_path.clone())?,
                                side: Side::Old,
                                line,
                            })
                        } else {
                            None
                        }
                    });
                    let (parent_id, in_reply_to_bot) = match &root {
                        None => (None, false),
                        Some((root_id, root_author)) => (
                            Some(root_id.clone()),
                            *root_author == self.cfg.bot_user_id,
                        ),
                    };
                    comments.push(UnifiedComment {
                        id: note.id.to_string(),
                        author: UnifiedUser {
                            is_bot: author_id == self.cfg.bot_user_id,
                            provider_id: author_id.clone(),
                            login: note.author.username.clone(),
                            display_name: note.author.name.clone(),
                        },
                        body: note.body.clone().unwrap_or_default(),
                        created_at: note.created_at.unwrap_or_else(Utc::now),
                        position,
                        parent_id,
                        thread_id: Some(d.id.clone()),
                        in_reply_to_bot,
                    });
                    if root.is_none() {
                        root = Some((note.id.to_string(), author_id));
                    }
                }
            }
            if n < PER_PAGE {
                break;
            }
            page += 1;
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
GitLab payload shapes (subset of fields we actually read)
======================================================================== */

#[derive(Debug, Deserialize)]
struct GlUser {
    id: u64,
    username: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    id: u64,
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct GlCommitRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GlMrAttrs {
    iid: u64,
    title: Option<String>,
    description: Option<String>,
    action: Option<String>,
    source_branch: Option<String>,
    target_branch: Option<String>,
    last_commit: Option<GlCommitRef>,
}

#[derive(Debug, Deserialize)]
struct MergeRequestHook {
    object_attributes: GlMrAttrs,
    project: GlProject,
    user: GlUser,
}

#[derive(Debug, Deserialize)]
struct GlNotePosition {
    new_path: Option<String>,
    old_path: Option<String>,
    new_line: Option<u32>,
    old_line: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GlNoteAttrs {
    id: u64,
    note: Option<String>,
    noteable_type: Option<String>,
    system: Option<bool>,
    discussion_id: Option<String>,
    position: Option<GlNotePosition>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GlMrBrief {
    iid: u64,
    title: Option<String>,
    source_branch: Option<String>,
    target_branch: Option<String>,
    last_commit: Option<GlCommitRef>,
    author_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NoteHook {
    object_attributes: GlNoteAttrs,
    project: GlProject,
    user: GlUser,
    merge_request: Option<GlMrBrief>,
}

#[derive(Debug, Deserialize)]
struct GlDiffRefs {
    base_sha: String,
    head_sha: String,
    start_sha: String,
}

#[derive(Debug, Deserialize)]
struct GlMrFull {
    title: String,
    description: Option<String>,
    source_branch: String,
    target_branch: String,
    diff_refs: GlDiffRefs,
    author: GlUser,
}

#[derive(Debug, Deserialize)]
struct GlDiffFile {
    old_path: String,
    new_path: String,
    new_file: bool,
    renamed_file: bool,
    deleted_file: bool,
    #[serde(default)]
    diff: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlNote {
    id: u64,
    body: Option<String>,
    author: GlUser,
    created_at: Option<DateTime<Utc>>,
    system: Option<bool>,
    position: Option<GlNotePosition>,
}

#[derive(Debug, Deserialize)]
struct GlDiscussion {
    id: String,
    notes: Vec<GlNote>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn ctx<'a>() -> ConvertContext<'a> {
        ConvertContext {
            connector_id: "c2",
            api_base: "https://gitlab.com/api/v4",
            bot_user_id: "77",
        }
    }

    fn headers(event: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-gitlab-event", HeaderValue::from_static(event));
        h
    }

    #[test]
    fn merge_request_open_converts() {
        let body = serde_json::json!({
            "object_kind": "merge_request",
            "user": {"id": 5, "username": "bob", "name": "Bob"},
            "project": {"id": 31, "path_with_namespace": "team/app"},
            "object_attributes": {
                "iid": 12,
                "title": "Refactor queue",
                "description": "desc",
                "action": "open",
                "source_branch": "refactor",
                "target_branch": "main",
                "last_commit": {"id": "fedcba"}
            }
        })
        .to_string();
        let ev = convert(ctx(), &headers("Merge Request Hook"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::NewMergeRequest);
        assert_eq!(ev.merge_request.number, 12);
        assert_eq!(ev.merge_request.head_sha, "fedcba");
        assert_eq!(ev.merge_request.repo.repo_id, "31");
    }

    #[test]
    fn note_on_mr_converts_with_thread() {
        let body = serde_json::json!({
            "object_kind": "note",
            "user": {"id": 5, "username": "bob", "name": "Bob"},
            "project": {"id": 31, "path_with_namespace": "team/app"},
            "object_attributes": {
                "id": 900,
                "note": "why not async?",
                "noteable_type": "MergeRequest",
                "system": false,
                "discussion_id": "t-abc",
                "created_at": "2026-05-02T08:00:00Z",
                "position": {"new_path": "src/q.rs", "new_line": 14}
            },
            "merge_request": {
                "iid": 12,
                "title": "Refactor queue",
                "source_branch": "refactor",
                "target_branch": "main",
                "last_commit": {"id": "fedcba"},
                "author_id": 6
            }
        })
        .to_string();
        let ev = convert(ctx(), &headers("Note Hook"), body.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::ReviewComment);
        let c = ev.comment.unwrap();
        assert_eq!(c.thread_id.as_deref(), Some("t-abc"));
        let pos = c.position.unwrap();
        assert_eq!(pos.side, Side::New);
        assert_eq!(pos.line, 14);
    }

    #[test]
    fn system_notes_and_issue_notes_discarded() {
        let body = serde_json::json!({
            "object_kind": "note",
            "user": {"id": 5, "username": "bob"},
            "project": {"id": 31, "path_with_namespace": "team/app"},
            "object_attributes": {
                "id": 900, "note": "added 1 commit",
                "noteable_type": "MergeRequest", "system": true
            },
            "merge_request": {"iid": 12}
        })
        .to_string();
        assert!(convert(ctx(), &headers("Note Hook"), body.as_bytes())
            .unwrap()
            .is_none());

        let body = serde_json::json!({
            "object_kind": "note",
            "user": {"id": 5, "username": "bob"},
            "project": {"id": 31, "path_with_namespace": "team/app"},
            "object_attributes": {
                "id": 900, "note": "on an issue", "noteable_type": "Issue"
            }
        })
        .to_string();
        assert!(convert(ctx(), &headers("Note Hook"), body.as_bytes())
            .unwrap()
            .is_none());
    }

    #[test]
    fn token_or_hmac_header_verifies() {
        let mut h = HeaderMap::new();
        h.insert("x-gitlab-token", HeaderValue::from_static("shh"));
        assert!(verify_signature(&h, b"body", "shh").is_ok());
        assert!(verify_signature(&h, b"body", "other").is_err());

        let mut h = HeaderMap::new();
        let sig = signature::hmac_sha256_hex("shh", b"body");
        h.insert("x-gitlab-signature", HeaderValue::from_str(&sig).unwrap());
        assert!(verify_signature(&h, b"body", "shh").is_ok());

        let h = HeaderMap::new();
        assert!(matches!(
            verify_signature(&h, b"body", "shh").unwrap_err(),
            SignatureError::MissingHeader(_)
        ));
    }
}
