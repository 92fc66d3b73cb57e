//! Provider-agnostic data model for review events, merge requests, comments
//! and timelines.
//!
//! These types are the normalized output of the provider input layer and
//! the only shapes the core processor ever sees. Forge-opaque identifiers
//! (repo slug, API base) live in [`RepoDescriptor`] and are consumed only
//! by the input/output layers; core logic stays forge-agnostic.
//!
//! Everything here is immutable after construction; downstream components
//! borrow read-only references.

pub mod diff;
pub mod response;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported forges. Used for dispatch, cache scoping, and idempotency keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Bitbucket,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Bitbucket => "bitbucket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(ProviderKind::GitHub),
            "gitlab" => Some(ProviderKind::GitLab),
            "bitbucket" => Some(ProviderKind::Bitbucket),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of trigger produced a [`UnifiedEvent`]. The kind determines
/// which sub-fields must be populated (a `ReviewComment` carries the
/// triggering comment; a `NewMergeRequest` does not).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    NewMergeRequest,
    UpdatedMergeRequest,
    IssueComment,
    ReviewComment,
    ReviewerAdded,
    ManualTrigger,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMergeRequest => "new_mr",
            EventKind::UpdatedMergeRequest => "updated_mr",
            EventKind::IssueComment => "issue_comment",
            EventKind::ReviewComment => "review_comment",
            EventKind::ReviewerAdded => "reviewer_added",
            EventKind::ManualTrigger => "manual_trigger",
        }
    }
}

/// Forge-opaque repository coordinates needed only by the input/output
/// layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub provider: ProviderKind,
    /// Stable repository id as the forge reports it.
    pub repo_id: String,
    /// "owner/repo" (GitHub/Bitbucket) or project path/id (GitLab).
    pub slug: String,
    /// API base, e.g. "https://api.github.com" or "https://gitlab.com/api/v4".
    pub api_base: String,
}

/// A user as the forge reports it.
///
/// Identity is `(provider scope, provider_id)` — never the display name,
/// which bots and humans alike can change freely.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct UnifiedUser {
    /// Provider-opaque stable identifier.
    pub provider_id: String,
    pub login: String,
    pub display_name: Option<String>,
    pub is_bot: bool,
}

impl PartialEq for UnifiedUser {
    fn eq(&self, other: &Self) -> bool {
        self.provider_id == other.provider_id
    }
}

/// Which side of the diff a position refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Old,
    New,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Old => "old",
            Side::New => "new",
        }
    }
}

/// Inline location of a comment inside the MR diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentPosition {
    pub path: String,
    pub side: Side,
    pub line: u32,
}

/// A discussion comment, top-level or threaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedComment {
    /// Stable comment id as the forge reports it.
    pub id: String,
    pub author: UnifiedUser,
    pub body: String,
    pub created_at: DateTime<Utc>,
    /// Present only for inline comments with a resolvable diff location.
    pub position: Option<CommentPosition>,
    /// Parent comment id when this is a reply.
    pub parent_id: Option<String>,
    /// Thread/discussion id grouping replies, when the forge has one.
    pub thread_id: Option<String>,
    /// Derived: the parent comment was authored by the bot.
    pub in_reply_to_bot: bool,
}

impl UnifiedComment {
    /// A comment is a reply iff it references a parent.
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Ordered discussion timeline for a single MR.
///
/// Comments are kept sorted by creation time; threading via `parent_id`
/// forms a forest rooted at non-reply comments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedTimeline {
    pub comments: Vec<UnifiedComment>,
}

impl UnifiedTimeline {
    /// Builds a timeline, sorting by creation time (stable, so same-instant
    /// comments keep forge order).
    pub fn new(mut comments: Vec<UnifiedComment>) -> Self {
        comments.sort_by_key(|c| c.created_at);
        Self { comments }
    }

    /// All comments belonging to a thread (the root plus its replies), in
    /// timeline order.
    pub fn thread(&self, thread_id: &str) -> Vec<&UnifiedComment> {
        self.comments
            .iter()
            .filter(|c| {
                c.thread_id.as_deref() == Some(thread_id) || c.id == thread_id
            })
            .collect()
    }

    /// The most recent comment in the thread containing `comment_id`.
    pub fn latest_in_thread_of(&self, comment_id: &str) -> Option<&UnifiedComment> {
        let thread_key = self
            .comments
            .iter()
            .find(|c| c.id == comment_id)
            .and_then(|c| c.thread_id.clone().or_else(|| c.parent_id.clone()))
            .unwrap_or_else(|| comment_id.to_string());
        self.thread(&thread_key).into_iter().last()
    }

    pub fn find(&self, comment_id: &str) -> Option<&UnifiedComment> {
        self.comments.iter().find(|c| c.id == comment_id)
    }
}

/// High-level metadata for a merge/pull request.
///
/// `head_sha` uniquely identifies the diff snapshot a review pass runs
/// against; a pass never posts results captured for a different head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMergeRequest {
    pub repo: RepoDescriptor,
    /// MR IID (GitLab) or PR number (GitHub/Bitbucket).
    pub number: u64,
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub head_sha: String,
    pub base_sha: String,
    pub author: UnifiedUser,
    /// Forge-opaque extras consumed only by the input/output layers
    /// (e.g. GitLab's `start_sha` for inline positions). Core logic never
    /// reads this.
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
}

impl UnifiedMergeRequest {
    /// Stable fingerprint: `(provider, repo-id, mr-number)`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}",
            self.repo.provider.as_str(),
            self.repo.repo_id,
            self.number
        )
    }

    /// Queue idempotency key: fingerprint extended with head SHA and
    /// trigger kind, so duplicate webhooks dedupe while new heads re-run.
    pub fn idempotency_key(&self, kind: EventKind) -> String {
        format!("{}:{}:{}", self.fingerprint(), self.head_sha, kind.as_str())
    }
}

/// Top-level ingestion record produced by provider conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub kind: EventKind,
    pub provider: ProviderKind,
    pub connector_id: String,
    pub merge_request: UnifiedMergeRequest,
    /// The triggering comment, for comment-kinded events.
    pub comment: Option<UnifiedComment>,
    /// Raw webhook body kept for replay-based debugging.
    pub raw_capture: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UnifiedUser {
        UnifiedUser {
            provider_id: id.into(),
            login: format!("user-{id}"),
            display_name: None,
            is_bot: false,
        }
    }

    fn comment(id: &str, thread: Option<&str>, parent: Option<&str>, at_secs: i64) -> UnifiedComment {
        UnifiedComment {
            id: id.into(),
            author: user("1"),
            body: "hi".into(),
            created_at: DateTime::from_timestamp(at_secs, 0).unwrap(),
            position: None,
            parent_id: parent.map(Into::into),
            thread_id: thread.map(Into::into),
            in_reply_to_bot: false,
        }
    }

    #[test]
    fn user_identity_ignores_display_fields() {
        let a = UnifiedUser {
            provider_id: "42".into(),
            login: "alice".into(),
            display_name: Some("Alice".into()),
            is_bot: false,
        };
        let b = UnifiedUser {
            provider_id: "42".into(),
            login: "renamed".into(),
            display_name: None,
            is_bot: true,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn timeline_sorts_and_threads() {
        let t = UnifiedTimeline::new(vec![
            comment("c3", Some("t1"), Some("c1"), 30),
            comment("c1", Some("t1"), None, 10),
            comment("c2", None, None, 20),
        ]);
        assert_eq!(t.comments[0].id, "c1");
        assert_eq!(t.comments[2].id, "c3");

        let thread = t.thread("t1");
        assert_eq!(thread.len(), 2);
        assert_eq!(t.latest_in_thread_of("c1").unwrap().id, "c3");
    }

    #[test]
    fn idempotency_key_shape() {
        let mr = UnifiedMergeRequest {
            repo: RepoDescriptor {
                provider: ProviderKind::GitHub,
                repo_id: "99".into(),
                slug: "o/r".into(),
                api_base: "https://api.github.com".into(),
            },
            number: 7,
            title: "t".into(),
            description: None,
            source_branch: "feat".into(),
            target_branch: "main".into(),
            head_sha: "abc123".into(),
            base_sha: "000".into(),
            author: user("1"),
            metadata: Default::default(),
        };
        assert_eq!(mr.fingerprint(), "github:99:7");
        assert_eq!(
            mr.idempotency_key(EventKind::UpdatedMergeRequest),
            "github:99:7:abc123:updated_mr"
        );
    }
}
