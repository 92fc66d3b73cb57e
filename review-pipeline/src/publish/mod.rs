//! Provider output layer: post reviews and threaded replies to the forge.
//!
//! Behavior shared by all three forges:
//! - one MR-level summary comment per pass, stamped with a hidden pass
//!   marker (`<!-- livereview:pass=<head_sha> -->`) so re-runs are no-ops;
//! - one inline comment per successfully anchored finding, each stamped
//!   with its client-tag marker (`<!-- livereview:tag=<hex> -->`); existing
//!   bot comments are scanned first and tagged duplicates skipped, which
//!   makes retries after partial failures safe;
//! - unanchorable findings are consolidated into the summary under a fixed
//!   preamble — never silently dropped;
//! - transient forge errors (5xx/429/timeout) retry with backoff up to a
//!   small budget; permanent errors are recorded as `posted` audit events
//!   and mark the pass partial.

pub mod bitbucket;
pub mod github;
pub mod gitlab;

use std::collections::HashSet;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, warn};

use review_store::Store;
use review_store::events::EventKind as AuditKind;

use crate::errors::{Error, PipelineResult, PositionError};
use crate::model::diff::UnifiedDiff;
use crate::model::response::{InlineComment, UnifiedResponse};
use crate::model::{ProviderKind, UnifiedComment, UnifiedMergeRequest};
use crate::processor::{PASS_MARKER_PREFIX, PASS_MARKER_SUFFIX};
use crate::providers::ProviderConfig;

/// Preamble for the consolidated section of findings that could not be
/// anchored to the diff.
pub const UNANCHORABLE_PREAMBLE: &str = "Comments that could not be anchored to the diff:";

lazy_static! {
    static ref TAG_RE: Regex =
        Regex::new(r"<!--\s*livereview:tag=([0-9a-f]{16})\s*-->").expect("static regex");
    static ref PASS_RE: Regex =
        Regex::new(r"<!--\s*livereview:pass=([0-9a-zA-Z]+)\s*-->").expect("static regex");
}

/// Hidden marker carrying an inline comment's client-tag.
pub fn tag_marker(tag: &str) -> String {
    format!("<!-- livereview:tag={tag} -->")
}

/// Markers already present on the MR, extracted from bot comment bodies.
#[derive(Debug, Clone, Default)]
pub struct ExistingMarkers {
    pub tags: HashSet<String>,
    pub pass_shas: HashSet<String>,
}

impl ExistingMarkers {
    /// Scans one comment body for tag and pass markers.
    pub fn absorb(&mut self, body: &str) {
        for cap in TAG_RE.captures_iter(body) {
            if let Some(m) = cap.get(1) {
                self.tags.insert(m.as_str().to_string());
            }
        }
        for cap in PASS_RE.captures_iter(body) {
            if let Some(m) = cap.get(1) {
                self.pass_shas.insert(m.as_str().to_string());
            }
        }
    }
}

/// Result of one `post_review` run.
#[derive(Debug, Clone, Default)]
pub struct PostedReceipt {
    pub summary_posted: bool,
    pub inline_posted: usize,
    /// Skipped as duplicates (client-tag already present).
    pub inline_skipped: usize,
    /// Consolidated into the summary.
    pub unanchorable: usize,
    /// At least one permanent posting failure occurred.
    pub partial: bool,
}

/// Concrete publisher (enum dispatch).
pub enum Publisher {
    GitHub(github::GitHubPublisher),
    GitLab(gitlab::GitLabPublisher),
    Bitbucket(bitbucket::BitbucketPublisher),
}

impl Publisher {
    pub fn from_config(cfg: &ProviderConfig) -> PipelineResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("livereview/0.1")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(match cfg.kind {
            ProviderKind::GitHub => {
                Self::GitHub(github::GitHubPublisher::new(http, cfg.clone()))
            }
            ProviderKind::GitLab => {
                Self::GitLab(gitlab::GitLabPublisher::new(http, cfg.clone()))
            }
            ProviderKind::Bitbucket => {
                Self::Bitbucket(bitbucket::BitbucketPublisher::new(http, cfg.clone()))
            }
        })
    }

    /// Collects markers from all bot comments currently on the MR.
    pub async fn existing_markers(
        &self,
        mr: &UnifiedMergeRequest,
    ) -> PipelineResult<ExistingMarkers> {
        match self {
            Self::GitHub(p) => p.existing_markers(mr).await,
            Self::GitLab(p) => p.existing_markers(mr).await,
            Self::Bitbucket(p) => p.existing_markers(mr).await,
        }
    }

    /// Pure anchor resolution for one finding, in this forge's style.
    pub fn resolve(
        &self,
        diff: &UnifiedDiff,
        c: &InlineComment,
    ) -> Result<ForgeAnchor, PositionError> {
        match self {
            Self::GitHub(p) => p.resolve(diff, c),
            Self::GitLab(p) => p.resolve(diff, c),
            Self::Bitbucket(p) => p.resolve(diff, c),
        }
    }

    pub async fn post_summary(&self, mr: &UnifiedMergeRequest, body: &str) -> PipelineResult<()> {
        match self {
            Self::GitHub(p) => p.post_summary(mr, body).await,
            Self::GitLab(p) => p.post_summary(mr, body).await,
            Self::Bitbucket(p) => p.post_summary(mr, body).await,
        }
    }

    pub async fn post_inline(
        &self,
        mr: &UnifiedMergeRequest,
        c: &InlineComment,
        anchor: &ForgeAnchor,
        body: &str,
    ) -> PipelineResult<()> {
        match self {
            Self::GitHub(p) => p.post_inline(mr, c, anchor, body).await,
            Self::GitLab(p) => p.post_inline(mr, c, anchor, body).await,
            Self::Bitbucket(p) => p.post_inline(mr, c, anchor, body).await,
        }
    }

    /// Threads a reply under `parent`, preserving the original thread.
    pub async fn post_reply(
        &self,
        mr: &UnifiedMergeRequest,
        parent: &UnifiedComment,
        body: &str,
    ) -> PipelineResult<()> {
        match self {
            Self::GitHub(p) => p.post_reply(mr, parent, body).await,
            Self::GitLab(p) => p.post_reply(mr, parent, body).await,
            Self::Bitbucket(p) => p.post_reply(mr, parent, body).await,
        }
    }
}

/// Forge-ready anchor produced by per-forge resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForgeAnchor {
    /// GitHub: integer position in the file's patch.
    Position(u32),
    /// GitLab/Bitbucket: validated line on a side.
    Line { line: u32, old_side: bool },
}

/// Small bounded retry for posting calls: transient errors back off,
/// permanent errors surface immediately.
async fn with_post_retry<F, Fut>(mut call: F) -> PipelineResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = PipelineResult<()>>,
{
    const ATTEMPTS: u32 = 3;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < ATTEMPTS && e.is_retryable() => {
                let delay = Duration::from_millis(400u64 << attempt);
                warn!(attempt, error = %e, "transient posting failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Renders the final summary body: pass notice, suggestions, consolidated
/// unanchorable findings, and the hidden pass marker.
pub fn render_summary(
    response: &UnifiedResponse,
    unanchorable: &[&InlineComment],
    head_sha: &str,
) -> String {
    let mut body = response.summary.trim().to_string();

    if !response.suggestions.is_empty() {
        body.push_str("\n\nFollow-up suggestions:\n");
        for s in &response.suggestions {
            body.push_str(&format!("- {s}\n"));
        }
    }

    if !unanchorable.is_empty() {
        body.push_str(&format!("\n\n{UNANCHORABLE_PREAMBLE}\n"));
        for c in unanchorable {
            body.push_str(&format!(
                "- `{}:{}` ({}): {}\n",
                c.path,
                c.line,
                c.side.as_str(),
                c.body
            ));
        }
    }

    body.push_str(&format!(
        "\n\n{PASS_MARKER_PREFIX}{head_sha}{PASS_MARKER_SUFFIX}"
    ));
    body
}

/// Posts one full review: summary plus anchored inline comments.
///
/// Idempotent per `(head_sha, client-tag)`: re-running after a partial
/// failure posts only what is missing.
pub async fn post_review(
    cfg: &ProviderConfig,
    mr: &UnifiedMergeRequest,
    diff: &UnifiedDiff,
    response: &UnifiedResponse,
    store: &Store,
    review_id: &str,
) -> PipelineResult<PostedReceipt> {
    let publisher = Publisher::from_config(cfg)?;
    let existing = publisher.existing_markers(mr).await?;
    debug!(
        tags = existing.tags.len(),
        passes = existing.pass_shas.len(),
        "existing markers loaded"
    );

    // Resolve every finding up front so unanchorables land in the summary.
    let mut anchored: Vec<(&InlineComment, ForgeAnchor)> = Vec::new();
    let mut unanchorable: Vec<&InlineComment> = Vec::new();
    for c in &response.inline_comments {
        match publisher.resolve(diff, c) {
            Ok(a) => anchored.push((c, a)),
            Err(e) => {
                debug!(path = %c.path, line = c.line, error = %e, "finding not anchorable");
                unanchorable.push(c);
            }
        }
    }

    let mut receipt = PostedReceipt {
        unanchorable: unanchorable.len(),
        ..Default::default()
    };

    // Summary first (carries the consolidated section); skipped when this
    // head was already summarized.
    if existing.pass_shas.contains(&mr.head_sha) {
        debug!(head = %mr.head_sha, "summary already posted for this head");
    } else {
        let body = render_summary(response, &unanchorable, &mr.head_sha);
        match with_post_retry(|| publisher.post_summary(mr, &body)).await {
            Ok(()) => receipt.summary_posted = true,
            Err(e) => {
                record_post_failure(store, review_id, "summary", &e).await?;
                receipt.partial = true;
            }
        }
    }

    for (c, anchor) in anchored {
        let tag = c.client_tag(&mr.head_sha);
        if existing.tags.contains(&tag) {
            receipt.inline_skipped += 1;
            continue;
        }
        let body = format!("{}\n\n{}", c.body.trim(), tag_marker(&tag));
        match with_post_retry(|| publisher.post_inline(mr, c, &anchor, &body)).await {
            Ok(()) => receipt.inline_posted += 1,
            Err(e) => {
                record_post_failure(store, review_id, &format!("{}:{}", c.path, c.line), &e)
                    .await?;
                receipt.partial = true;
            }
        }
    }

    store
        .record_event(
            review_id,
            AuditKind::Posted,
            &serde_json::json!({
                "summary_posted": receipt.summary_posted,
                "inline_posted": receipt.inline_posted,
                "inline_skipped": receipt.inline_skipped,
                "unanchorable": receipt.unanchorable,
                "partial": receipt.partial,
            }),
        )
        .await?;

    info!(
        review_id,
        posted = receipt.inline_posted,
        skipped = receipt.inline_skipped,
        unanchorable = receipt.unanchorable,
        partial = receipt.partial,
        "review posted"
    );
    Ok(receipt)
}

/// Threads one reply under the parent comment.
pub async fn post_reply(
    cfg: &ProviderConfig,
    mr: &UnifiedMergeRequest,
    parent: &UnifiedComment,
    body: &str,
) -> PipelineResult<()> {
    let publisher = Publisher::from_config(cfg)?;
    with_post_retry(|| publisher.post_reply(mr, parent, body)).await
}

async fn record_post_failure(
    store: &Store,
    review_id: &str,
    target: &str,
    err: &Error,
) -> PipelineResult<()> {
    warn!(review_id, target, error = %err, "permanent posting failure");
    store
        .record_event(
            review_id,
            AuditKind::Posted,
            &serde_json::json!({ "target": target, "error": err.to_string(), "failed": true }),
        )
        .await?;
    Ok(())
}
