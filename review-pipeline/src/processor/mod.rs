//! Core processor: decide whether to speak, with what context, in how many
//! batches.
//!
//! - [`warrant`] routes an event to a scenario (initial review, updated
//!   review, reply to reviewer, ignore) with self-reply avoidance and
//!   per-head-SHA rate limiting.
//! - [`context`] assembles the review context (trimmed diff, conversation
//!   slice, code excerpts around commented lines).
//! - [`plan`] partitions files into token-bounded batches, splitting only
//!   at hunk boundaries.
//! - [`run`] drives the resilient LLM client per batch and merges results
//!   deterministically.

pub mod context;
pub mod plan;
pub mod run;

use crate::model::{EventKind, UnifiedComment, UnifiedEvent, UnifiedTimeline};

/// Marker the publisher embeds in every MR-level summary so a later pass
/// can tell which head SHA was already reviewed.
pub const PASS_MARKER_PREFIX: &str = "<!-- livereview:pass=";
pub const PASS_MARKER_SUFFIX: &str = " -->";

/// How (and whether) the bot responds to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// First pass on an MR.
    InitialReview,
    /// New head SHA since the last pass.
    UpdatedReview,
    /// A human replied to a bot comment that is the latest in its thread.
    ReplyToReviewer,
    Ignore,
}

/// Whether a bot summary for `head_sha` already exists in the timeline.
pub fn already_reviewed(timeline: &UnifiedTimeline, head_sha: &str) -> bool {
    let marker = format!("{PASS_MARKER_PREFIX}{head_sha}{PASS_MARKER_SUFFIX}");
    timeline
        .comments
        .iter()
        .any(|c| c.author.is_bot && c.body.contains(&marker))
}

fn any_bot_pass(timeline: &UnifiedTimeline) -> bool {
    timeline
        .comments
        .iter()
        .any(|c| c.author.is_bot && c.body.contains(PASS_MARKER_PREFIX))
}

/// Decides whether the bot should respond to `event` and in which scenario.
///
/// Rules:
/// - never reply to the bot's own messages;
/// - a comment warrants a reply only when its thread's latest message is a
///   human message addressed to the bot (reply to a bot comment);
/// - review passes are rate-limited per `(mr-fingerprint, head-SHA)`: a
///   head already carrying a pass marker is ignored, so duplicate webhooks
///   cannot double-post.
pub fn warrant(
    event: &UnifiedEvent,
    timeline: &UnifiedTimeline,
    bot_user_id: &str,
) -> (bool, Scenario) {
    match event.kind {
        EventKind::NewMergeRequest => {
            if already_reviewed(timeline, &event.merge_request.head_sha) {
                (false, Scenario::Ignore)
            } else {
                (true, Scenario::InitialReview)
            }
        }
        EventKind::UpdatedMergeRequest => {
            if already_reviewed(timeline, &event.merge_request.head_sha) {
                (false, Scenario::Ignore)
            } else {
                (true, Scenario::UpdatedReview)
            }
        }
        EventKind::ManualTrigger | EventKind::ReviewerAdded => {
            if already_reviewed(timeline, &event.merge_request.head_sha) {
                (false, Scenario::Ignore)
            } else if any_bot_pass(timeline) {
                (true, Scenario::UpdatedReview)
            } else {
                (true, Scenario::InitialReview)
            }
        }
        EventKind::IssueComment | EventKind::ReviewComment => {
            let Some(comment) = &event.comment else {
                return (false, Scenario::Ignore);
            };
            if comment.author.provider_id == bot_user_id {
                return (false, Scenario::Ignore);
            }
            // Resolve against the fetched timeline: webhook payloads often
            // cannot see parent authorship.
            let resolved = timeline.find(&comment.id).unwrap_or(comment);
            if !reply_addressed_to_bot(resolved, timeline, bot_user_id) {
                return (false, Scenario::Ignore);
            }
            // Only respond when the reviewer's message is still the latest
            // word in the thread.
            match timeline.latest_in_thread_of(&resolved.id) {
                Some(latest) if latest.id == resolved.id => (true, Scenario::ReplyToReviewer),
                Some(_) => (false, Scenario::Ignore),
                None => (true, Scenario::ReplyToReviewer),
            }
        }
    }
}

/// A comment addresses the bot when its parent (thread root for forges
/// without parent ids) was authored by the bot.
fn reply_addressed_to_bot(
    comment: &UnifiedComment,
    timeline: &UnifiedTimeline,
    bot_user_id: &str,
) -> bool {
    if comment.in_reply_to_bot {
        return true;
    }
    if let Some(parent_id) = &comment.parent_id {
        if let Some(parent) = timeline.find(parent_id) {
            return parent.author.provider_id == bot_user_id;
        }
    }
    false
}

/// Builds the single-turn reply prompt (the lighter path for
/// reply-to-reviewer: no batching, one call).
pub fn build_reply_prompt(
    thread: &[&UnifiedComment],
    reviewer_comment: &UnifiedComment,
    mr_title: &str,
) -> String {
    let mut p = String::new();
    p.push_str(
        "You are a code review assistant replying inside an existing review thread.\n\
         Answer the reviewer's latest message directly, concisely, in Markdown.\n\
         Do not repeat the whole thread. Do not invent code you have not seen.\n\n",
    );
    p.push_str(&format!("Merge request: {mr_title}\n\nThread so far:\n"));
    for c in thread {
        let who = if c.author.is_bot {
            "assistant"
        } else {
            "reviewer"
        };
        p.push_str(&format!("[{who} {}]\n{}\n\n", c.author.login, c.body));
    }
    p.push_str(&format!(
        "Latest reviewer message to answer:\n{}\n",
        reviewer_comment.body
    ));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ProviderKind, RepoDescriptor, UnifiedMergeRequest, UnifiedUser,
    };
    use chrono::DateTime;

    const BOT_ID: &str = "9000";

    fn user(id: &str, is_bot: bool) -> UnifiedUser {
        UnifiedUser {
            provider_id: id.into(),
            login: format!("u{id}"),
            display_name: None,
            is_bot,
        }
    }

    fn comment(
        id: &str,
        author_id: &str,
        body: &str,
        parent: Option<&str>,
        at: i64,
    ) -> UnifiedComment {
        UnifiedComment {
            id: id.into(),
            author: user(author_id, author_id == BOT_ID),
            body: body.into(),
            created_at: DateTime::from_timestamp(at, 0).unwrap(),
            position: None,
            parent_id: parent.map(Into::into),
            thread_id: parent.map(Into::into),
            in_reply_to_bot: false,
        }
    }

    fn mr(head: &str) -> UnifiedMergeRequest {
        UnifiedMergeRequest {
            repo: RepoDescriptor {
                provider: ProviderKind::GitHub,
                repo_id: "1".into(),
                slug: "o/r".into(),
                api_base: "x".into(),
            },
            number: 1,
            title: "t".into(),
            description: None,
            source_branch: "s".into(),
            target_branch: "t".into(),
            head_sha: head.into(),
            base_sha: "b".into(),
            author: user("1", false),
            metadata: Default::default(),
        }
    }

    fn event(kind: EventKind, head: &str, comment: Option<UnifiedComment>) -> UnifiedEvent {
        UnifiedEvent {
            kind,
            provider: ProviderKind::GitHub,
            connector_id: "c".into(),
            merge_request: mr(head),
            comment,
            raw_capture: None,
        }
    }

    fn bot_summary(head: &str, at: i64) -> UnifiedComment {
        comment(
            "s1",
            BOT_ID,
            &format!("Review done {PASS_MARKER_PREFIX}{head}{PASS_MARKER_SUFFIX}"),
            None,
            at,
        )
    }

    #[test]
    fn new_mr_warrants_initial_review() {
        let (go, s) = warrant(
            &event(EventKind::NewMergeRequest, "abc", None),
            &UnifiedTimeline::default(),
            BOT_ID,
        );
        assert!(go);
        assert_eq!(s, Scenario::InitialReview);
    }

    #[test]
    fn duplicate_head_is_rate_limited() {
        let timeline = UnifiedTimeline::new(vec![bot_summary("abc", 10)]);
        let (go, s) = warrant(
            &event(EventKind::UpdatedMergeRequest, "abc", None),
            &timeline,
            BOT_ID,
        );
        assert!(!go);
        assert_eq!(s, Scenario::Ignore);

        // A new head re-enables review.
        let (go, s) = warrant(
            &event(EventKind::UpdatedMergeRequest, "def", None),
            &timeline,
            BOT_ID,
        );
        assert!(go);
        assert_eq!(s, Scenario::UpdatedReview);
    }

    #[test]
    fn manual_trigger_picks_scenario_from_history() {
        let (_, s) = warrant(
            &event(EventKind::ManualTrigger, "abc", None),
            &UnifiedTimeline::default(),
            BOT_ID,
        );
        assert_eq!(s, Scenario::InitialReview);

        let timeline = UnifiedTimeline::new(vec![bot_summary("old", 10)]);
        let (_, s) = warrant(&event(EventKind::ManualTrigger, "new", None), &timeline, BOT_ID);
        assert_eq!(s, Scenario::UpdatedReview);
    }

    #[test]
    fn never_replies_to_own_comment() {
        let own = comment("c9", BOT_ID, "I noted this above", Some("c1"), 50);
        let timeline = UnifiedTimeline::new(vec![own.clone()]);
        let (go, s) = warrant(
            &event(EventKind::ReviewComment, "abc", Some(own)),
            &timeline,
            BOT_ID,
        );
        assert!(!go);
        assert_eq!(s, Scenario::Ignore);
    }

    #[test]
    fn reply_to_bot_when_latest_in_thread() {
        let root = comment("c1", BOT_ID, "consider using ?", None, 10);
        let reply = comment("c2", "7", "does ? work with Option?", Some("c1"), 20);
        let timeline = UnifiedTimeline::new(vec![root, reply.clone()]);
        let (go, s) = warrant(
            &event(EventKind::ReviewComment, "abc", Some(reply)),
            &timeline,
            BOT_ID,
        );
        assert!(go);
        assert_eq!(s, Scenario::ReplyToReviewer);
    }

    #[test]
    fn stale_reply_is_ignored() {
        // The triggering comment is no longer the latest in its thread.
        let root = comment("c1", BOT_ID, "consider using ?", None, 10);
        let reply = comment("c2", "7", "why?", Some("c1"), 20);
        let newer = comment("c3", "8", "answered offline", Some("c1"), 30);
        let timeline = UnifiedTimeline::new(vec![root, reply.clone(), newer]);
        let (go, _) = warrant(
            &event(EventKind::ReviewComment, "abc", Some(reply)),
            &timeline,
            BOT_ID,
        );
        assert!(!go);
    }

    #[test]
    fn reply_to_human_thread_is_ignored() {
        let root = comment("c1", "5", "human thread", None, 10);
        let reply = comment("c2", "7", "agreed", Some("c1"), 20);
        let timeline = UnifiedTimeline::new(vec![root, reply.clone()]);
        let (go, _) = warrant(
            &event(EventKind::ReviewComment, "abc", Some(reply)),
            &timeline,
            BOT_ID,
        );
        assert!(!go);
    }
}
