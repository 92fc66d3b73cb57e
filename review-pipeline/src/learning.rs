//! Learning extractor.
//!
//! Strictly post-hoc: after a pass has posted, scan the timeline for human
//! follow-ups to bot comments, classify them as accepting or rejecting the
//! suggestion, and persist structured learnings for later prompt assembly.
//! Failures here only ever log — posting never waits on this.

use tracing::{debug, info};

use review_store::Store;
use review_store::learnings::Learning;

use crate::errors::PipelineResult;
use crate::model::{UnifiedComment, UnifiedMergeRequest, UnifiedTimeline};

/// How a reviewer follow-up relates to the bot suggestion it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
    Unclear,
}

const ACCEPT_CUES: &[&str] = &[
    "good catch",
    "fixed",
    "done",
    "agreed",
    "makes sense",
    "will do",
    "thanks",
    "you're right",
];
const REJECT_CUES: &[&str] = &[
    "disagree",
    "not needed",
    "won't fix",
    "wont fix",
    "false positive",
    "intentional",
    "by design is fine here",
    "we prefer",
    "please don't",
];

/// Classifies a reviewer reply by lightweight textual cues.
pub fn classify_reply(body: &str) -> Verdict {
    let lower = body.to_lowercase();
    if REJECT_CUES.iter().any(|c| lower.contains(c)) {
        return Verdict::Rejected;
    }
    if ACCEPT_CUES.iter().any(|c| lower.contains(c)) {
        return Verdict::Accepted;
    }
    Verdict::Unclear
}

/// First non-marker, non-empty line of a bot comment — the pattern the
/// suggestion was about.
fn pattern_of(bot_comment: &UnifiedComment) -> String {
    bot_comment
        .body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("<!--"))
        .unwrap_or("general feedback")
        .chars()
        .take(160)
        .collect()
}

/// Scans the timeline and writes one learning per classified reviewer
/// follow-up. Returns how many learnings were written.
pub async fn extract_learnings(
    store: &Store,
    mr: &UnifiedMergeRequest,
    timeline: &UnifiedTimeline,
) -> PipelineResult<usize> {
    let mut written = 0usize;

    for reply in timeline.comments.iter().filter(|c| {
        !c.author.is_bot && c.in_reply_to_bot
    }) {
        let Some(parent_id) = &reply.parent_id else {
            continue;
        };
        let Some(bot_comment) = timeline.find(parent_id) else {
            continue;
        };

        let verdict = classify_reply(&reply.body);
        let learning = match verdict {
            Verdict::Accepted => Learning {
                provider: mr.repo.provider.as_str().to_string(),
                repo_id: mr.repo.repo_id.clone(),
                pattern: pattern_of(bot_comment),
                preferred_style: reply.body.chars().take(300).collect(),
                counter_example: None,
            },
            Verdict::Rejected => Learning {
                provider: mr.repo.provider.as_str().to_string(),
                repo_id: mr.repo.repo_id.clone(),
                pattern: pattern_of(bot_comment),
                preferred_style: format!(
                    "Reviewers rejected this kind of suggestion: {}",
                    reply.body.chars().take(200).collect::<String>()
                ),
                counter_example: Some(pattern_of(bot_comment)),
            },
            Verdict::Unclear => {
                debug!(comment = %reply.id, "follow-up unclear, skipped");
                continue;
            }
        };

        store.add_learning(&learning).await?;
        written += 1;
    }

    if written > 0 {
        info!(written, mr = %mr.fingerprint(), "learnings extracted");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProviderKind, RepoDescriptor, UnifiedUser};
    use chrono::DateTime;

    #[test]
    fn classification_cues() {
        assert_eq!(classify_reply("Good catch, fixed in the next push"), Verdict::Accepted);
        assert_eq!(classify_reply("This is intentional, won't fix"), Verdict::Rejected);
        assert_eq!(classify_reply("hmm, let me think"), Verdict::Unclear);
        // Reject cues win when both appear.
        assert_eq!(
            classify_reply("thanks, but this is a false positive"),
            Verdict::Rejected
        );
    }

    fn user(id: &str, is_bot: bool) -> UnifiedUser {
        UnifiedUser {
            provider_id: id.into(),
            login: "u".into(),
            display_name: None,
            is_bot,
        }
    }

    fn comment(
        id: &str,
        bot: bool,
        body: &str,
        parent: Option<&str>,
        reply_to_bot: bool,
        at: i64,
    ) -> UnifiedComment {
        UnifiedComment {
            id: id.into(),
            author: user(if bot { "9000" } else { "7" }, bot),
            body: body.into(),
            created_at: DateTime::from_timestamp(at, 0).unwrap(),
            position: None,
            parent_id: parent.map(Into::into),
            thread_id: parent.map(Into::into),
            in_reply_to_bot: reply_to_bot,
        }
    }

    fn mr() -> UnifiedMergeRequest {
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
            target_branch: "m".into(),
            head_sha: "h".into(),
            base_sha: "b".into(),
            author: user("7", false),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn extracts_accept_and_reject_skips_unclear() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Store::from_pool(pool).await.unwrap();

        let timeline = UnifiedTimeline::new(vec![
            comment("b1", true, "Prefer ? over unwrap here\n<!-- livereview:tag=aaaaaaaaaaaaaaaa -->", None, false, 10),
            comment("r1", false, "good catch, fixed", Some("b1"), true, 20),
            comment("b2", true, "Consider renaming this module", None, false, 30),
            comment("r2", false, "disagree, this name is intentional", Some("b2"), true, 40),
            comment("b3", true, "Maybe split this function", None, false, 50),
            comment("r3", false, "interesting", Some("b3"), true, 60),
            comment("r4", false, "unrelated chatter", None, false, 70),
        ]);

        let written = extract_learnings(&store, &mr(), &timeline).await.unwrap();
        assert_eq!(written, 2);

        let rows = store.learnings("github", "1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first: the rejection.
        assert!(rows[0].counter_example.is_some());
        assert!(rows[0].pattern.contains("renaming"));
        assert!(rows[1].counter_example.is_none());
        assert!(rows[1].pattern.contains("unwrap"));
        // The marker line never becomes a pattern.
        assert!(!rows[1].pattern.contains("livereview"));
    }
}
