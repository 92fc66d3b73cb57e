//! Review context assembly.
//!
//! Trims the fetched MR context down to what prompts need: text hunks only,
//! a bounded slice of recent conversation, and a ±N-line code excerpt
//! around every commented line (N = 10 by default). Excerpts come from the
//! diff itself — the hunk window around the target — so no extra forge
//! calls are needed.

use crate::model::diff::{DiffLine, FileDiff, UnifiedDiff};
use crate::model::{Side, UnifiedComment, UnifiedEvent, UnifiedMergeRequest, UnifiedTimeline};

/// Knobs for context assembly.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Lines of code kept around each commented line.
    pub excerpt_window: u32,
    /// Most recent conversation entries included in prompts.
    pub conversation_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            excerpt_window: 10,
            conversation_limit: 20,
        }
    }
}

/// Code excerpt around one commented line.
#[derive(Debug, Clone)]
pub struct CodeExcerpt {
    pub path: String,
    pub side: Side,
    pub line: u32,
    /// Numbered window text, one `"  42 | code"` row per line.
    pub window: String,
}

/// Everything prompt construction needs for one review pass.
#[derive(Debug, Clone)]
pub struct ReviewContext {
    pub merge_request: UnifiedMergeRequest,
    /// Text files with hunks; binary and empty diffs are dropped here.
    pub diff: UnifiedDiff,
    /// Recent conversation, oldest first.
    pub conversation: Vec<UnifiedComment>,
    /// Excerpts for every inline-commented line in the conversation slice.
    pub excerpts: Vec<CodeExcerpt>,
}

/// Assembles the review context for an event.
pub fn build_context(
    event: &UnifiedEvent,
    mr: &UnifiedMergeRequest,
    diff: &UnifiedDiff,
    timeline: &UnifiedTimeline,
    cfg: &ContextConfig,
) -> ReviewContext {
    let trimmed = UnifiedDiff {
        files: diff
            .files
            .iter()
            .filter(|f| !f.is_binary && !f.hunks.is_empty())
            .cloned()
            .collect(),
    };

    let skip = timeline
        .comments
        .len()
        .saturating_sub(cfg.conversation_limit);
    let conversation: Vec<UnifiedComment> = timeline.comments[skip..].to_vec();

    let mut excerpts = Vec::new();
    for c in conversation
        .iter()
        .chain(event.comment.iter().filter(|c| timeline.find(&c.id).is_none()))
    {
        if let Some(pos) = &c.position {
            if let Some(file) = trimmed.file(&pos.path) {
                if let Some(window) = excerpt_around(file, pos.side, pos.line, cfg.excerpt_window) {
                    excerpts.push(CodeExcerpt {
                        path: pos.path.clone(),
                        side: pos.side,
                        line: pos.line,
                        window,
                    });
                }
            }
        }
    }

    ReviewContext {
        merge_request: mr.clone(),
        diff: trimmed,
        conversation,
        excerpts,
    }
}

/// Extracts a numbered window of hunk lines within ±`window` of `line` on
/// `side`. Returns `None` when the line is outside every hunk.
pub fn excerpt_around(file: &FileDiff, side: Side, line: u32, window: u32) -> Option<String> {
    let hunk = file.hunks.iter().find(|h| h.contains(side, line))?;
    let lo = line.saturating_sub(window);
    let hi = line.saturating_add(window);

    let mut rows = Vec::new();
    for l in &hunk.lines {
        let (n, content, tag) = match l {
            DiffLine::Context {
                old_line,
                new_line,
                content,
            } => (
                match side {
                    Side::Old => *old_line,
                    Side::New => *new_line,
                },
                content,
                ' ',
            ),
            DiffLine::Added { new_line, content } if side == Side::New => (*new_line, content, '+'),
            DiffLine::Removed { old_line, content } if side == Side::Old => {
                (*old_line, content, '-')
            }
            _ => continue,
        };
        if n >= lo && n <= hi {
            rows.push(format!("{n:>5} |{tag}{content}"));
        }
    }
    if rows.is_empty() { None } else { Some(rows.join("\n")) }
}
