//! Batch planning: partition files into token-bounded LLM batches.
//!
//! Files are walked in diff order and greedily packed into batches under a
//! soft token budget. A file that alone exceeds the budget is split at hunk
//! boundaries — never within a hunk — so every batch stays a set of whole
//! hunks.

use tracing::debug;

use crate::diff::serialize_hunks;
use crate::model::diff::{FileStatus, Hunk, UnifiedDiff};

/// Planner knobs. The token budget is deliberately configuration, not a
/// constant: `LIVEREVIEW_BATCH_TOKEN_BUDGET` feeds it at startup.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Soft token budget per batch.
    pub token_budget: usize,
    /// Global cap on posted inline comments per pass.
    pub max_inline_comments: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            token_budget: 16_000,
            max_inline_comments: 40,
        }
    }
}

impl PlanConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LIVEREVIEW_BATCH_TOKEN_BUDGET") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.token_budget = n.max(1_000);
            }
        }
        if let Ok(v) = std::env::var("LIVEREVIEW_MAX_INLINE_COMMENTS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_inline_comments = n.max(1);
            }
        }
        cfg
    }
}

/// A slice of one file assigned to a batch (whole hunks).
#[derive(Debug, Clone)]
pub struct BatchFile {
    pub path: String,
    pub status: FileStatus,
    pub hunks: Vec<Hunk>,
}

impl BatchFile {
    /// Rendered patch text for prompts.
    pub fn patch_text(&self) -> String {
        serialize_hunks(&self.hunks)
    }
}

/// One LLM invocation's worth of files.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub files: Vec<BatchFile>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Ordered batches covering the whole diff.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
}

/// Rough token estimate for a patch fragment (≈ 4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn hunk_tokens(hunk: &Hunk) -> usize {
    estimate_tokens(&serialize_hunks(std::slice::from_ref(hunk)))
}

/// Partitions the diff into batches under `cfg.token_budget`.
pub fn plan(diff: &UnifiedDiff, cfg: &PlanConfig) -> BatchPlan {
    let mut batches = Vec::new();
    let mut current = Batch::default();
    let mut current_tokens = 0usize;

    for file in diff.files.iter().filter(|f| !f.is_binary) {
        if file.hunks.is_empty() {
            continue;
        }
        let file_tokens: usize = file.hunks.iter().map(hunk_tokens).sum();

        if file_tokens > cfg.token_budget {
            // Oversized file: flush, then split at hunk boundaries.
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            let mut part = BatchFile {
                path: file.path.clone(),
                status: file.status,
                hunks: Vec::new(),
            };
            let mut part_tokens = 0usize;
            for hunk in &file.hunks {
                let t = hunk_tokens(hunk);
                if part_tokens + t > cfg.token_budget && !part.hunks.is_empty() {
                    batches.push(Batch {
                        files: vec![std::mem::replace(
                            &mut part,
                            BatchFile {
                                path: file.path.clone(),
                                status: file.status,
                                hunks: Vec::new(),
                            },
                        )],
                    });
                    part_tokens = 0;
                }
                part.hunks.push(hunk.clone());
                part_tokens += t;
            }
            if !part.hunks.is_empty() {
                batches.push(Batch { files: vec![part] });
            }
            continue;
        }

        if current_tokens + file_tokens > cfg.token_budget && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.files.push(BatchFile {
            path: file.path.clone(),
            status: file.status,
            hunks: file.hunks.clone(),
        });
        current_tokens += file_tokens;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    debug!(
        batches = batches.len(),
        budget = cfg.token_budget,
        "batch plan built"
    );
    BatchPlan { batches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::file_diff_from_fragment;
    use crate::model::diff::FileDiff;

    fn file_with_lines(path: &str, hunks: usize, lines_per_hunk: usize) -> FileDiff {
        let mut patch = String::new();
        for h in 0..hunks {
            let start = h * 1000 + 1;
            patch.push_str(&format!(
                "@@ -{start},{lines_per_hunk} +{start},{lines_per_hunk} @@\n"
            ));
            for i in 0..lines_per_hunk {
                patch.push_str(&format!(" some unchanged line number {i} padding padding\n"));
            }
        }
        file_diff_from_fragment(path, None, FileStatus::Modified, Some(&patch))
    }

    #[test]
    fn small_files_pack_into_one_batch() {
        let diff = UnifiedDiff {
            files: vec![file_with_lines("a.rs", 1, 5), file_with_lines("b.rs", 1, 5)],
        };
        let p = plan(&diff, &PlanConfig::default());
        assert_eq!(p.batches.len(), 1);
        assert_eq!(p.batches[0].files.len(), 2);
    }

    #[test]
    fn budget_splits_across_files_in_source_order() {
        // Each file ≈ (45 chars * 40 lines)/4 ≈ 460 tokens.
        let diff = UnifiedDiff {
            files: vec![
                file_with_lines("a.rs", 1, 40),
                file_with_lines("b.rs", 1, 40),
                file_with_lines("c.rs", 1, 40),
            ],
        };
        let cfg = PlanConfig {
            token_budget: 1_000,
            max_inline_comments: 40,
        };
        let p = plan(&diff, &cfg);
        assert_eq!(p.batches.len(), 2);
        assert_eq!(p.batches[0].files[0].path, "a.rs");
        assert_eq!(p.batches[0].files[1].path, "b.rs");
        assert_eq!(p.batches[1].files[0].path, "c.rs");
    }

    #[test]
    fn oversized_file_splits_at_hunk_boundaries() {
        // One file with 6 hunks, each ≈ 460 tokens, budget 1000.
        let diff = UnifiedDiff {
            files: vec![file_with_lines("big.rs", 6, 40)],
        };
        let cfg = PlanConfig {
            token_budget: 1_000,
            max_inline_comments: 40,
        };
        let p = plan(&diff, &cfg);
        assert_eq!(p.batches.len(), 3, "two hunks per batch");
        for batch in &p.batches {
            assert_eq!(batch.files.len(), 1);
            assert_eq!(batch.files[0].path, "big.rs");
            assert_eq!(batch.files[0].hunks.len(), 2, "hunks never split");
        }
        // Hunk order preserved across parts.
        assert_eq!(p.batches[0].files[0].hunks[0].new_start, 1);
        assert_eq!(p.batches[2].files[0].hunks[1].new_start, 5001);
    }

    #[test]
    fn binary_and_empty_files_are_skipped() {
        let diff = UnifiedDiff {
            files: vec![FileDiff {
                path: "logo.png".into(),
                old_path: None,
                status: FileStatus::Modified,
                hunks: vec![],
                is_binary: true,
            }],
        };
        assert!(plan(&diff, &PlanConfig::default()).batches.is_empty());
    }
}
