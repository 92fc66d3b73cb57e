//! Diff model: files, hunks, tagged lines.
//!
//! Invariants the parser upholds and tests verify:
//! - hunk line counts match the tagged-line counts in the header,
//! - hunks within a file are sorted by `new_start` and non-overlapping,
//! - renamed files carry both paths; deleted files have no "new" lines to
//!   anchor on, added files no "old" lines.

use serde::{Deserialize, Serialize};

use super::Side;

/// File-level change status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "added",
            FileStatus::Modified => "modified",
            FileStatus::Deleted => "deleted",
            FileStatus::Renamed => "renamed",
        }
    }
}

/// One line inside a diff hunk, tagged with its side(s).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiffLine {
    Context {
        old_line: u32,
        new_line: u32,
        content: String,
    },
    Added {
        new_line: u32,
        content: String,
    },
    Removed {
        old_line: u32,
        content: String,
    },
}

impl DiffLine {
    /// Line number on the requested side, if this line exists there.
    pub fn line_on(&self, side: Side) -> Option<u32> {
        match (self, side) {
            (DiffLine::Context { old_line, .. }, Side::Old) => Some(*old_line),
            (DiffLine::Context { new_line, .. }, Side::New) => Some(*new_line),
            (DiffLine::Added { new_line, .. }, Side::New) => Some(*new_line),
            (DiffLine::Removed { old_line, .. }, Side::Old) => Some(*old_line),
            _ => None,
        }
    }
}

/// A contiguous change region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Whether `line` on `side` falls inside this hunk's tagged lines.
    pub fn contains(&self, side: Side, line: u32) -> bool {
        self.lines.iter().any(|l| l.line_on(side) == Some(line))
    }
}

/// One changed file with its hunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    /// Current path (new path for renames).
    pub path: String,
    /// Previous path, for renames.
    pub old_path: Option<String>,
    pub status: FileStatus,
    pub hunks: Vec<Hunk>,
    /// Binary patches carry no hunks.
    pub is_binary: bool,
}

/// The full change set of an MR at a given head SHA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedDiff {
    pub files: Vec<FileDiff>,
}

impl UnifiedDiff {
    /// Finds a file by its current path; renamed files resolve under the
    /// new path only.
    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.path == path)
    }
}
