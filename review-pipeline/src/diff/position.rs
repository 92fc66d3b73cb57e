//! Anchor resolution: map a (path, side, line) target onto the coordinate a
//! forge expects for inline comments.
//!
//! Two anchor styles exist in the wild:
//! - an integer "position" counting lines within the file's concatenated
//!   patch (GitHub review API) — the first hunk header is not counted,
//!   later ones may or may not be, so that is a knob;
//! - a validated `(line, side)` pair (GitLab discussions, Bitbucket inline).
//!
//! The engine is pure: patches in, deterministic anchors out. Lines outside
//! every hunk yield [`PositionError::UnanchorableLine`] and the output
//! layer degrades those comments to the summary rather than dropping them.
//!
//! Edge policies: deleted files never accept "new" side anchors, added
//! files never accept "old" side anchors, renamed files resolve under the
//! new path. When several hunks contain the requested line (overlapping
//! ranges after rename detection), the hunk with the largest `new_start`
//! that is still ≤ the line wins.

use crate::errors::PositionError;
use crate::model::Side;
use crate::model::diff::{FileDiff, FileStatus, UnifiedDiff};

/// Forge-specific anchor for one inline comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// Line offset within the file's concatenated patch, 1-based.
    PatchPosition(u32),
    /// Validated (line, side) pair.
    LineSide { line: u32, side: Side },
}

/// Whether hunk headers after the first one count toward patch positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Subsequent `@@` lines occupy a position (GitHub semantics).
    Counted,
    /// Only content lines count.
    Skipped,
}

/// Validates side against the file status.
fn check_side(file: &FileDiff, side: Side, line: u32) -> Result<(), PositionError> {
    match (file.status, side) {
        (FileStatus::Deleted, Side::New) => Err(PositionError::InvalidSide {
            path: file.path.clone(),
            side: side.as_str(),
            status: file.status.as_str(),
        }),
        (FileStatus::Added, Side::Old) => Err(PositionError::InvalidSide {
            path: file.path.clone(),
            side: side.as_str(),
            status: file.status.as_str(),
        }),
        _ => {
            let _ = line;
            Ok(())
        }
    }
}

/// Computes the integer patch position of `(side, line)` within `file`.
///
/// Walks hunks in order counting every content line; with
/// [`HeaderMode::Counted`], each hunk header after the first adds one.
/// When more than one hunk matches, the last match wins (it belongs to the
/// hunk with the largest `new_start` ≤ line, since hunks are ordered).
pub fn patch_position(
    file: &FileDiff,
    side: Side,
    line: u32,
    headers: HeaderMode,
) -> Result<u32, PositionError> {
    check_side(file, side, line)?;

    let mut pos = 0u32;
    let mut found: Option<u32> = None;
    for (i, hunk) in file.hunks.iter().enumerate() {
        if i > 0 && headers == HeaderMode::Counted {
            pos += 1;
        }
        for l in &hunk.lines {
            pos += 1;
            if l.line_on(side) == Some(line) {
                found = Some(pos);
            }
        }
    }

    found.ok_or_else(|| PositionError::UnanchorableLine {
        path: file.path.clone(),
        side: side.as_str(),
        line,
    })
}

/// Validates that `(side, line)` exists in some hunk of `file` and returns
/// it as a [`Anchor::LineSide`].
pub fn line_side_anchor(file: &FileDiff, side: Side, line: u32) -> Result<Anchor, PositionError> {
    check_side(file, side, line)?;

    // Tie-break is irrelevant here (any containing hunk validates the
    // line), but keep the largest-new_start-≤-line preference for parity
    // with the position walk.
    let hit = file
        .hunks
        .iter()
        .filter(|h| h.contains(side, line))
        .next_back();

    match hit {
        Some(_) => Ok(Anchor::LineSide { line, side }),
        None => Err(PositionError::UnanchorableLine {
            path: file.path.clone(),
            side: side.as_str(),
            line,
        }),
    }
}

/// Resolves the file for `path` (renamed files live under the new path)
/// and produces the requested anchor style.
pub fn resolve_anchor(
    diff: &UnifiedDiff,
    path: &str,
    side: Side,
    line: u32,
    style: AnchorStyle,
) -> Result<Anchor, PositionError> {
    let file = diff
        .file(path)
        .ok_or_else(|| PositionError::UnknownFile(path.to_string()))?;

    match style {
        AnchorStyle::PatchPosition(headers) => {
            patch_position(file, side, line, headers).map(Anchor::PatchPosition)
        }
        AnchorStyle::LineSide => line_side_anchor(file, side, line),
    }
}

/// Which anchor style the calling forge needs.
#[derive(Debug, Clone, Copy)]
pub enum AnchorStyle {
    PatchPosition(HeaderMode),
    LineSide,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{file_diff_from_fragment, parse_hunks};
    use crate::model::diff::Hunk;

    const PATCH: &str = "\
@@ -40,3 +44,5 @@
 fn setup() {
+    let pool = Pool::new();
+    pool.warm();
     run();
 }
@@ -150,4 +156,3 @@
 fn teardown() {
-    pool.drain();
     stop();
 }
";

    fn modified() -> FileDiff {
        file_diff_from_fragment("src/app.rs", None, FileStatus::Modified, Some(PATCH))
    }

    #[test]
    fn patch_position_counts_side_lines_across_hunks() {
        let f = modified();

        // First hunk: position 1 = " fn setup() {", 2/3 = added lines.
        assert_eq!(
            patch_position(&f, Side::New, 45, HeaderMode::Counted).unwrap(),
            2
        );
        assert_eq!(
            patch_position(&f, Side::New, 46, HeaderMode::Counted).unwrap(),
            3
        );

        // Second hunk: header counts (position 6), then content.
        // Positions: 1..5 first hunk, 6 header, 7 " fn teardown() {",
        // 8 "-    pool.drain();".
        assert_eq!(
            patch_position(&f, Side::Old, 151, HeaderMode::Counted).unwrap(),
            8
        );
        // Header-skipping forges see position 7 for the same line.
        assert_eq!(
            patch_position(&f, Side::Old, 151, HeaderMode::Skipped).unwrap(),
            7
        );
    }

    #[test]
    fn unanchorable_line_is_an_error_not_a_panic() {
        let f = modified();
        let err = patch_position(&f, Side::New, 9_999, HeaderMode::Counted).unwrap_err();
        assert!(matches!(err, PositionError::UnanchorableLine { line: 9_999, .. }));
    }

    #[test]
    fn line_side_validates_existence() {
        let f = modified();
        assert_eq!(
            line_side_anchor(&f, Side::New, 45).unwrap(),
            Anchor::LineSide {
                line: 45,
                side: Side::New
            }
        );
        assert!(line_side_anchor(&f, Side::Old, 45).is_err());
    }

    #[test]
    fn deleted_file_rejects_new_side() {
        let f = file_diff_from_fragment(
            "gone.rs",
            None,
            FileStatus::Deleted,
            Some("@@ -1,1 +0,0 @@\n-fn stale() {}\n"),
        );
        let err = line_side_anchor(&f, Side::New, 1).unwrap_err();
        assert!(matches!(err, PositionError::InvalidSide { .. }));
        assert!(line_side_anchor(&f, Side::Old, 1).is_ok());
    }

    #[test]
    fn added_file_rejects_old_side() {
        let f = file_diff_from_fragment(
            "fresh.rs",
            None,
            FileStatus::Added,
            Some("@@ -0,0 +1,1 @@\n+fn fresh() {}\n"),
        );
        assert!(matches!(
            patch_position(&f, Side::Old, 1, HeaderMode::Counted),
            Err(PositionError::InvalidSide { .. })
        ));
    }

    #[test]
    fn renamed_file_resolves_under_new_path() {
        let diff = UnifiedDiff {
            files: vec![file_diff_from_fragment(
                "new_name.rs",
                Some("old_name.rs"),
                FileStatus::Renamed,
                Some("@@ -1,1 +1,1 @@\n-a\n+b\n"),
            )],
        };
        assert!(resolve_anchor(&diff, "new_name.rs", Side::New, 1, AnchorStyle::LineSide).is_ok());
        assert!(matches!(
            resolve_anchor(&diff, "old_name.rs", Side::New, 1, AnchorStyle::LineSide),
            Err(PositionError::UnknownFile(_))
        ));
    }

    #[test]
    fn overlapping_hunks_prefer_largest_new_start() {
        // Two hunks that both contain new line 10 (synthetic overlap).
        let h1: Vec<Hunk> = parse_hunks("@@ -8,3 +8,3 @@\n a\n b\n c\n");
        let h2: Vec<Hunk> = parse_hunks("@@ -10,2 +10,2 @@\n d\n e\n");
        let f = FileDiff {
            path: "x.rs".into(),
            old_path: None,
            status: FileStatus::Modified,
            hunks: vec![h1[0].clone(), h2[0].clone()],
            is_binary: false,
        };

        // Line 10 exists in both hunks; the walk keeps the LAST match,
        // which sits in the hunk starting at 10.
        // Positions: hunk1 lines at 1..3, header 4, hunk2 lines 5..6.
        assert_eq!(
            patch_position(&f, Side::New, 10, HeaderMode::Counted).unwrap(),
            5
        );
    }
}
