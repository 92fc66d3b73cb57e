//! Unified-diff parsing for the position engine.
//!
//! The parser is block-oriented: the input is segmented at `@@` headers
//! first, then each block (header + body slice) is turned into a [`Hunk`]
//! on its own. Anything before the first header — `diff --git` lines,
//! `---`/`+++` file headers, prose — falls outside every block and is
//! ignored, so hunks-only fragments (the per-file `patch`/`diff` strings
//! forges hand out) and full multi-file patches both parse.
//!
//! Headers with ranges that do not parse as numbers are rejected rather
//! than defaulted; a hunk the parser cannot place is worse than a hunk it
//! drops. Identical input always yields identical hunks, and
//! [`serialize_hunks`] reproduces the original patch bytes modulo header
//! whitespace, which the round-trip tests pin down.

pub mod position;

use crate::model::Side;
use crate::model::diff::{DiffLine, FileDiff, FileStatus, Hunk, UnifiedDiff};

/// Old/new line counters advanced while tagging a hunk body.
struct LineCursor {
    old: u32,
    new: u32,
}

/// Parses unified-diff text into hunks. Only `@@` headers are required;
/// file headers may or may not be present.
pub fn parse_hunks(s: &str) -> Vec<Hunk> {
    let lines: Vec<&str> = s.lines().collect();
    let mut hunks = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        if !lines[i].starts_with("@@") {
            i += 1;
            continue;
        }
        let header = lines[i];

        // The body runs up to the next header (or the end of input).
        let body_start = i + 1;
        let mut body_end = body_start;
        while body_end < lines.len() && !lines[body_end].starts_with("@@") {
            body_end += 1;
        }

        if let Some((old, new)) = hunk_ranges(header) {
            if let Some(hunk) = hunk_from_block(old, new, &lines[body_start..body_end]) {
                hunks.push(hunk);
            }
        }
        i = body_end;
    }
    hunks
}

/// `@@ -12,7 +12,9 @@ …` → `((12, 7), (12, 9))`. A bare number is a
/// one-line range. Malformed ranges yield `None` — never a guessed hunk.
fn hunk_ranges(header: &str) -> Option<((u32, u32), (u32, u32))> {
    let mut tokens = header.split("@@").nth(1)?.split_whitespace();
    let old = signed_range(tokens.next()?, '-')?;
    let new = signed_range(tokens.next()?, '+')?;
    Some((old, new))
}

/// Parses one `-start[,count]` / `+start[,count]` range token.
fn signed_range(token: &str, sign: char) -> Option<(u32, u32)> {
    let nums = token.strip_prefix(sign)?;
    match nums.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((nums.parse().ok()?, 1)),
    }
}

/// Tags one hunk body, advancing the line cursors per side. Returns `None`
/// for an empty body (a header with nothing under it carries no content).
fn hunk_from_block(old: (u32, u32), new: (u32, u32), body: &[&str]) -> Option<Hunk> {
    let mut cursor = LineCursor { old: old.0, new: new.0 };
    let mut tagged = Vec::with_capacity(body.len());

    for raw in body {
        let line = match raw.as_bytes().first() {
            // "\ No newline at end of file" is metadata, not content.
            Some(b'\\') => continue,
            Some(b'+') => {
                let l = DiffLine::Added {
                    new_line: cursor.new,
                    content: raw[1..].to_string(),
                };
                cursor.new += 1;
                l
            }
            Some(b'-') => {
                let l = DiffLine::Removed {
                    old_line: cursor.old,
                    content: raw[1..].to_string(),
                };
                cursor.old += 1;
                l
            }
            Some(b' ') => {
                let l = DiffLine::Context {
                    old_line: cursor.old,
                    new_line: cursor.new,
                    content: raw[1..].to_string(),
                };
                cursor.old += 1;
                cursor.new += 1;
                l
            }
            // No recognizable prefix (or an empty line): count it on both
            // sides so later lines keep their numbers.
            _ => {
                let l = DiffLine::Context {
                    old_line: cursor.old,
                    new_line: cursor.new,
                    content: raw.to_string(),
                };
                cursor.old += 1;
                cursor.new += 1;
                l
            }
        };
        tagged.push(line);
    }

    if tagged.is_empty() {
        return None;
    }
    Some(Hunk {
        old_start: old.0,
        old_count: old.1,
        new_start: new.0,
        new_count: new.1,
        lines: tagged,
    })
}

/// Parses a full multi-file patch into [`FileDiff`]s, reading file status
/// from the `diff --git` block headers.
pub fn parse_patch(s: &str) -> UnifiedDiff {
    let mut files = Vec::new();

    // Split on file boundaries, keeping the header line with each chunk.
    let mut chunks: Vec<&str> = Vec::new();
    let mut rest = s;
    loop {
        let offset = if rest.starts_with("diff --git ") { 1 } else { 0 };
        match rest[offset..].find("\ndiff --git ") {
            Some(i) => {
                let (head, tail) = rest.split_at(offset + i + 1);
                chunks.push(head);
                rest = tail;
            }
            None => {
                chunks.push(rest);
                break;
            }
        }
    }

    for chunk in chunks.into_iter().filter(|c| !c.trim().is_empty()) {
        let mut old_path: Option<String> = None;
        let mut new_path: Option<String> = None;
        let mut is_new = false;
        let mut is_deleted = false;
        let mut is_renamed = false;

        for line in chunk.lines() {
            if line.starts_with("@@") {
                break;
            }
            if let Some(p) = line.strip_prefix("--- a/") {
                old_path = Some(p.to_string());
            } else if line.starts_with("--- /dev/null") {
                is_new = true;
            } else if let Some(p) = line.strip_prefix("+++ b/") {
                new_path = Some(p.to_string());
            } else if line.starts_with("+++ /dev/null") {
                is_deleted = true;
            } else if line.starts_with("new file mode") {
                is_new = true;
            } else if line.starts_with("deleted file mode") {
                is_deleted = true;
            } else if let Some(p) = line.strip_prefix("rename from ") {
                is_renamed = true;
                old_path = Some(p.to_string());
            } else if let Some(p) = line.strip_prefix("rename to ") {
                is_renamed = true;
                new_path = Some(p.to_string());
            }
        }

        let is_binary = looks_like_binary_patch(chunk);
        let hunks = if is_binary { Vec::new() } else { parse_hunks(chunk) };

        let status = if is_renamed {
            FileStatus::Renamed
        } else if is_new {
            FileStatus::Added
        } else if is_deleted {
            FileStatus::Deleted
        } else {
            FileStatus::Modified
        };

        // Renamed/deleted fallbacks: a deleted file only has an old path.
        let path = match (&new_path, &old_path) {
            (Some(p), _) => p.clone(),
            (None, Some(p)) => p.clone(),
            (None, None) => continue,
        };

        files.push(FileDiff {
            path,
            old_path: if is_renamed || is_deleted {
                old_path.clone()
            } else {
                None
            },
            status,
            hunks,
            is_binary,
        });
    }

    UnifiedDiff { files }
}

/// Serializes hunks back to unified-diff text. Inverse of [`parse_hunks`]
/// modulo whitespace-only header normalization.
pub fn serialize_hunks(hunks: &[Hunk]) -> String {
    let mut out = String::new();
    for h in hunks {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            h.old_start, h.old_count, h.new_start, h.new_count
        ));
        for line in &h.lines {
            match line {
                DiffLine::Context { content, .. } => {
                    out.push(' ');
                    out.push_str(content);
                }
                DiffLine::Added { content, .. } => {
                    out.push('+');
                    out.push_str(content);
                }
                DiffLine::Removed { content, .. } => {
                    out.push('-');
                    out.push_str(content);
                }
            }
            out.push('\n');
        }
    }
    out
}

/// Whether a patch fragment is a binary change. Git replaces the hunks of
/// a binary file with a sentinel line (`Binary files X and Y differ`,
/// `Files X and Y differ`, or a `GIT binary patch` literal section), so
/// scan whole lines instead of substring-matching — a code hunk that
/// merely mentions one of these phrases must not count.
pub fn looks_like_binary_patch(s: &str) -> bool {
    s.lines().any(|line| {
        line == "GIT binary patch"
            || ((line.starts_with("Binary files ") || line.starts_with("Files "))
                && line.ends_with(" differ"))
    })
}

/// Builds a [`FileDiff`] from a per-file patch fragment plus metadata the
/// forge reports out-of-band (GitHub `files[].patch`, GitLab `diffs[]`).
pub fn file_diff_from_fragment(
    path: &str,
    old_path: Option<&str>,
    status: FileStatus,
    fragment: Option<&str>,
) -> FileDiff {
    let is_binary = fragment.is_none_or(looks_like_binary_patch);
    let hunks = match fragment {
        Some(f) if !is_binary => parse_hunks(f),
        _ => Vec::new(),
    };
    FileDiff {
        path: path.to_string(),
        old_path: old_path.map(Into::into),
        status,
        hunks,
        is_binary,
    }
}

/// Checks that a position refers to a line present in the diff — used to
/// validate inbound inline comments against the head-SHA snapshot.
pub fn position_exists(diff: &UnifiedDiff, path: &str, side: Side, line: u32) -> bool {
    diff.file(path)
        .map(|f| f.hunks.iter().any(|h| h.contains(side, line)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_HUNKS: &str = "\
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

    #[test]
    fn parses_two_hunks_with_counts() {
        let hunks = parse_hunks(TWO_HUNKS);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].new_start, 44);
        assert_eq!(hunks[0].new_count, 5);
        assert_eq!(hunks[1].old_start, 150);

        // Tagged line numbering advances per side.
        assert!(hunks[0].contains(Side::New, 45));
        assert!(hunks[0].contains(Side::New, 46));
        assert!(!hunks[0].contains(Side::Old, 45));
        assert!(hunks[1].contains(Side::Old, 151));
    }

    #[test]
    fn hunk_header_without_count_defaults_to_one() {
        let hunks = parse_hunks("@@ -3 +3 @@\n-a\n+b\n");
        assert_eq!(hunks[0].old_count, 1);
        assert_eq!(hunks[0].new_count, 1);
    }

    #[test]
    fn round_trip_reproduces_patch_bytes() {
        let hunks = parse_hunks(TWO_HUNKS);
        assert_eq!(serialize_hunks(&hunks), TWO_HUNKS);
    }

    #[test]
    fn no_newline_marker_is_ignored() {
        let patch = "@@ -1,1 +1,1 @@\n-old\n+new\n\\ No newline at end of file\n";
        let hunks = parse_hunks(patch);
        assert_eq!(hunks[0].lines.len(), 2);
    }

    #[test]
    fn full_patch_with_statuses() {
        let patch = "\
diff --git a/src/old_name.rs b/src/new_name.rs
rename from src/old_name.rs
rename to src/new_name.rs
@@ -1,2 +1,2 @@
-fn a() {}
+fn b() {}
 // tail
diff --git a/added.rs b/added.rs
new file mode 100644
--- /dev/null
+++ b/added.rs
@@ -0,0 +1,2 @@
+fn fresh() {}
+// done
diff --git a/gone.rs b/gone.rs
deleted file mode 100644
--- a/gone.rs
+++ /dev/null
@@ -1,1 +0,0 @@
-fn stale() {}
";
        let diff = parse_patch(patch);
        assert_eq!(diff.files.len(), 3);

        let renamed = &diff.files[0];
        assert_eq!(renamed.status, FileStatus::Renamed);
        assert_eq!(renamed.path, "src/new_name.rs");
        assert_eq!(renamed.old_path.as_deref(), Some("src/old_name.rs"));

        let added = &diff.files[1];
        assert_eq!(added.status, FileStatus::Added);
        assert!(added.hunks[0].contains(Side::New, 1));

        let deleted = &diff.files[2];
        assert_eq!(deleted.status, FileStatus::Deleted);
        assert_eq!(deleted.path, "gone.rs");
    }

    #[test]
    fn binary_patch_has_no_hunks() {
        let patch = "diff --git a/logo.png b/logo.png\nBinary files a/logo.png and b/logo.png differ\n";
        let diff = parse_patch(patch);
        assert_eq!(diff.files.len(), 1);
        assert!(diff.files[0].is_binary);
        assert!(diff.files[0].hunks.is_empty());
    }

    #[test]
    fn binary_sentinel_must_be_its_own_line() {
        // A code hunk that merely mentions the phrase is not binary.
        let patch =
            "@@ -1,1 +1,1 @@\n-let msg = \"Binary files a and b differ\";\n+let msg = \"ok\";\n";
        assert!(!looks_like_binary_patch(patch));

        assert!(looks_like_binary_patch(
            "Binary files a/x.bin and b/x.bin differ\n"
        ));
        assert!(looks_like_binary_patch("GIT binary patch\nliteral 48\n"));
    }

    #[test]
    fn malformed_header_drops_the_hunk_not_the_rest() {
        let hunks = parse_hunks("@@ -x,2 +1,2 @@\n a\n b\n@@ -5,1 +5,1 @@\n-q\n+r\n");
        assert_eq!(hunks.len(), 1, "unparseable range is rejected, not guessed");
        assert_eq!(hunks[0].old_start, 5);
        assert!(hunks[0].contains(Side::Old, 5));
    }

    #[test]
    fn fragment_helper_marks_missing_patch_binary() {
        let f = file_diff_from_fragment("logo.png", None, FileStatus::Modified, None);
        assert!(f.is_binary);

        let f = file_diff_from_fragment(
            "a.rs",
            None,
            FileStatus::Modified,
            Some("@@ -1,1 +1,1 @@\n-x\n+y\n"),
        );
        assert_eq!(f.hunks.len(), 1);
    }

    #[test]
    fn position_exists_checks_side_and_path() {
        let diff = UnifiedDiff {
            files: vec![file_diff_from_fragment(
                "a.rs",
                None,
                FileStatus::Modified,
                Some(TWO_HUNKS),
            )],
        };
        assert!(position_exists(&diff, "a.rs", Side::New, 45));
        assert!(!position_exists(&diff, "a.rs", Side::New, 9999));
        assert!(!position_exists(&diff, "missing.rs", Side::New, 45));
    }
}
