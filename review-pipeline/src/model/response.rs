//! Unified review response: what the processor hands the output layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Side;

/// Severity of an inline finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CommentSeverity {
    Info,
    Nit,
    Warn,
    Block,
}

impl CommentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentSeverity::Info => "info",
            CommentSeverity::Nit => "nit",
            CommentSeverity::Warn => "warn",
            CommentSeverity::Block => "block",
        }
    }
}

/// One inline comment targeting a diff location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineComment {
    pub path: String,
    pub side: Side,
    pub line: u32,
    pub body: String,
    pub severity: CommentSeverity,
}

impl InlineComment {
    /// Deterministic posting tag derived from
    /// `(head_sha, path, side, line, hash(body))`. The output layer embeds
    /// it in a hidden marker and skips re-posting comments whose tag is
    /// already present on the MR, making retries safe.
    pub fn client_tag(&self, head_sha: &str) -> String {
        let body_hash = hex::encode(Sha256::digest(self.body.as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(head_sha.as_bytes());
        hasher.update(b"|");
        hasher.update(self.path.as_bytes());
        hasher.update(b"|");
        hasher.update(self.side.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.line.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(body_hash.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

/// Complete result of one review pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// Free-text MR-level summary.
    pub summary: String,
    pub inline_comments: Vec<InlineComment>,
    /// Optional follow-up suggestions appended to the summary.
    pub suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(body: &str, line: u32) -> InlineComment {
        InlineComment {
            path: "src/lib.rs".into(),
            side: Side::New,
            line,
            body: body.into(),
            severity: CommentSeverity::Warn,
        }
    }

    #[test]
    fn client_tag_is_deterministic_and_position_sensitive() {
        let a = comment("use ? instead of unwrap", 12);
        let b = comment("use ? instead of unwrap", 12);
        assert_eq!(a.client_tag("abc123"), b.client_tag("abc123"));
        assert_eq!(a.client_tag("abc123").len(), 16);

        // Any coordinate change produces a different tag.
        assert_ne!(a.client_tag("abc123"), a.client_tag("def456"));
        assert_ne!(
            a.client_tag("abc123"),
            comment("use ? instead of unwrap", 13).client_tag("abc123")
        );
        assert_ne!(
            a.client_tag("abc123"),
            comment("different body", 12).client_tag("abc123")
        );
    }

    #[test]
    fn severity_serializes_lowercase() {
        let json = serde_json::to_string(&CommentSeverity::Block).unwrap();
        assert_eq!(json, "\"block\"");
        let parsed: CommentSeverity = serde_json::from_str("\"nit\"").unwrap();
        assert_eq!(parsed, CommentSeverity::Nit);
    }
}
