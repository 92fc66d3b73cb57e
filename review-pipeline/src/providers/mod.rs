//! Provider facade: capability registry + enum-dispatch clients.
//!
//! Each forge contributes a [`ProviderHooks`] record with a pure
//! header-only `detect`, a pure `convert` from raw payload to
//! [`UnifiedEvent`], and an optional signature capability. The webhook
//! orchestrator composes these at call sites instead of going through a
//! class hierarchy.
//!
//! Network I/O (context fetch, posting) lives in concrete per-forge
//! clients behind the [`ProviderClient`] enum — no `async-trait`, no
//! boxed futures.

pub mod bitbucket;
pub mod github;
pub mod gitlab;
pub mod signature;

use reqwest::header::HeaderMap;

use crate::errors::{ConversionError, PipelineResult, SignatureError};
use crate::model::diff::UnifiedDiff;
use crate::model::{ProviderKind, UnifiedEvent, UnifiedMergeRequest, UnifiedTimeline};

/// Runtime configuration for a provider client, resolved from the
/// connector registry per request/job. Credentials are never cached inside
/// the core.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub connector_id: String,
    /// API base, e.g. "https://api.github.com" or "https://gitlab.com/api/v4".
    pub base_api: String,
    /// Access token (PAT or app token); its owning account is the bot.
    pub token: String,
    pub bot_user_id: String,
    pub bot_login: String,
}

impl ProviderConfig {
    pub fn from_connector(kind: ProviderKind, c: &review_store::registry::Connector) -> Self {
        Self {
            kind,
            connector_id: c.id.clone(),
            base_api: c.api_base.clone(),
            token: c.token.clone(),
            bot_user_id: c.bot_user_id.clone(),
            bot_login: c.bot_login.clone(),
        }
    }
}

/// Pure context handed to `convert`: everything a provider may need to
/// build a [`UnifiedEvent`] without touching the network.
#[derive(Debug, Clone, Copy)]
pub struct ConvertContext<'a> {
    pub connector_id: &'a str,
    pub api_base: &'a str,
    pub bot_user_id: &'a str,
}

/// Signature capability of a provider.
#[derive(Debug, Clone, Copy)]
pub struct SignatureHook {
    /// Verifies the raw body against the connector secret.
    pub verify: fn(&HeaderMap, &[u8], &str) -> Result<(), SignatureError>,
    /// Whether a configured secret makes verification mandatory.
    pub required: bool,
}

/// Capability record one forge contributes to the registry.
#[derive(Clone, Copy)]
pub struct ProviderHooks {
    pub kind: ProviderKind,
    /// Header-only detection; no body parsing.
    pub detect: fn(&HeaderMap) -> bool,
    /// Payload → unified event. `Ok(None)` means the event was recognized
    /// and deliberately discarded (no review impact).
    pub convert:
        fn(ConvertContext<'_>, &HeaderMap, &[u8]) -> Result<Option<UnifiedEvent>, ConversionError>,
    pub signature: Option<SignatureHook>,
}

/// All registered providers, in detection order.
pub const REGISTRY: &[ProviderHooks] = &[
    ProviderHooks {
        kind: ProviderKind::GitHub,
        detect: github::detect,
        convert: github::convert,
        signature: Some(SignatureHook {
            verify: github::verify_signature,
            required: true,
        }),
    },
    ProviderHooks {
        kind: ProviderKind::GitLab,
        detect: gitlab::detect,
        convert: gitlab::convert,
        signature: Some(SignatureHook {
            verify: gitlab::verify_signature,
            required: false,
        }),
    },
    ProviderHooks {
        kind: ProviderKind::Bitbucket,
        detect: bitbucket::detect,
        convert: bitbucket::convert,
        signature: Some(SignatureHook {
            verify: bitbucket::verify_signature,
            required: false,
        }),
    },
];

/// Picks the first provider whose header detector claims the request.
pub fn detect(headers: &HeaderMap) -> Option<&'static ProviderHooks> {
    REGISTRY.iter().find(|h| (h.detect)(headers))
}

/// Looks a provider up by kind.
pub fn hooks_for(kind: ProviderKind) -> &'static ProviderHooks {
    REGISTRY
        .iter()
        .find(|h| h.kind == kind)
        .expect("all provider kinds are registered")
}

/// Full MR context as fetched from the forge: refreshed metadata, the diff
/// snapshot at head SHA, and the complete discussion timeline.
#[derive(Debug, Clone)]
pub struct MrContext {
    pub merge_request: UnifiedMergeRequest,
    pub diff: UnifiedDiff,
    pub timeline: UnifiedTimeline,
}

/// Concrete provider client (enum dispatch).
#[derive(Debug, Clone)]
pub enum ProviderClient {
    GitHub(github::GitHubClient),
    GitLab(gitlab::GitLabClient),
    Bitbucket(bitbucket::BitbucketClient),
}

impl ProviderClient {
    /// Constructs a concrete client from generic config, sharing one
    /// keep-alive `reqwest` pool.
    pub fn from_config(cfg: &ProviderConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("livereview/0.1")
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;
        Ok(match cfg.kind {
            ProviderKind::GitHub => Self::GitHub(github::GitHubClient::new(client, cfg.clone())),
            ProviderKind::GitLab => Self::GitLab(gitlab::GitLabClient::new(client, cfg.clone())),
            ProviderKind::Bitbucket => {
                Self::Bitbucket(bitbucket::BitbucketClient::new(client, cfg.clone()))
            }
        })
    }

    /// Fetches MR metadata, the full changed-file diff, and the complete
    /// discussion timeline. Paginated calls exhaust all pages before
    /// returning.
    pub async fn fetch_context(&self, mr: &UnifiedMergeRequest) -> PipelineResult<MrContext> {
        match self {
            Self::GitHub(c) => c.fetch_context(mr).await,
            Self::GitLab(c) => c.fetch_context(mr).await,
            Self::Bitbucket(c) => c.fetch_context(mr).await,
        }
    }

    /// Metadata only (cheap). Used to confirm the head SHA right before
    /// posting.
    pub async fn fetch_meta(
        &self,
        mr: &UnifiedMergeRequest,
    ) -> PipelineResult<UnifiedMergeRequest> {
        match self {
            Self::GitHub(c) => c.get_meta(mr).await,
            Self::GitLab(c) => c.get_meta(mr).await,
            Self::Bitbucket(c) => c.get_meta(mr).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn detection_is_header_only_and_ordered() {
        let mut h = HeaderMap::new();
        assert!(detect(&h).is_none());

        h.insert("x-github-event", HeaderValue::from_static("pull_request"));
        assert_eq!(detect(&h).unwrap().kind, ProviderKind::GitHub);

        let mut h = HeaderMap::new();
        h.insert("x-gitlab-event", HeaderValue::from_static("Note Hook"));
        assert_eq!(detect(&h).unwrap().kind, ProviderKind::GitLab);

        let mut h = HeaderMap::new();
        h.insert("x-event-key", HeaderValue::from_static("pullrequest:created"));
        assert_eq!(detect(&h).unwrap().kind, ProviderKind::Bitbucket);
    }
}
