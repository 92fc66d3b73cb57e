//! Webhook-to-review pipeline for LiveReview.
//!
//! The crate covers the whole path from a converted webhook event to
//! comments on the forge:
//!
//! 1. **Providers (input)** — header-based detection, signature
//!    verification, payload → [`model::UnifiedEvent`] conversion, and
//!    paginated context fetch (diff + discussion timeline) for GitHub,
//!    GitLab, and Bitbucket.
//! 2. **Diff engine** — unified-diff parsing into hunks/lines and pure
//!    anchor resolution (patch positions and (line, side) pairs).
//! 3. **Processor** — warrant/scenario routing, context assembly,
//!    token-bounded batch planning, batch execution with deterministic
//!    merge.
//! 4. **Publish (output)** — summary + inline posting with client-tag
//!    idempotency, consolidated unanchorable findings, threaded replies.
//! 5. **Worker** — queue lease loop with per-MR posting serialization and
//!    wall-clock budgets.
//! 6. **Learning** — post-hoc extraction of reviewer guidance.
//!
//! No `async-trait` and no heap trait objects: providers, publishers, and
//! LLM backends dispatch over enums, and errors unify under
//! [`errors::Error`].

pub mod diff;
pub mod errors;
pub mod learning;
pub mod model;
pub mod processor;
pub mod providers;
pub mod publish;
pub mod worker;

pub use errors::{Error, PipelineResult};
pub use model::{EventKind, ProviderKind, UnifiedEvent};
pub use processor::Scenario;
pub use providers::{ConvertContext, ProviderClient, ProviderConfig, ProviderHooks};
pub use worker::{JobPayload, WorkerConfig, spawn_workers};
