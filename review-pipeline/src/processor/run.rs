//! Batch execution: prompts out, merged [`UnifiedResponse`] back.
//!
//! Batches fan out through the resilient LLM client under its concurrency
//! bound; results aggregate deterministically in source order (batch order,
//! then file order within the batch, then line order within the file),
//! regardless of completion order. Reliability metadata (retries, repairs,
//! timeouts, batch stats) is written to the review event log as it is
//! observed.
//!
//! Pass states: `Planned → Running → Aggregating → Ready`, degrading to
//! `Partial` when at least one batch failed after retries but others
//! produced comments.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use llm_service::{AiLlmError, ResilientLlmClient};
use review_store::Store;
use review_store::events::EventKind as AuditKind;
use review_store::learnings::Learning;

use crate::errors::PipelineResult;
use crate::model::Side;
use crate::model::response::{CommentSeverity, InlineComment, UnifiedResponse};
use crate::processor::context::ReviewContext;
use crate::processor::plan::{Batch, BatchPlan, PlanConfig};

/// Review pass lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Planned,
    Running,
    Aggregating,
    Ready,
    /// Some batches failed after retries; partial results still post with a
    /// prominent notice in the summary.
    Partial,
}

/// JSON shape each batch invocation must return.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchReview {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub comments: Vec<RawComment>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// One model-produced finding, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawComment {
    pub path: String,
    #[serde(default)]
    pub side: Option<String>,
    pub line: u32,
    pub body: String,
    #[serde(default)]
    pub severity: Option<CommentSeverity>,
}

/// System prompt shared by every batch.
pub const REVIEW_SYSTEM_PROMPT: &str = "\
You are a precise code review assistant. You comment only on the changed \
lines you are shown, never on imagined code. You return STRICT JSON and \
nothing else.";

/// Builds the user prompt for one batch.
pub fn build_batch_prompt(
    ctx: &ReviewContext,
    batch: &Batch,
    learnings: &[Learning],
) -> String {
    let mr = &ctx.merge_request;
    let mut p = String::new();

    p.push_str(
        "Review the following merge request changes. Return ONLY JSON with this exact shape:\n\
         {\"summary\": \"...\", \"comments\": [{\"path\": \"...\", \"side\": \"old\"|\"new\", \
         \"line\": 1, \"body\": \"...\", \"severity\": \"info\"|\"nit\"|\"warn\"|\"block\"}], \
         \"suggestions\": [\"...\"]}\n\
         Comment only where you have something concrete and actionable; \
         use \"old\" side only for removed lines.\n\n",
    );

    if !learnings.is_empty() {
        p.push_str("Reviewer preferences learned from past reviews:\n");
        for l in learnings {
            p.push_str(&format!("- {}: {}\n", l.pattern, l.preferred_style));
        }
        p.push('\n');
    }

    p.push_str(&format!("Title: {}\n", mr.title));
    if let Some(desc) = &mr.description {
        if !desc.trim().is_empty() {
            p.push_str(&format!("Description: {}\n", desc.trim()));
        }
    }
    p.push_str(&format!(
        "Branches: {} → {}\n\n",
        mr.source_branch, mr.target_branch
    ));

    if !ctx.conversation.is_empty() {
        p.push_str("Recent discussion:\n");
        for c in ctx.conversation.iter().rev().take(6).rev() {
            p.push_str(&format!("[{}] {}\n", c.author.login, truncate(&c.body, 300)));
        }
        p.push('\n');
    }

    p.push_str("Changed files (unified diff):\n");
    for f in &batch.files {
        p.push_str(&format!("--- {} ({}) ---\n", f.path, f.status.as_str()));
        p.push_str(&f.patch_text());
        p.push('\n');
    }

    p
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        return s.to_string();
    }
    s.chars().take(n).collect::<String>() + "…"
}

/// Outcome of one batch, in plan order.
pub type BatchOutcome = Result<BatchReview, AiLlmError>;

/// Merges per-batch outputs into one response, deterministically.
///
/// Order is source order: batches in plan order, then file order inside the
/// batch, then line ascending inside the file. The inline cap is applied
/// after ordering so the kept comments are the earliest in source order;
/// a truncation note lands in the summary. Comments with unknown paths are
/// dropped; out-of-hunk lines are kept (the output layer consolidates
/// unanchorable ones).
pub fn merge_batches(
    outcomes: &[BatchOutcome],
    plan: &BatchPlan,
    ctx: &ReviewContext,
    cfg: &PlanConfig,
) -> (UnifiedResponse, PassState) {
    let mut summaries: Vec<String> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut inline: Vec<InlineComment> = Vec::new();
    let mut failed_batches = 0usize;
    let mut dropped = 0usize;

    for (idx, outcome) in outcomes.iter().enumerate() {
        let Some(batch) = plan.batches.get(idx) else {
            continue;
        };
        match outcome {
            Err(_) => failed_batches += 1,
            Ok(review) => {
                if let Some(s) = &review.summary {
                    if !s.trim().is_empty() {
                        summaries.push(s.trim().to_string());
                    }
                }
                suggestions.extend(review.suggestions.iter().cloned());

                // Order within the batch: file order, then line.
                let file_order: Vec<&str> =
                    batch.files.iter().map(|f| f.path.as_str()).collect();
                let mut batch_comments: Vec<&RawComment> = review
                    .comments
                    .iter()
                    .filter(|c| {
                        let known = ctx.diff.file(&c.path).is_some();
                        if !known {
                            dropped += 1;
                        }
                        known && !c.body.trim().is_empty()
                    })
                    .collect();
                batch_comments.sort_by_key(|c| {
                    (
                        file_order
                            .iter()
                            .position(|p| *p == c.path)
                            .unwrap_or(usize::MAX),
                        c.line,
                    )
                });

                for c in batch_comments {
                    inline.push(InlineComment {
                        path: c.path.clone(),
                        side: match c.side.as_deref() {
                            Some("old") => Side::Old,
                            _ => Side::New,
                        },
                        line: c.line,
                        body: c.body.trim().to_string(),
                        severity: c.severity.unwrap_or(CommentSeverity::Info),
                    });
                }
            }
        }
    }

    let total_found = inline.len();
    if inline.len() > cfg.max_inline_comments {
        inline.truncate(cfg.max_inline_comments);
    }

    let mut summary = String::new();
    if failed_batches > 0 {
        summary.push_str(&format!(
            "**Note: this review is partial — {failed_batches} of {} batch(es) failed and their files were not reviewed.**\n\n",
            outcomes.len()
        ));
    }
    if summaries.is_empty() {
        summary.push_str("Automated review completed.");
    } else {
        summary.push_str(&summaries.join("\n\n"));
    }
    if total_found > cfg.max_inline_comments {
        summary.push_str(&format!(
            "\n\n{} findings exceeded the inline cap of {}; the earliest in diff order are shown.",
            total_found, cfg.max_inline_comments
        ));
    }
    if dropped > 0 {
        warn!(dropped, "merge: comments on unknown paths dropped");
    }

    let state = if failed_batches == 0 {
        PassState::Ready
    } else {
        PassState::Partial
    };

    (
        UnifiedResponse {
            summary,
            inline_comments: inline,
            suggestions,
        },
        state,
    )
}

/// Runs the whole pass: prompts per batch, bounded fan-out, audit events,
/// deterministic merge.
pub async fn run(
    ctx: &ReviewContext,
    plan: &BatchPlan,
    llm: &Arc<ResilientLlmClient>,
    store: &Store,
    review_id: &str,
    learnings: &[Learning],
    cfg: &PlanConfig,
) -> PipelineResult<(UnifiedResponse, PassState)> {
    if plan.batches.is_empty() {
        return Ok((
            UnifiedResponse {
                summary: "Automated review completed: no reviewable text changes found."
                    .to_string(),
                ..Default::default()
            },
            PassState::Ready,
        ));
    }

    let prompts: Vec<String> = plan
        .batches
        .iter()
        .map(|b| build_batch_prompt(ctx, b, learnings))
        .collect();

    info!(batches = prompts.len(), review_id, "pass running");
    let (results, stats) = Arc::clone(llm)
        .invoke_batch::<BatchReview>(prompts, Some(REVIEW_SYSTEM_PROMPT.to_string()))
        .await;

    // Audit every noteworthy per-batch outcome.
    for (idx, r) in results.iter().enumerate() {
        match r {
            Ok(inv) => {
                if inv.attempts > 1 {
                    store
                        .record_event(
                            review_id,
                            AuditKind::Retry,
                            &serde_json::json!({ "batch": idx, "attempts": inv.attempts }),
                        )
                        .await?;
                }
                if !inv.repairs.is_empty() {
                    store
                        .record_event(
                            review_id,
                            AuditKind::JsonRepair,
                            &serde_json::json!({ "batch": idx, "strategies": inv.repairs }),
                        )
                        .await?;
                }
            }
            Err(AiLlmError::Timeout { secs }) => {
                store
                    .record_event(
                        review_id,
                        AuditKind::Timeout,
                        &serde_json::json!({ "batch": idx, "timeout_secs": secs }),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(batch = idx, error = %e, "batch failed after retries");
            }
        }
    }
    store
        .record_event(
            review_id,
            AuditKind::BatchStats,
            &serde_json::to_value(&stats).unwrap_or_default(),
        )
        .await?;

    let outcomes: Vec<BatchOutcome> = results
        .into_iter()
        .map(|r| r.map(|inv| inv.value))
        .collect();

    let (response, state) = merge_batches(&outcomes, plan, ctx, cfg);
    info!(
        review_id,
        inline = response.inline_comments.len(),
        state = ?state,
        "pass aggregated"
    );
    Ok((response, state))
}
