// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Run State
//
// The mutable record threading a single request through the pipeline.
// Exclusively owned by its run: created at request start, discarded after
// the report is returned. Nothing persists it beyond the distill side-effect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::llm::LLMError;
use crate::domain::memory::MemoryHit;
use crate::domain::research::ResearchFindings;

/// Generation-strategy tier a request is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Basic,
    Engineer,
    Reasoner,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Basic => "basic",
            Route::Engineer => "engineer",
            Route::Reasoner => "reasoner",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage identifiers, used for trace events, timing keys and the
/// typed run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Triage,
    Context,
    Basic,
    Draft,
    Review,
    Distill,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Triage => "triage",
            Stage::Context => "context",
            Stage::Basic => "basic",
            Stage::Draft => "draft",
            Stage::Review => "review",
            Stage::Distill => "distill",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single fatal path out of a run: a mandatory-output generation stage
/// failed. Every other internal failure is absorbed into the report.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("generation failed during {stage} stage: {source}")]
    Generation {
        stage: Stage,
        #[source]
        source: LLMError,
    },
}

impl RunError {
    pub fn stage(&self) -> Stage {
        match self {
            RunError::Generation { stage, .. } => *stage,
        }
    }
}

/// Which decode path produced a review verdict, so tests can assert parser
/// behavior deterministically instead of depending on model wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePath {
    /// Strict structured decode of the whole response.
    Strict,
    /// Salvaged from a balanced-brace block embedded in free text.
    Extracted,
    /// Conservative default after both decodes failed.
    Defaulted,
    /// Synthesized fixed-acceptance verdict (basic route short-circuit).
    Fixed,
}

impl Default for DecodePath {
    fn default() -> Self {
        DecodePath::Strict
    }
}

fn default_passed() -> bool {
    true
}

fn default_score() -> u8 {
    6
}

/// Structured review verdict from the quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    #[serde(default = "default_passed")]
    pub passed: bool,
    /// Quality score, 1–10.
    #[serde(default = "default_score")]
    pub score: u8,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub summary: String,
    /// Not part of the wire shape; stamped by the decoder.
    #[serde(skip, default)]
    pub decoder: DecodePath,
}

impl ReviewVerdict {
    /// Fixed-acceptance verdict for routes that skip the review cycle.
    pub fn fixed_accept(score: u8, summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            score,
            errors: Vec::new(),
            warnings: Vec::new(),
            summary: summary.into(),
            decoder: DecodePath::Fixed,
        }
    }
}

/// Context gathered ahead of drafting. Each source is independently optional;
/// an absent source means the lookup was skipped or failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedContext {
    pub memory: Option<Vec<MemoryHit>>,
    pub research: Option<ResearchFindings>,
}

impl RetrievedContext {
    pub fn sources(&self) -> Vec<String> {
        let mut sources = Vec::new();
        if self.memory.is_some() {
            sources.push("semantic-memory".to_string());
        }
        if self.research.is_some() {
            sources.push("live-research".to_string());
        }
        sources
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.research.is_none()
    }
}

/// Caller-facing input of the run entry point.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub query: String,
    /// Overrides the configured draft↔review budget; clamped to the hard
    /// ceiling.
    pub max_iterations: Option<u32>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), max_iterations: None }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Tracks the full lifecycle of a request through the orchestrator.
#[derive(Debug, Clone)]
pub struct RunState {
    pub query: String,
    pub route: Option<Route>,
    pub context: RetrievedContext,
    pub draft: Option<String>,
    pub review: Option<ReviewVerdict>,
    /// Carried into the next draft as corrective feedback; non-empty only
    /// between a failed review and the draft that consumes it.
    pub validation_errors: Vec<String>,
    pub final_deliverable: Option<String>,
    /// Set when the iteration budget was exhausted without a passing review.
    pub degraded: bool,
    /// Completed draft↔review rounds.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Stage name → elapsed seconds. Accumulated, never removed.
    pub timings: BTreeMap<String, f64>,
}

/// Hard ceiling on the caller-overridable iteration budget.
pub const MAX_ITERATION_CEILING: u32 = 5;

impl RunState {
    pub fn new(query: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            query: query.into(),
            route: None,
            context: RetrievedContext::default(),
            draft: None,
            review: None,
            validation_errors: Vec::new(),
            final_deliverable: None,
            degraded: false,
            iteration: 0,
            max_iterations: max_iterations.clamp(1, MAX_ITERATION_CEILING),
            timings: BTreeMap::new(),
        }
    }

    pub fn record_timing(&mut self, name: impl Into<String>, elapsed: Duration) {
        self.timings.insert(name.into(), (elapsed.as_secs_f64() * 100.0).round() / 100.0);
    }

    pub fn into_report(self) -> RunReport {
        RunReport {
            deliverable: self
                .final_deliverable
                .unwrap_or_else(|| "No deliverable generated.".to_string()),
            route: self.route.unwrap_or(Route::Engineer),
            iterations: self.iteration,
            score: self.review.as_ref().map(|v| v.score),
            validation: self.review,
            timings: self.timings,
            context_sources: self.context.sources(),
            degraded: self.degraded,
        }
    }
}

/// What the caller gets back; the one synchronous contract the HTTP layer
/// consumes.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub deliverable: String,
    pub route: Route,
    pub iterations: u32,
    pub score: Option<u8>,
    pub validation: Option<ReviewVerdict>,
    pub timings: BTreeMap<String, f64>,
    pub context_sources: Vec<String>,
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_budget_is_clamped_to_ceiling() {
        let state = RunState::new("q", 12);
        assert_eq!(state.max_iterations, MAX_ITERATION_CEILING);

        let state = RunState::new("q", 0);
        assert_eq!(state.max_iterations, 1);
    }

    #[test]
    fn context_sources_reflect_populated_lookups() {
        let mut ctx = RetrievedContext::default();
        assert!(ctx.is_empty());

        ctx.research = Some(ResearchFindings { answer: "a".into(), citations: vec![] });
        assert_eq!(ctx.sources(), vec!["live-research".to_string()]);
    }

    #[test]
    fn report_falls_back_when_no_deliverable() {
        let state = RunState::new("q", 3);
        let report = state.into_report();
        assert_eq!(report.deliverable, "No deliverable generated.");
        assert_eq!(report.iterations, 0);
        assert!(report.score.is_none());
    }

    #[test]
    fn verdict_decodes_with_defaults_for_missing_fields() {
        let verdict: ReviewVerdict = serde_json::from_str(r#"{"passed": false}"#).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 6);
        assert!(verdict.errors.is_empty());
    }
}
