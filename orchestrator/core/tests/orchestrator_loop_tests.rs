// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the orchestration loop
//!
//! These tests drive the full Triage → Context → {Draft → Review}* → Distill
//! pipeline over scripted stub collaborators and verify the loop's
//! terminal-outcome guarantees: route short-circuits, iteration bounds,
//! feedback convergence, degraded delivery and the sandbox override.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opsforge_core::application::Orchestrator;
use opsforge_core::domain::config::RunSettings;
use opsforge_core::domain::llm::{
    ChatMessage, FinishReason, GenerationBackend, GenerationOptions, GenerationResponse, LLMError,
    ModelTier, TokenUsage,
};
use opsforge_core::domain::memory::{MemoryHit, MemoryQuery, MemoryStore};
use opsforge_core::domain::research::{ResearchFindings, ResearchProvider};
use opsforge_core::domain::run::{RunRequest, Stage};
use opsforge_core::domain::trace::{EventStatus, Trace};
use opsforge_core::domain::validation::{
    SandboxError, SandboxReport, SandboxValidator, ScriptKind, ValidationMode,
};
use opsforge_core::infrastructure::trace_store::{NoopTraceExporter, TraceSink};

/// Generation backend scripted per tier. Queued responses are consumed in
/// order; an exhausted queue fails the call so unscripted usage is loud.
#[derive(Default)]
struct ScriptedBackend {
    responses: Mutex<HashMap<ModelTier, VecDeque<Result<String, String>>>>,
    prompts: Mutex<Vec<(ModelTier, String)>>,
}

impl ScriptedBackend {
    fn push(&self, tier: ModelTier, text: &str) -> &Self {
        self.responses.lock().unwrap().entry(tier).or_default().push_back(Ok(text.to_string()));
        self
    }

    fn push_failure(&self, tier: ModelTier) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .entry(tier)
            .or_default()
            .push_back(Err("backend exploded".to_string()));
        self
    }

    fn prompts_for(&self, tier: ModelTier) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == tier)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        tier: ModelTier,
        messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        let prompt = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");
        self.prompts.lock().unwrap().push((tier, prompt));

        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&tier)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Err(format!("no scripted response for tier {}", tier)));

        match next {
            Ok(text) => Ok(GenerationResponse {
                text,
                usage: TokenUsage { prompt_tokens: 100, completion_tokens: 50, total_tokens: 150 },
                provider: "stub".to_string(),
                model: format!("stub-{}", tier),
                cost_usd: 0.001,
                finish_reason: FinishReason::Stop,
            }),
            Err(reason) => Err(LLMError::Provider(reason)),
        }
    }
}

struct StubMemory {
    hits: Vec<MemoryHit>,
    fail: bool,
}

impl StubMemory {
    fn empty() -> Self {
        Self { hits: Vec::new(), fail: false }
    }

    fn failing() -> Self {
        Self { hits: Vec::new(), fail: true }
    }
}

#[async_trait]
impl MemoryStore for StubMemory {
    async fn query(&self, _query: &MemoryQuery) -> anyhow::Result<Vec<MemoryHit>> {
        if self.fail {
            anyhow::bail!("vector index unreachable");
        }
        Ok(self.hits.clone())
    }

    async fn upsert(
        &self,
        _id: &str,
        _content: &str,
        _metadata: HashMap<String, serde_json::Value>,
    ) -> anyhow::Result<bool> {
        if self.fail {
            anyhow::bail!("vector index unreachable");
        }
        Ok(true)
    }
}

struct StubResearch {
    findings: ResearchFindings,
}

impl StubResearch {
    fn none() -> Self {
        Self { findings: ResearchFindings::default() }
    }

    fn with_answer(answer: &str) -> Self {
        Self {
            findings: ResearchFindings {
                answer: answer.to_string(),
                citations: vec!["https://example.com/doc".to_string()],
            },
        }
    }
}

#[async_trait]
impl ResearchProvider for StubResearch {
    async fn search(&self, _query: &str) -> anyhow::Result<ResearchFindings> {
        Ok(self.findings.clone())
    }
}

/// Sandbox stub: scripted failures first, then clean passes.
struct StubSandbox {
    failures: Mutex<VecDeque<Vec<String>>>,
    calls: Mutex<u32>,
}

impl StubSandbox {
    fn passing() -> Self {
        Self { failures: Mutex::new(VecDeque::new()), calls: Mutex::new(0) }
    }

    fn failing_once(errors: &[&str]) -> Self {
        let mut failures = VecDeque::new();
        failures.push_back(errors.iter().map(|s| s.to_string()).collect());
        Self { failures: Mutex::new(failures), calls: Mutex::new(0) }
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl SandboxValidator for StubSandbox {
    async fn validate(&self, _source: &str, _kind: ScriptKind) -> Result<SandboxReport, SandboxError> {
        *self.calls.lock().unwrap() += 1;
        let errors = self.failures.lock().unwrap().pop_front().unwrap_or_default();
        Ok(SandboxReport {
            passed: errors.is_empty(),
            errors,
            warnings: Vec::new(),
            formatted: Some(true),
            raw_output: String::new(),
            mode: ValidationMode::Isolated,
        })
    }
}

#[derive(Default)]
struct SpySink {
    traces: Mutex<Vec<Trace>>,
}

impl TraceSink for SpySink {
    fn record(&self, trace: &Trace) {
        self.traces.lock().unwrap().push(trace.clone());
    }
}

fn settings() -> RunSettings {
    RunSettings {
        max_iterations: 3,
        generation_timeout: Duration::from_secs(5),
        tool_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn build_orchestrator(
    backend: Arc<ScriptedBackend>,
    memory: Arc<StubMemory>,
    research: Arc<StubResearch>,
    sandbox: Arc<StubSandbox>,
    sink: Arc<SpySink>,
) -> Orchestrator {
    Orchestrator::new(backend, memory, research, sandbox, sink, Arc::new(NoopTraceExporter), settings())
}

const PASS_REVIEW: &str = r#"{"passed": true, "score": 8, "errors": [], "warnings": [], "summary": "approved"}"#;
const FAIL_REVIEW: &str = r#"{"passed": false, "score": 4, "errors": ["missing variable description"], "warnings": [], "summary": "rejected"}"#;

#[tokio::test]
async fn basic_route_never_enters_the_review_cycle() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.push(ModelTier::Triage, "BASIC").push(ModelTier::Triage, "A VNet is a virtual network.");

    let sandbox = Arc::new(StubSandbox::passing());
    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend.clone(),
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        sandbox.clone(),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("What is an Azure VNet?")).await.unwrap();

    assert_eq!(report.route.as_str(), "basic");
    assert_eq!(report.iterations, 0);
    assert_eq!(report.score, Some(7));
    assert_eq!(report.deliverable, "A VNet is a virtual network.");
    assert!(!report.degraded);
    // No drafting backend calls, no sandbox runs, no context retrieval.
    assert!(backend.prompts_for(ModelTier::Engineer).is_empty());
    assert_eq!(sandbox.call_count(), 0);
    assert!(report.context_sources.is_empty());
}

#[tokio::test]
async fn engineer_route_passes_first_review_in_one_iteration() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "runbook draft")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("write a failover runbook")).await.unwrap();

    assert_eq!(report.iterations, 1);
    assert_eq!(report.deliverable, "runbook draft");
    assert_eq!(report.score, Some(8));
    let verdict = report.validation.unwrap();
    assert!(verdict.passed);
    assert!(verdict.errors.is_empty());
}

#[tokio::test]
async fn failed_review_feeds_errors_into_next_draft_and_converges() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "network module draft v1")
        .push(ModelTier::Critic, FAIL_REVIEW)
        .push(ModelTier::Engineer, "network module draft v2 with variable descriptions")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend.clone(),
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report =
        orchestrator.run(RunRequest::new("create a basic network module")).await.unwrap();

    // Converged on the second round with the corrected draft.
    assert_eq!(report.iterations, 2);
    assert_eq!(report.score, Some(8));
    assert_eq!(report.deliverable, "network module draft v2 with variable descriptions");
    assert!(!report.degraded);

    // The second draft prompt carried the reviewer's errors as feedback.
    let draft_prompts = backend.prompts_for(ModelTier::Engineer);
    assert_eq!(draft_prompts.len(), 2);
    assert!(!draft_prompts[0].contains("missing variable description"));
    assert!(draft_prompts[1].contains("## Previous Validation Errors (FIX THESE)"));
    assert!(draft_prompts[1].contains("- missing variable description"));
}

#[tokio::test]
async fn exhausted_budget_delivers_last_draft_flagged_degraded() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "draft one")
        .push(ModelTier::Critic, FAIL_REVIEW)
        .push(ModelTier::Engineer, "draft two")
        .push(ModelTier::Critic, FAIL_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator
        .run(RunRequest::new("hard request").with_max_iterations(2))
        .await
        .unwrap();

    assert_eq!(report.iterations, 2);
    assert!(report.degraded);
    assert_eq!(report.deliverable, "draft two");
    assert!(!report.validation.unwrap().passed);
}

#[tokio::test]
async fn single_iteration_budget_still_delivers() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "the only draft")
        .push(ModelTier::Critic, FAIL_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report =
        orchestrator.run(RunRequest::new("q").with_max_iterations(1)).await.unwrap();

    assert_eq!(report.iterations, 1);
    assert_eq!(report.deliverable, "the only draft");
    assert!(report.degraded);
}

#[tokio::test]
async fn sandbox_failure_overrides_passing_semantic_review() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(
            ModelTier::Engineer,
            "```terraform\nresource \"azurerm_lb\" \"lb\" { skuu = \"Standard\" }\n```",
        )
        .push(ModelTier::Critic, r#"{"passed": true, "score": 9, "summary": "looks great"}"#)
        .push(ModelTier::Triage, "compressed lesson");

    let sandbox = Arc::new(StubSandbox::failing_once(&["Unsupported argument \"skuu\""]));
    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        sandbox.clone(),
        sink,
    );

    let report =
        orchestrator.run(RunRequest::new("create a load balancer").with_max_iterations(1)).await.unwrap();

    assert_eq!(sandbox.call_count(), 1);
    let verdict = report.validation.unwrap();
    assert!(!verdict.passed, "objective validation must outrank the semantic verdict");
    assert!(verdict.errors.iter().any(|e| e.starts_with("[terraform]")));
    assert!(report.degraded);
}

#[tokio::test]
async fn failing_context_provider_never_aborts_the_run() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "draft")
        .push(ModelTier::Critic, PASS_REVIEW);

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend.clone(),
        Arc::new(StubMemory::failing()),
        Arc::new(StubResearch::with_answer("current SKU guidance")),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("q")).await.unwrap();

    // Memory failed, research landed; the run completed regardless.
    assert_eq!(report.context_sources, vec!["live-research".to_string()]);
    assert_eq!(report.iterations, 1);
    let draft_prompt = &backend.prompts_for(ModelTier::Engineer)[0];
    assert!(draft_prompt.contains("current SKU guidance"));
    assert!(!draft_prompt.contains("Past Relevant Experiences"));
}

#[tokio::test]
async fn triage_failure_fails_open_to_engineer() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.push_failure(ModelTier::Triage);
    backend
        .push(ModelTier::Engineer, "draft")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("q")).await.unwrap();
    assert_eq!(report.route.as_str(), "engineer");
    assert_eq!(report.iterations, 1);
}

#[tokio::test]
async fn draft_failure_is_fatal_and_names_the_stage() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.push(ModelTier::Triage, "ENGINEER");
    backend.push_failure(ModelTier::Engineer);

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink.clone(),
    );

    let err = orchestrator.run(RunRequest::new("q")).await.unwrap_err();
    assert_eq!(err.stage(), Stage::Draft);

    // The in-progress trace was still flushed, marked errored.
    let traces = sink.traces.lock().unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, EventStatus::Error);
}

#[tokio::test]
async fn every_run_flushes_exactly_one_trace_with_rollups() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "draft")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend,
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink.clone(),
    );

    let report = orchestrator.run(RunRequest::new("q")).await.unwrap();
    assert!(report.timings.contains_key("triage"));
    assert!(report.timings.contains_key("draft_1"));
    assert!(report.timings.contains_key("review_1"));
    assert!(report.timings.contains_key("total"));

    let traces = sink.traces.lock().unwrap();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.status, EventStatus::Ok);
    assert_eq!(trace.final_score, Some(8.0));
    // triage + draft + review generations at 150 tokens each; the short
    // deliverable skips distill compression.
    assert_eq!(trace.total_tokens, 450);
    let names: Vec<&str> = trace.events.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"triage"));
    assert!(names.contains(&"draft_1"));
    assert!(names.contains(&"review_1"));
    assert!(names.contains(&"distill"));
}

#[tokio::test]
async fn reasoner_route_uses_the_reasoner_tier() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "REASONER")
        .push(ModelTier::Reasoner, "root cause analysis")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend.clone(),
        Arc::new(StubMemory::empty()),
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("why does replication keep failing?")).await.unwrap();

    assert_eq!(report.route.as_str(), "reasoner");
    assert_eq!(report.deliverable, "root cause analysis");
    assert_eq!(backend.prompts_for(ModelTier::Reasoner).len(), 1);
    assert!(backend.prompts_for(ModelTier::Engineer).is_empty());
}

#[tokio::test]
async fn memory_hits_are_embedded_into_the_draft_prompt() {
    let backend = Arc::new(ScriptedBackend::default());
    backend
        .push(ModelTier::Triage, "ENGINEER")
        .push(ModelTier::Engineer, "draft")
        .push(ModelTier::Critic, PASS_REVIEW)
        .push(ModelTier::Triage, "compressed lesson");

    let memory = Arc::new(StubMemory {
        hits: vec![MemoryHit {
            id: "exp-1".to_string(),
            similarity: 0.88,
            content: "expired SAML cert was the root cause".to_string(),
            metadata: HashMap::new(),
        }],
        fail: false,
    });

    let sink = Arc::new(SpySink::default());
    let orchestrator = build_orchestrator(
        backend.clone(),
        memory,
        Arc::new(StubResearch::none()),
        Arc::new(StubSandbox::passing()),
        sink,
    );

    let report = orchestrator.run(RunRequest::new("fix ADFS auth")).await.unwrap();
    assert_eq!(report.context_sources, vec!["semantic-memory".to_string()]);

    let draft_prompt = &backend.prompts_for(ModelTier::Engineer)[0];
    assert!(draft_prompt.contains("[Score: 0.88] expired SAML cert was the root cause"));
}
