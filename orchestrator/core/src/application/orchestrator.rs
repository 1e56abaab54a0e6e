// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestration Loop
//
// Sequences one request through Triage → Context Retrieval → {Draft →
// Review}* → Distill, enforcing the draft↔review retry budget and deciding
// the terminal outcome. Stages are strictly sequential within a run; runs
// are independent and share only the Arc'd collaborators.
//
// Failure policy: triage fails open to the engineer route, context and
// distill degrade silently, draft/review/basic generation failures abort
// the run as a typed error naming the stage.

use metrics::{counter, histogram};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::domain::config::RunSettings;
use crate::domain::llm::{
    ChatMessage, GenerationBackend, GenerationOptions, GenerationResponse, LLMError, ModelTier,
};
use crate::domain::memory::{MemoryQuery, MemoryStore};
use crate::domain::research::ResearchProvider;
use crate::domain::run::{
    ReviewVerdict, Route, RunError, RunReport, RunRequest, RunState, Stage,
};
use crate::domain::trace::EventKind;
use crate::domain::validation::SandboxValidator;
use crate::application::distill::DistillService;
use crate::application::review::ReviewService;
use crate::infrastructure::trace_store::{TraceExporter, TraceRecorder, TraceSink};

const TRIAGE_PROMPT: &str = r#"Classify this IT infrastructure request into exactly one category.

REQUEST: {query}

Categories:
- BASIC: Simple questions, documentation lookups, explanations, no code needed
- ENGINEER: Needs code generation (Terraform, PowerShell, Ansible, scripts), runbook creation, architecture design, IaC modules
- REASONER: Complex troubleshooting, debugging, root cause analysis, multi-step reasoning about failures

Respond with ONLY the category name (BASIC, ENGINEER, or REASONER) and nothing else."#;

const ENGINEER_SYSTEM_PROMPT: &str = r#"You are the primary builder in a multi-step infrastructure delivery pipeline.

Your standards:
- Direct, technical, structured output. No filler.
- Automation-first: idempotent operations, safe defaults, rollback paths, error handling.
- Deliverables must be production-ready: modules, scripts and runbooks a senior engineer can deploy as-is.
- Terraform: modules, variables with descriptions, outputs, lifecycle rules.
- PowerShell: parameters, logging, error handling, structured output.

If you are iterating on a draft that was rejected by review, fix every listed validation error in your revision."#;

const BASIC_SYSTEM_PROMPT: &str =
    "You are a concise IT infrastructure assistant. Be direct and technical.";

/// Memory snippet cap carried into the draft prompt.
const MEMORY_CONTENT_LIMIT: usize = 500;
/// Research answer cap carried into the draft prompt.
const RESEARCH_ANSWER_LIMIT: usize = 1500;
const RESEARCH_CITATION_LIMIT: usize = 5;
const MEMORY_TOP_K: usize = 3;
/// Fixed acceptance score for the basic short-circuit.
const BASIC_ROUTE_SCORE: u8 = 7;

pub struct Orchestrator {
    backend: Arc<dyn GenerationBackend>,
    memory: Arc<dyn MemoryStore>,
    research: Arc<dyn ResearchProvider>,
    reviewer: ReviewService,
    distiller: DistillService,
    trace_sink: Arc<dyn TraceSink>,
    exporter: Arc<dyn TraceExporter>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        memory: Arc<dyn MemoryStore>,
        research: Arc<dyn ResearchProvider>,
        sandbox: Arc<dyn SandboxValidator>,
        trace_sink: Arc<dyn TraceSink>,
        exporter: Arc<dyn TraceExporter>,
        settings: RunSettings,
    ) -> Self {
        let reviewer =
            ReviewService::new(backend.clone(), sandbox, settings.generation_timeout);
        let distiller =
            DistillService::new(backend.clone(), memory.clone(), settings.generation_timeout)
                .with_compression(settings.distill_compression);
        Self { backend, memory, research, reviewer, distiller, trace_sink, exporter, settings }
    }

    /// Run one request to its terminal outcome. This is the single
    /// synchronous contract the HTTP front door calls into.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, RunError> {
        let started = Instant::now();
        counter!("opsforge_runs_started").increment(1);
        info!("Orchestrator starting for: {:.80}", request.query);

        let max_iterations = request.max_iterations.unwrap_or(self.settings.max_iterations);
        let mut state = RunState::new(request.query, max_iterations);
        let mut recorder = TraceRecorder::new(&state.query, self.trace_sink.clone());

        let outcome = self.drive(&mut state, &mut recorder).await;

        state.record_timing("total", started.elapsed());
        recorder.set_route(state.route);
        if let Some(verdict) = &state.review {
            recorder.score(f64::from(verdict.score));
        }
        if let Err(e) = &outcome {
            recorder.mark_error(e.to_string());
        }

        // Local flush happens in all paths; export is best-effort.
        let trace = recorder.finish();
        if let Err(e) = self.exporter.export(&trace).await {
            warn!("Trace export failed (non-fatal): {}", e);
        }

        histogram!("opsforge_run_duration_seconds").record(started.elapsed().as_secs_f64());
        match outcome {
            Ok(()) => {
                counter!("opsforge_runs_completed").increment(1);
                info!(
                    "Orchestrator complete: route={}, iterations={}, score={:?}",
                    state.route.map(|r| r.as_str()).unwrap_or("?"),
                    state.iteration,
                    state.review.as_ref().map(|v| v.score),
                );
                Ok(state.into_report())
            }
            Err(e) => {
                counter!("opsforge_runs_failed").increment(1);
                warn!("Orchestrator failed during {} stage: {}", e.stage(), e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut RunState,
        recorder: &mut TraceRecorder,
    ) -> Result<(), RunError> {
        self.triage(state, recorder).await;

        let route = state.route.unwrap_or(Route::Engineer);
        if route != Route::Basic {
            self.retrieve_context(state, recorder).await;
        }

        if route == Route::Basic {
            // Trivial requests skip the draft↔review cycle entirely.
            self.answer_basic(state, recorder).await?;
        } else {
            while state.iteration < state.max_iterations {
                self.draft(state, recorder).await?;
                self.review(state, recorder).await?;

                if state.final_deliverable.is_some() {
                    break;
                }
                info!(
                    "Iteration {}/{} failed review, retrying with error feedback",
                    state.iteration, state.max_iterations
                );
            }

            if state.final_deliverable.is_none() {
                warn!("Max iterations reached, delivering last draft with warnings");
                state.final_deliverable = state.draft.clone();
                state.degraded = true;
                counter!("opsforge_degraded_deliveries").increment(1);
            }
        }

        if state.final_deliverable.is_some() {
            self.distill(state, recorder).await;
        }

        Ok(())
    }

    /// Classify the request into a route. Never aborts the run: on backend
    /// failure the route fails open to Engineer, the superset path.
    async fn triage(&self, state: &mut RunState, recorder: &mut TraceRecorder) {
        let started = Instant::now();
        let handle = recorder.begin(EventKind::Generation, "triage");

        let prompt = TRIAGE_PROMPT.replace("{query}", &state.query);
        let options =
            GenerationOptions { max_tokens: Some(10), temperature: Some(0.0), json_mode: false };

        match self.generate(ModelTier::Triage, &[ChatMessage::user(prompt)], &options).await {
            Ok(response) => {
                state.route = Some(parse_route(&response.text));
                recorder.end_generation(
                    handle,
                    json!({ "route": state.route.unwrap().as_str() }),
                    &response,
                );
            }
            Err(e) => {
                warn!("Triage failed ({}), defaulting to engineer route", e);
                state.route = Some(Route::Engineer);
                recorder.fail(handle, e.to_string());
            }
        }

        state.record_timing(Stage::Triage.as_str(), started.elapsed());
        info!("Triage route: {}", state.route.unwrap());
    }

    /// Populate context from semantic memory and live research. The lookups
    /// are independent; neither failure prevents the other from landing, and
    /// nothing raises out of this stage.
    async fn retrieve_context(&self, state: &mut RunState, recorder: &mut TraceRecorder) {
        let started = Instant::now();
        let stage = recorder.begin(EventKind::Stage, "context_retrieval");

        let memory_handle = recorder.begin(EventKind::Tool, "semantic-memory");
        let query = MemoryQuery::new(&state.query, MEMORY_TOP_K);
        match tokio::time::timeout(self.settings.tool_timeout, self.memory.query(&query)).await {
            Ok(Ok(hits)) => {
                recorder.end(memory_handle, json!({ "hits": hits.len() }));
                if !hits.is_empty() {
                    info!("Found {} relevant memories", hits.len());
                    let truncated = hits
                        .into_iter()
                        .map(|mut hit| {
                            hit.content = hit.content.chars().take(MEMORY_CONTENT_LIMIT).collect();
                            hit
                        })
                        .collect();
                    state.context.memory = Some(truncated);
                }
            }
            Ok(Err(e)) => {
                warn!("Memory retrieval failed: {}", e);
                recorder.fail(memory_handle, e.to_string());
            }
            Err(_) => {
                warn!("Memory retrieval timed out");
                recorder.fail(memory_handle, "timed out");
            }
        }

        let research_handle = recorder.begin(EventKind::Tool, "live-research");
        match tokio::time::timeout(self.settings.tool_timeout, self.research.search(&state.query))
            .await
        {
            Ok(Ok(mut findings)) => {
                recorder.end(research_handle, json!({ "answer_chars": findings.answer.len() }));
                if !findings.is_empty() {
                    info!("Got research synthesis ({} chars)", findings.answer.len());
                    findings.answer =
                        findings.answer.chars().take(RESEARCH_ANSWER_LIMIT).collect();
                    findings.citations.truncate(RESEARCH_CITATION_LIMIT);
                    state.context.research = Some(findings);
                }
            }
            Ok(Err(e)) => {
                warn!("Research lookup failed: {}", e);
                recorder.fail(research_handle, e.to_string());
            }
            Err(_) => {
                warn!("Research lookup timed out");
                recorder.fail(research_handle, "timed out");
            }
        }

        recorder.end(stage, json!({ "sources": state.context.sources() }));
        state.record_timing(Stage::Context.as_str(), started.elapsed());
    }

    /// Answer a basic-route request with one lightweight call and a fixed
    /// acceptance verdict. Generation failure here is fatal: output is
    /// mandatory.
    async fn answer_basic(
        &self,
        state: &mut RunState,
        recorder: &mut TraceRecorder,
    ) -> Result<(), RunError> {
        let started = Instant::now();
        let handle = recorder.begin(EventKind::Generation, "basic_response");

        let messages =
            [ChatMessage::system(BASIC_SYSTEM_PROMPT), ChatMessage::user(state.query.clone())];
        let options =
            GenerationOptions { max_tokens: Some(2048), temperature: Some(0.7), json_mode: false };

        match self.generate(ModelTier::Triage, &messages, &options).await {
            Ok(response) => {
                recorder.end_generation(handle, json!({ "chars": response.text.len() }), &response);
                state.final_deliverable = Some(response.text);
                state.review =
                    Some(ReviewVerdict::fixed_accept(BASIC_ROUTE_SCORE, "Direct answer"));
                state.record_timing(Stage::Basic.as_str(), started.elapsed());
                Ok(())
            }
            Err(source) => {
                recorder.fail(handle, source.to_string());
                state.record_timing(Stage::Basic.as_str(), started.elapsed());
                Err(RunError::Generation { stage: Stage::Basic, source })
            }
        }
    }

    /// Produce the next draft from query, context and any unresolved
    /// validation errors. Generation failure aborts the run; drafting is
    /// not best-effort.
    async fn draft(&self, state: &mut RunState, recorder: &mut TraceRecorder) -> Result<(), RunError> {
        let started = Instant::now();
        info!("Drafting solution (iteration {}/{})", state.iteration + 1, state.max_iterations);

        let tier = if state.route == Some(Route::Reasoner) {
            ModelTier::Reasoner
        } else {
            ModelTier::Engineer
        };
        let messages = [
            ChatMessage::system(ENGINEER_SYSTEM_PROMPT),
            ChatMessage::user(build_draft_prompt(state)),
        ];
        let options =
            GenerationOptions { max_tokens: Some(8192), temperature: Some(0.3), json_mode: false };

        state.iteration += 1;
        let name = format!("draft_{}", state.iteration);
        let handle = recorder.begin(EventKind::Generation, name.clone());

        match self.generate(tier, &messages, &options).await {
            Ok(response) => {
                recorder.end_generation(handle, json!({ "chars": response.text.len() }), &response);
                info!("Draft complete: {} chars", response.text.len());
                state.draft = Some(response.text);
                state.record_timing(name, started.elapsed());
                Ok(())
            }
            Err(source) => {
                recorder.fail(handle, source.to_string());
                state.record_timing(name, started.elapsed());
                Err(RunError::Generation { stage: Stage::Draft, source })
            }
        }
    }

    /// Gate the current draft. On pass the draft becomes the deliverable and
    /// feedback clears; on fail the errors feed the next draft.
    async fn review(&self, state: &mut RunState, recorder: &mut TraceRecorder) -> Result<(), RunError> {
        let started = Instant::now();
        let name = format!("review_{}", state.iteration);
        let handle = recorder.begin(EventKind::Generation, name.clone());

        let draft = state.draft.clone().unwrap_or_default();
        let route = state.route.unwrap_or(Route::Engineer);

        let (verdict, response) = match self.reviewer.review(&state.query, &draft, route).await {
            Ok(result) => result,
            Err(e) => {
                recorder.fail(handle, e.to_string());
                state.record_timing(name, started.elapsed());
                return Err(e);
            }
        };

        recorder.end_generation(
            handle,
            json!({ "passed": verdict.passed, "score": verdict.score }),
            &response,
        );

        if verdict.passed {
            state.final_deliverable = Some(draft);
            state.validation_errors.clear();
        } else {
            state.validation_errors = verdict.errors.clone();
        }
        state.review = Some(verdict);
        state.record_timing(name, started.elapsed());
        Ok(())
    }

    /// Persist a compressed lesson for future recall. Best-effort by design.
    async fn distill(&self, state: &mut RunState, recorder: &mut TraceRecorder) {
        let started = Instant::now();
        let handle = recorder.begin(EventKind::Stage, "distill");

        let stored = self.distiller.distill(state).await;
        recorder.end(handle, json!({ "stored": stored }));
        state.record_timing(Stage::Distill.as_str(), started.elapsed());
    }

    /// Bounded generation call; a timeout surfaces as an `LLMError` so each
    /// stage applies its own failure policy.
    async fn generate(
        &self,
        tier: ModelTier,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<GenerationResponse, LLMError> {
        tokio::time::timeout(
            self.settings.generation_timeout,
            self.backend.generate(tier, messages, options),
        )
        .await
        .unwrap_or(Err(LLMError::Timeout(self.settings.generation_timeout)))
    }
}

fn parse_route(response: &str) -> Route {
    let upper = response.to_uppercase();
    if upper.contains("ENGINEER") {
        Route::Engineer
    } else if upper.contains("REASONER") {
        Route::Reasoner
    } else {
        Route::Basic
    }
}

/// Compose the draft prompt: request, retrieved context, and an explicit
/// block of unresolved validation errors that must be fixed this revision.
fn build_draft_prompt(state: &RunState) -> String {
    let mut context_parts: Vec<String> = Vec::new();

    if let Some(memories) = &state.context.memory {
        context_parts.push("## Past Relevant Experiences (from memory)".to_string());
        for hit in memories {
            context_parts.push(format!("- [Score: {}] {}", hit.similarity, hit.content));
        }
    }

    if let Some(research) = &state.context.research {
        context_parts.push("\n## Latest Research (from live web search)".to_string());
        context_parts.push(research.answer.clone());
        if !research.citations.is_empty() {
            context_parts.push("\nSources:".to_string());
            for url in &research.citations {
                context_parts.push(format!("- {}", url));
            }
        }
    }

    if !state.validation_errors.is_empty() {
        context_parts.push("\n## Previous Validation Errors (FIX THESE)".to_string());
        for error in &state.validation_errors {
            context_parts.push(format!("- {}", error));
        }
        context_parts.push("\nYou MUST fix all the above errors in your revised output.".to_string());
    }

    let context_block = if context_parts.is_empty() {
        "(No additional context available)".to_string()
    } else {
        context_parts.join("\n")
    };

    format!(
        "## Request\n{}\n\n## Available Context\n{}\n\n## Instructions\n\
         Generate a complete, production-ready deliverable. If the request involves code, \
         include the full script — no placeholders, no \"TODO\" comments, no truncation.",
        state.query, context_block
    )
}
