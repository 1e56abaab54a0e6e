// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Trace Persistence and Export
//
// The recorder accumulates events for one run and flushes the finished
// trace exactly once. The local JSONL sink always runs; the remote exporter
// is a startup-selected capability with a no-op fallback, so observability
// data is never lost to a missing backend.
//
// The sink is synchronous on purpose: a run future dropped mid-loop still
// flushes its trace (marked errored) from the recorder's Drop.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::domain::config::{resolve_secret, TraceConfig};
use crate::domain::llm::GenerationResponse;
use crate::domain::run::Route;
use crate::domain::trace::{EventKind, EventStatus, Trace, TraceEvent};

/// Durable local destination for finished traces.
pub trait TraceSink: Send + Sync {
    fn record(&self, trace: &Trace);
}

/// Appends one JSON line per trace to a daily-partitioned file.
pub struct JsonlTraceSink {
    dir: PathBuf,
}

impl JsonlTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, trace: &Trace) {
        let line = match serde_json::to_string(trace) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize trace {}: {}", trace.trace_id, e);
                return;
            }
        };

        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let file_name = format!("traces-{}.jsonl", Utc::now().format("%Y-%m-%d"));
            let mut file =
                OpenOptions::new().create(true).append(true).open(self.dir.join(file_name))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")
        };

        match write() {
            Ok(()) => debug!("Saved trace {} to {}", trace.trace_id, self.dir.display()),
            Err(e) => warn!("Failed to save trace {}: {}", trace.trace_id, e),
        }
    }
}

/// Read local trace files from the last N days, oldest file first.
pub fn read_traces(dir: &Path, days_back: i64) -> anyhow::Result<Vec<Trace>> {
    let mut traces = Vec::new();
    if !dir.exists() {
        return Ok(traces);
    }

    let cutoff = Utc::now() - ChronoDuration::days(days_back);
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("traces-") && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    for file in files {
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", file.display(), e);
                continue;
            }
        };
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Trace>(line) {
                Ok(trace) if trace.started_at >= cutoff => traces.push(trace),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed trace line in {}: {}", file.display(), e),
            }
        }
    }

    Ok(traces)
}

/// Optional remote telemetry backend, selected once at startup.
#[async_trait]
pub trait TraceExporter: Send + Sync {
    async fn export(&self, trace: &Trace) -> anyhow::Result<()>;
}

pub struct NoopTraceExporter;

#[async_trait]
impl TraceExporter for NoopTraceExporter {
    async fn export(&self, _trace: &Trace) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Posts finished traces to an external observability backend.
pub struct HttpTraceExporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTraceExporter {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, api_key }
    }
}

#[async_trait]
impl TraceExporter for HttpTraceExporter {
    async fn export(&self, trace: &Trace) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/api/traces", self.endpoint.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(trace)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Select the export backend from configuration.
pub fn build_exporter(config: &TraceConfig) -> Arc<dyn TraceExporter> {
    match &config.export_endpoint {
        Some(endpoint) => {
            let api_key = match resolve_secret(&config.export_api_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Trace export key unavailable ({}), exporting without auth", e);
                    String::new()
                }
            };
            Arc::new(HttpTraceExporter::new(endpoint.clone(), api_key))
        }
        None => Arc::new(NoopTraceExporter),
    }
}

/// Handle to an in-flight event; returned by `begin`, consumed by the
/// matching `end`/`fail`.
pub struct EventHandle {
    index: usize,
    started: Instant,
}

/// Accumulates one run's trace and guarantees the flush-exactly-once
/// contract, including when the run future is dropped mid-flight.
pub struct TraceRecorder {
    trace: Trace,
    sink: Arc<dyn TraceSink>,
    started: Instant,
    finished: bool,
}

impl TraceRecorder {
    pub fn new(query: &str, sink: Arc<dyn TraceSink>) -> Self {
        Self { trace: Trace::new(query), sink, started: Instant::now(), finished: false }
    }

    pub fn begin(&mut self, kind: EventKind, name: impl Into<String>) -> EventHandle {
        let event = TraceEvent::new(kind, name);
        self.trace.events.push(event);
        EventHandle { index: self.trace.events.len() - 1, started: Instant::now() }
    }

    fn seal_event(&mut self, handle: &EventHandle) -> &mut TraceEvent {
        let event = &mut self.trace.events[handle.index];
        event.ended_at = Some(Utc::now());
        event.duration_ms = (handle.started.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0;
        event
    }

    pub fn end(&mut self, handle: EventHandle, output: Value) {
        let event = self.seal_event(&handle);
        event.output = output;
    }

    /// End a generation event, attaching model/usage/cost and rolling the
    /// counters into the trace totals.
    pub fn end_generation(&mut self, handle: EventHandle, output: Value, response: &GenerationResponse) {
        let event = self.seal_event(&handle);
        event.output = output;
        event.model = Some(response.model.clone());
        event.tokens_prompt = response.usage.prompt_tokens;
        event.tokens_completion = response.usage.completion_tokens;
        event.tokens_total = response.usage.total_tokens;
        event.cost_usd = response.cost_usd;
        self.trace.total_tokens += u64::from(response.usage.total_tokens);
        self.trace.total_cost_usd += response.cost_usd;
    }

    pub fn fail(&mut self, handle: EventHandle, error: impl Into<String>) {
        let event = self.seal_event(&handle);
        event.status = EventStatus::Error;
        event.error = Some(error.into());
    }

    pub fn set_route(&mut self, route: Option<Route>) {
        self.trace.route = route;
    }

    /// Record the terminal quality score for this run.
    pub fn score(&mut self, value: f64) {
        self.trace.final_score = Some(value);
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.trace.status = EventStatus::Error;
        self.trace.error = Some(error.into());
    }

    fn seal(&mut self) {
        self.trace.ended_at = Some(Utc::now());
        self.trace.duration_ms = (self.started.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0;
    }

    /// Seal and flush the trace. Further mutation is impossible; the Drop
    /// fallback becomes a no-op.
    pub fn finish(mut self) -> Trace {
        self.seal();
        self.finished = true;
        let trace = std::mem::take(&mut self.trace);
        self.sink.record(&trace);
        trace
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        if !self.finished {
            self.mark_error("run aborted before completion");
            self.seal();
            self.sink.record(&self.trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SpySink {
        recorded: Mutex<Vec<Trace>>,
    }

    impl TraceSink for SpySink {
        fn record(&self, trace: &Trace) {
            self.recorded.lock().unwrap().push(trace.clone());
        }
    }

    #[test]
    fn finish_flushes_exactly_once() {
        let sink = Arc::new(SpySink::default());
        let mut recorder = TraceRecorder::new("q", sink.clone());
        let handle = recorder.begin(EventKind::Stage, "triage");
        recorder.end(handle, serde_json::json!({"route": "engineer"}));
        recorder.score(8.0);

        let trace = recorder.finish();
        assert_eq!(trace.final_score, Some(8.0));
        assert_eq!(sink.recorded.lock().unwrap().len(), 1);
        assert_eq!(sink.recorded.lock().unwrap()[0].status, EventStatus::Ok);
    }

    #[test]
    fn dropped_recorder_flushes_errored_trace() {
        let sink = Arc::new(SpySink::default());
        {
            let mut recorder = TraceRecorder::new("q", sink.clone());
            let _ = recorder.begin(EventKind::Stage, "draft_1");
            // Dropped without finish: simulates a cancelled run.
        }

        let recorded = sink.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, EventStatus::Error);
        assert!(recorded[0].error.as_deref().unwrap().contains("aborted"));
    }

    #[test]
    fn jsonl_sink_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlTraceSink::new(dir.path());

        let mut trace = Trace::new("terraform module request");
        trace.total_tokens = 1234;
        sink.record(&trace);
        sink.record(&Trace::new("second run"));

        let traces = read_traces(dir.path(), 7).unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].query, "terraform module request");
        assert_eq!(traces[0].total_tokens, 1234);
    }
}
