// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Trace Envelope
//
// One Trace per run, one TraceEvent per stage or backend call. Events append
// in execution order and roll token/cost counters up into the trace totals.
// A trace is flushed to durable storage exactly once when its run scope
// exits and is never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A pipeline stage span.
    Stage,
    /// A generation backend call.
    Generation,
    /// An external tool call (memory, research, sandbox).
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Error,
}

/// A single traced event within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: EventKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub tokens_total: u32,
    pub cost_usd: f64,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
}

impl TraceEvent {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0.0,
            model: None,
            tokens_prompt: 0,
            tokens_completion: 0,
            tokens_total: 0,
            cost_usd: 0.0,
            status: EventStatus::Ok,
            error: None,
            output: serde_json::Value::Null,
        }
    }
}

/// A full orchestrator run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            trace_id: format!("trace-{}", Uuid::new_v4()),
            query: query.into(),
            route: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0.0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            final_score: None,
            status: EventStatus::Ok,
            error: None,
            events: Vec::new(),
        }
    }

    /// Append an event and roll its counters into the trace totals.
    pub fn push_event(&mut self, event: TraceEvent) {
        self.total_tokens += u64::from(event.tokens_total);
        self.total_cost_usd += event.cost_usd;
        self.events.push(event);
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_into_trace_totals() {
        let mut trace = Trace::new("q");

        let mut a = TraceEvent::new(EventKind::Generation, "draft_1");
        a.tokens_total = 1200;
        a.cost_usd = 0.018;
        trace.push_event(a);

        let mut b = TraceEvent::new(EventKind::Generation, "review_1");
        b.tokens_total = 600;
        b.cost_usd = 0.009;
        trace.push_event(b);

        assert_eq!(trace.total_tokens, 1800);
        assert!((trace.total_cost_usd - 0.027).abs() < 1e-9);
        assert_eq!(trace.events.len(), 2);
    }

    #[test]
    fn events_serialize_in_insertion_order() {
        let mut trace = Trace::new("q");
        for name in ["triage", "draft_1", "review_1"] {
            trace.push_event(TraceEvent::new(EventKind::Stage, name));
        }

        let json = serde_json::to_value(&trace).unwrap();
        let names: Vec<&str> = json["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["triage", "draft_1", "review_1"]);
    }
}
