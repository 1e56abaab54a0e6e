// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Run state machine, collaborator contracts and the trace model.
//! Everything here is vendor-neutral; adapters live in infrastructure/.

pub mod config;
pub mod llm;
pub mod memory;
pub mod research;
pub mod run;
pub mod trace;
pub mod validation;

pub use llm::{
    ChatMessage, GenerationBackend, GenerationOptions, GenerationResponse, LLMError, LLMProvider,
    ModelTier, Role, TokenUsage,
};
pub use memory::{MemoryHit, MemoryQuery, MemoryStore};
pub use research::{ResearchFindings, ResearchProvider};
pub use run::{
    DecodePath, RetrievedContext, ReviewVerdict, Route, RunError, RunReport, RunRequest, RunState,
    Stage,
};
pub use trace::{EventKind, EventStatus, Trace, TraceEvent};
pub use validation::{SandboxError, SandboxReport, SandboxValidator, ScriptKind, ValidationMode};
