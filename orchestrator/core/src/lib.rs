// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! OpsForge core
//!
//! Orchestration loop, validation runtime and trace envelope for the
//! OpsForge deliverable engine.
//!
//! # Architecture
//!
//! - **domain**: run state machine, collaborator contracts, trace model
//! - **application**: orchestration loop, review gate, distillation
//! - **infrastructure**: provider adapters (LLM, vector memory, research,
//!   Docker sandbox, trace persistence)

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
