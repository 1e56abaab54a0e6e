// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Live Research Domain Interface
//
// Contract for the external web-research tool (query in, synthesized answer
// plus citations out). Best-effort: failures degrade to "no context".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub answer: String,
    pub citations: Vec<String>,
}

impl ResearchFindings {
    pub fn is_empty(&self) -> bool {
        self.answer.is_empty()
    }
}

#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<ResearchFindings>;
}
