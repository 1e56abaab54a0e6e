// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// `opsforge run` - wire the collaborators from config and run one request.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use opsforge_core::application::Orchestrator;
use opsforge_core::domain::config::OrchestratorConfig;
use opsforge_core::domain::memory::MemoryStore;
use opsforge_core::domain::research::ResearchProvider;
use opsforge_core::domain::run::RunRequest;
use opsforge_core::infrastructure::llm::ProviderRegistry;
use opsforge_core::infrastructure::memory::{HttpVectorStore, NullMemoryStore};
use opsforge_core::infrastructure::research::{NullResearchProvider, SonarResearchClient};
use opsforge_core::infrastructure::sandbox::build_validator;
use opsforge_core::infrastructure::trace_store::{build_exporter, JsonlTraceSink};

/// Cap on deliverable text echoed to the terminal.
const PREVIEW_LIMIT: usize = 2000;

#[derive(Args)]
pub struct RunArgs {
    /// The request to fulfill
    pub query: Vec<String>,

    /// Override the draft↔review retry budget (hard ceiling 5)
    #[arg(long)]
    pub max_iterations: Option<u32>,
}

pub async fn handle_command(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    if args.query.is_empty() {
        anyhow::bail!("No request given. Usage: opsforge run \"<request>\"");
    }
    let query = args.query.join(" ");

    let config = load_config(config_path)?;
    let orchestrator = build_orchestrator(&config)?;

    let mut request = RunRequest::new(query);
    request.max_iterations = args.max_iterations;

    let report = orchestrator.run(request).await.context("run failed")?;

    println!("{}", "── Run result ──────────────────────────────".bold());
    println!("Route:      {}", report.route.as_str().cyan());
    println!("Iterations: {}", report.iterations);
    println!(
        "Score:      {}",
        report.score.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
    );
    if report.degraded {
        println!("{}", "Degraded:   retry budget exhausted, delivering best draft".yellow());
    }
    if !report.context_sources.is_empty() {
        println!("Context:    {}", report.context_sources.join(", "));
    }
    println!("Timings:    {}", serde_json::to_string(&report.timings)?);

    let total_chars = report.deliverable.chars().count();
    println!("\n{} ({} chars)", "── Deliverable ─────────────────────────────".bold(), total_chars);
    let preview: String = report.deliverable.chars().take(PREVIEW_LIMIT).collect();
    println!("{}", preview);
    if total_chars > PREVIEW_LIMIT {
        println!("{}", format!("… [{} more chars]", total_chars - PREVIEW_LIMIT).dimmed());
    }

    Ok(())
}

pub fn load_config(config_path: Option<PathBuf>) -> Result<OrchestratorConfig> {
    match config_path {
        Some(path) => OrchestratorConfig::from_file(&path),
        None => {
            let default = PathBuf::from("opsforge.yaml");
            if default.exists() {
                OrchestratorConfig::from_file(&default)
            } else {
                Ok(OrchestratorConfig::default())
            }
        }
    }
}

fn build_orchestrator(config: &OrchestratorConfig) -> Result<Orchestrator> {
    let registry =
        ProviderRegistry::from_config(config).context("failed to build provider registry")?;

    let memory: Arc<dyn MemoryStore> = if config.memory.enabled {
        Arc::new(HttpVectorStore::from_config(&config.memory)?)
    } else {
        Arc::new(NullMemoryStore)
    };

    let research: Arc<dyn ResearchProvider> = if config.research.enabled {
        Arc::new(SonarResearchClient::from_config(&config.research)?)
    } else {
        Arc::new(NullResearchProvider)
    };

    Ok(Orchestrator::new(
        Arc::new(registry),
        memory,
        research,
        build_validator(&config.sandbox),
        Arc::new(JsonlTraceSink::new(config.trace.dir.clone())),
        build_exporter(&config.trace),
        config.run.clone(),
    ))
}
