// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// `opsforge config` - inspect and validate node configuration.

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use opsforge_core::domain::config::resolve_secret;
use opsforge_core::infrastructure::llm::ProviderRegistry;

use super::run::load_config;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,

    /// Check provider wiring and secret resolution
    Validate,
}

pub async fn handle_command(command: ConfigCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    match command {
        ConfigCommand::Show => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        ConfigCommand::Validate => {
            let mut problems = 0;

            for provider in &config.llm_providers {
                if !provider.enabled {
                    continue;
                }
                match resolve_secret(&provider.api_key) {
                    Ok(_) => println!("{} provider '{}'", "ok".green(), provider.name),
                    Err(e) => {
                        problems += 1;
                        println!("{} provider '{}': {}", "!!".red(), provider.name, e);
                    }
                }
            }

            let registry = ProviderRegistry::from_config(&config)?;
            for tier in ["triage", "engineer", "critic", "reasoner"] {
                let alias = match tier {
                    "triage" => &config.tiers.triage,
                    "engineer" => &config.tiers.engineer,
                    "critic" => &config.tiers.critic,
                    _ => &config.tiers.reasoner,
                };
                if registry.has_alias(alias) {
                    println!("{} tier {} -> {}", "ok".green(), tier, alias);
                } else {
                    problems += 1;
                    println!("{} tier {} -> {} (alias not provided)", "!!".red(), tier, alias);
                }
            }

            if problems == 0 {
                println!("{}", "Configuration is usable.".green().bold());
                Ok(())
            } else {
                anyhow::bail!("{} configuration problem(s) found", problems)
            }
        }
    }
}
