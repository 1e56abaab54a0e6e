// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Sandbox Validation Contract
//
// Executes candidate code in an isolated, disposable environment and reports
// an objective pass/fail verdict. The review gate treats a validator that
// reports as authoritative over the semantic review.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Language targets the validator knows how to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Terraform,
    PowerShell,
}

impl ScriptKind {
    /// Tag prepended to validator errors merged into a review verdict.
    pub fn tag(&self) -> &'static str {
        match self {
            ScriptKind::Terraform => "terraform",
            ScriptKind::PowerShell => "powershell",
        }
    }

    /// Canonical file name the source is written under in the sandbox.
    pub fn file_name(&self) -> &'static str {
        match self {
            ScriptKind::Terraform => "main.tf",
            ScriptKind::PowerShell => "script.ps1",
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Distinguishes a verified verdict from a heuristically-checked one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// The canonical toolchain ran in an isolated environment.
    Isolated,
    /// Only the local delimiter/pattern heuristic ran.
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxReport {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Whether the source passes the formatter check (terraform only).
    pub formatted: Option<bool>,
    pub raw_output: String,
    pub mode: ValidationMode,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The isolated environment could not be provisioned at all.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// The environment came up but a check could not be executed.
    #[error("sandbox execution failed: {0}")]
    Execution(String),

    #[error("sandbox check timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait SandboxValidator: Send + Sync {
    async fn validate(&self, source: &str, kind: ScriptKind) -> Result<SandboxReport, SandboxError>;
}

fn terraform_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:hcl|terraform)\s*\n(.*?)```").unwrap())
}

fn powershell_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:powershell|ps1)\s*\n(.*?)```").unwrap())
}

/// Which validators a draft warrants, by recognizable code markers.
pub fn detect_script_kinds(draft: &str) -> Vec<ScriptKind> {
    let mut kinds = Vec::new();
    if draft.contains("resource ") || draft.contains("```hcl") || draft.contains("```terraform") {
        kinds.push(ScriptKind::Terraform);
    }
    if draft.contains("```powershell") || draft.contains("```ps1") {
        kinds.push(ScriptKind::PowerShell);
    }
    kinds
}

/// Extract the code to validate for a given language target.
///
/// Terraform joins all fenced blocks, falling back to the whole draft when
/// bare `resource` blocks appear outside fences. PowerShell takes the first
/// fenced script only.
pub fn extract_blocks(draft: &str, kind: ScriptKind) -> Option<String> {
    match kind {
        ScriptKind::Terraform => {
            let blocks: Vec<&str> = terraform_fence()
                .captures_iter(draft)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();
            if !blocks.is_empty() {
                Some(blocks.join("\n\n"))
            } else if draft.contains("resource ") {
                Some(draft.to_string())
            } else {
                None
            }
        }
        ScriptKind::PowerShell => powershell_fence()
            .captures(draft)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_terraform_from_fence_and_bare_resource() {
        assert_eq!(detect_script_kinds("```terraform\nx\n```"), vec![ScriptKind::Terraform]);
        assert_eq!(
            detect_script_kinds("resource \"azurerm_resource_group\" \"rg\" {}"),
            vec![ScriptKind::Terraform]
        );
        assert!(detect_script_kinds("just prose").is_empty());
    }

    #[test]
    fn detects_both_kinds_in_mixed_draft() {
        let draft = "```hcl\nresource \"a\" \"b\" {}\n```\n\n```powershell\nGet-Date\n```";
        assert_eq!(detect_script_kinds(draft), vec![ScriptKind::Terraform, ScriptKind::PowerShell]);
    }

    #[test]
    fn terraform_extraction_joins_all_fences() {
        let draft = "intro\n```hcl\nblock one\n```\nmiddle\n```terraform\nblock two\n```";
        let code = extract_blocks(draft, ScriptKind::Terraform).unwrap();
        assert_eq!(code, "block one\n\n\nblock two\n");
    }

    #[test]
    fn terraform_extraction_falls_back_to_whole_draft() {
        let draft = "resource \"azurerm_storage_account\" \"sa\" {\n  name = \"x\"\n}";
        let code = extract_blocks(draft, ScriptKind::Terraform).unwrap();
        assert_eq!(code, draft);
    }

    #[test]
    fn powershell_extraction_takes_first_fence_only() {
        let draft = "```ps1\nGet-ADUser\n```\n```powershell\nGet-Date\n```";
        let code = extract_blocks(draft, ScriptKind::PowerShell).unwrap();
        assert_eq!(code, "Get-ADUser\n");
    }

    #[test]
    fn no_extraction_without_recognizable_code() {
        assert!(extract_blocks("plain runbook text", ScriptKind::Terraform).is_none());
        assert!(extract_blocks("plain runbook text", ScriptKind::PowerShell).is_none());
    }
}
