// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Sandbox Validation Runtime
//
// Runs candidate code through the canonical toolchain check for its language
// inside a disposable Docker container, tearing the container down
// unconditionally. When Docker cannot be provisioned the composed fallback
// degrades to a local heuristic check, annotated so callers can distinguish
// "verified" from "heuristically checked".

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::config::{SandboxConfig, SandboxIsolation};
use crate::domain::validation::{
    SandboxError, SandboxReport, SandboxValidator, ScriptKind, ValidationMode,
};

/// Provider scaffold written alongside terraform sources that declare no
/// required_providers, so `terraform init` has a provider to resolve.
const PROVIDER_SCAFFOLD: &str = r#"
terraform {
  required_providers {
    azurerm = {
      source  = "hashicorp/azurerm"
      version = "~> 4.0"
    }
  }
}
provider "azurerm" {
  features {}
}
"#;

const WORKDIR: &str = "/workspace";

struct ExecOutput {
    exit_code: i64,
    stdout: String,
    stderr: String,
}

pub struct DockerSandbox {
    docker: Docker,
    terraform_image: String,
    powershell_image: String,
    timeout: Duration,
}

impl DockerSandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let docker = if let Some(path) = &config.docker_socket {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                SandboxError::Unavailable(format!("Failed to connect to Docker at {}: {}", path, e))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                SandboxError::Unavailable(format!("Failed to connect to Docker: {}", e))
            })?
        };

        Ok(Self {
            docker,
            terraform_image: config.terraform_image.clone(),
            powershell_image: config.powershell_image.clone(),
            timeout: config.timeout,
        })
    }

    /// Verify the Docker daemon is reachable.
    pub async fn healthcheck(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Docker daemon unreachable: {}", e)))?;
        Ok(())
    }

    fn image_for(&self, kind: ScriptKind) -> &str {
        match kind {
            ScriptKind::Terraform => &self.terraform_image,
            ScriptKind::PowerShell => &self.powershell_image,
        }
    }

    async fn provision(&self, kind: ScriptKind) -> Result<String, SandboxError> {
        let image = self.image_for(kind).to_string();

        if self.docker.inspect_image(&image).await.is_err() {
            info!("Pulling sandbox image: {}", image);
            let options =
                Some(CreateImageOptions { from_image: image.clone(), ..Default::default() });
            let mut stream = self.docker.create_image(options, None, None);
            while let Some(result) = stream.next().await {
                if let Err(e) = result {
                    return Err(SandboxError::Unavailable(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }

        let name = format!("opsforge-validate-{}", Uuid::new_v4());
        let options = CreateContainerOptions { name: name.clone(), platform: None };
        let container_config = Config {
            image: Some(image),
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec!["300".to_string()]),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Failed to create container: {}", e)))?;

        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Failed to start container: {}", e)))?;

        Ok(name)
    }

    async fn teardown(&self, container: &str) {
        let options = RemoveContainerOptions { force: true, ..Default::default() };
        if let Err(e) = self.docker.remove_container(container, Some(options)).await {
            warn!("Failed to remove sandbox container {}: {}", container, e);
        }
    }

    async fn upload_sources(
        &self,
        container: &str,
        files: &[(&str, &str)],
    ) -> Result<(), SandboxError> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .map_err(|e| SandboxError::Execution(format!("tar build failed: {}", e)))?;
        }
        let archive = builder
            .into_inner()
            .map_err(|e| SandboxError::Execution(format!("tar build failed: {}", e)))?;

        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions { path: WORKDIR.to_string(), ..Default::default() }),
                archive.into(),
            )
            .await
            .map_err(|e| SandboxError::Execution(format!("Failed to upload sources: {}", e)))
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<ExecOutput, SandboxError> {
        let run = async {
            let exec = self
                .docker
                .create_exec(
                    container,
                    CreateExecOptions {
                        cmd: Some(cmd),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        working_dir: Some(WORKDIR.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| SandboxError::Execution(e.to_string()))?;

            let start_opts = StartExecOptions { detach: false, ..Default::default() };
            let res = self
                .docker
                .start_exec(&exec.id, Some(start_opts))
                .await
                .map_err(|e| SandboxError::Execution(e.to_string()))?;

            let mut stdout_logs = Vec::new();
            let mut stderr_logs = Vec::new();

            if let StartExecResults::Attached { mut output, .. } = res {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout_logs.push(String::from_utf8_lossy(&message).to_string());
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr_logs.push(String::from_utf8_lossy(&message).to_string());
                        }
                        _ => {}
                    }
                }
            }

            let exec_inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| SandboxError::Execution(format!("Failed to inspect exec: {}", e)))?;

            Ok(ExecOutput {
                exit_code: exec_inspect.exit_code.unwrap_or(0),
                stdout: stdout_logs.join(""),
                stderr: stderr_logs.join(""),
            })
        };

        tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| SandboxError::Timeout(self.timeout))?
    }

    async fn check_terraform(&self, container: &str, source: &str) -> Result<SandboxReport, SandboxError> {
        let mut files = vec![(ScriptKind::Terraform.file_name(), source)];
        if !source.contains("required_providers") {
            files.push(("providers.tf", PROVIDER_SCAFFOLD));
        }
        self.upload_sources(container, &files).await?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let init = self
            .exec(container, str_cmd(&["terraform", "init", "-backend=false", "-no-color"]))
            .await?;
        if init.exit_code != 0 {
            errors.push(format!(
                "terraform init failed:\n{}",
                if init.stderr.is_empty() { &init.stdout } else { &init.stderr }
            ));
            return Ok(SandboxReport {
                passed: false,
                errors,
                warnings,
                formatted: Some(false),
                raw_output: init.stdout,
                mode: ValidationMode::Isolated,
            });
        }

        let validate = self
            .exec(container, str_cmd(&["terraform", "validate", "-json", "-no-color"]))
            .await?;
        match serde_json::from_str::<serde_json::Value>(&validate.stdout) {
            Ok(verdict) => {
                if !verdict["valid"].as_bool().unwrap_or(false) {
                    for diag in verdict["diagnostics"].as_array().into_iter().flatten() {
                        let summary = diag["summary"].as_str().unwrap_or("Unknown error");
                        let detail = diag["detail"].as_str().unwrap_or("");
                        let msg = if detail.is_empty() {
                            summary.to_string()
                        } else {
                            format!("{}: {}", summary, detail)
                        };
                        if diag["severity"].as_str() == Some("warning") {
                            warnings.push(msg);
                        } else {
                            errors.push(msg);
                        }
                    }
                }
            }
            Err(_) => {
                if validate.exit_code != 0 {
                    errors.push(if validate.stderr.is_empty() {
                        validate.stdout.clone()
                    } else {
                        validate.stderr.clone()
                    });
                }
            }
        }

        let fmt = self
            .exec(container, str_cmd(&["terraform", "fmt", "-check", "-no-color"]))
            .await?;
        let formatted = fmt.exit_code == 0;
        if !formatted {
            warnings.push("terraform fmt found formatting differences".to_string());
        }

        let passed = errors.is_empty();
        info!(
            "Terraform sandbox validation {}: {} errors, {} warnings, fmt={}",
            if passed { "PASSED" } else { "FAILED" },
            errors.len(),
            warnings.len(),
            formatted
        );

        Ok(SandboxReport {
            passed,
            errors,
            warnings,
            formatted: Some(formatted),
            raw_output: validate.stdout,
            mode: ValidationMode::Isolated,
        })
    }

    async fn check_powershell(&self, container: &str, source: &str) -> Result<SandboxReport, SandboxError> {
        self.upload_sources(container, &[(ScriptKind::PowerShell.file_name(), source)]).await?;

        self.exec(
            container,
            str_cmd(&[
                "pwsh",
                "-Command",
                "if (-not (Get-Module -ListAvailable PSScriptAnalyzer)) { Install-Module PSScriptAnalyzer -Force -Scope CurrentUser }",
            ]),
        )
        .await?;

        let analyze = self
            .exec(
                container,
                str_cmd(&[
                    "pwsh",
                    "-Command",
                    &format!(
                        "Invoke-ScriptAnalyzer -Path {}/{} -Severity Error,Warning | ConvertTo-Json -Depth 3",
                        WORKDIR,
                        ScriptKind::PowerShell.file_name()
                    ),
                ]),
            )
            .await?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let trimmed = analyze.stdout.trim();
        if !trimmed.is_empty() && trimmed != "null" && trimmed != "[]" {
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(parsed) => {
                    let findings = match parsed {
                        serde_json::Value::Array(items) => items,
                        single => vec![single],
                    };
                    for finding in findings {
                        let msg = format!(
                            "{}: {} (line {})",
                            finding["RuleName"].as_str().unwrap_or("Unknown"),
                            finding["Message"].as_str().unwrap_or(""),
                            finding["Line"].as_i64().unwrap_or(0)
                        );
                        let severity = finding["Severity"]
                            .as_str()
                            .map(str::to_lowercase)
                            .unwrap_or_default();
                        if severity == "error" {
                            errors.push(msg);
                        } else {
                            warnings.push(msg);
                        }
                    }
                }
                Err(_) => {
                    if analyze.exit_code != 0 {
                        errors.push(analyze.stdout.clone());
                    }
                }
            }
        }

        let passed = errors.is_empty();
        info!(
            "PowerShell sandbox validation {}: {} errors, {} warnings",
            if passed { "PASSED" } else { "FAILED" },
            errors.len(),
            warnings.len()
        );

        Ok(SandboxReport {
            passed,
            errors,
            warnings,
            formatted: None,
            raw_output: analyze.stdout,
            mode: ValidationMode::Isolated,
        })
    }
}

fn str_cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl SandboxValidator for DockerSandbox {
    async fn validate(&self, source: &str, kind: ScriptKind) -> Result<SandboxReport, SandboxError> {
        debug!("Sandbox-validating {} bytes of {}", source.len(), kind);

        let container = self.provision(kind).await?;

        let result = match kind {
            ScriptKind::Terraform => self.check_terraform(&container, source).await,
            ScriptKind::PowerShell => self.check_powershell(&container, source).await,
        };

        // Teardown runs regardless of check outcome.
        self.teardown(&container).await;

        result
    }
}

/// Local syntax heuristic for when the isolated environment is unavailable.
pub struct HeuristicValidator;

const HEURISTIC_NOTICE: &str =
    "heuristic check only — isolated sandbox validation was unavailable";

impl HeuristicValidator {
    fn check(&self, source: &str, kind: ScriptKind) -> SandboxReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let braces =
            source.matches('{').count() as i64 - source.matches('}').count() as i64;
        if braces != 0 {
            errors.push(format!("Mismatched braces: {:+}", braces));
        }

        match kind {
            ScriptKind::Terraform => {
                if source.matches('"').count() % 2 != 0 {
                    errors.push("Unclosed string literal (odd number of quotes)".to_string());
                }
                if source.contains("resource") && !source.contains('=') {
                    warnings.push("Resource block appears to have no attributes".to_string());
                }
            }
            ScriptKind::PowerShell => {
                let parens =
                    source.matches('(').count() as i64 - source.matches(')').count() as i64;
                if parens != 0 {
                    errors.push(format!("Mismatched parentheses: {:+}", parens));
                }
            }
        }

        warnings.push(HEURISTIC_NOTICE.to_string());

        SandboxReport {
            passed: errors.is_empty(),
            errors,
            warnings,
            formatted: None,
            raw_output: String::new(),
            mode: ValidationMode::Heuristic,
        }
    }
}

#[async_trait]
impl SandboxValidator for HeuristicValidator {
    async fn validate(&self, source: &str, kind: ScriptKind) -> Result<SandboxReport, SandboxError> {
        Ok(self.check(source, kind))
    }
}

/// Composes the isolated backend with the heuristic fallback: provisioning
/// failures degrade, execution failures propagate to the caller's skip path.
pub struct FallbackValidator {
    primary: Arc<dyn SandboxValidator>,
    fallback: HeuristicValidator,
}

impl FallbackValidator {
    pub fn new(primary: Arc<dyn SandboxValidator>) -> Self {
        Self { primary, fallback: HeuristicValidator }
    }
}

#[async_trait]
impl SandboxValidator for FallbackValidator {
    async fn validate(&self, source: &str, kind: ScriptKind) -> Result<SandboxReport, SandboxError> {
        match self.primary.validate(source, kind).await {
            Ok(report) => Ok(report),
            Err(SandboxError::Unavailable(reason)) => {
                warn!("Sandbox unavailable ({}), falling back to heuristic check", reason);
                counter!("opsforge_sandbox_fallbacks").increment(1);
                self.fallback.validate(source, kind).await
            }
            Err(other) => Err(other),
        }
    }
}

/// Select the validation backend once at startup from configuration.
pub fn build_validator(config: &SandboxConfig) -> Arc<dyn SandboxValidator> {
    match config.isolation {
        SandboxIsolation::Docker => match DockerSandbox::new(config) {
            Ok(sandbox) => Arc::new(FallbackValidator::new(Arc::new(sandbox))),
            Err(e) => {
                warn!("Docker sandbox unavailable at startup ({}), using heuristic checks", e);
                Arc::new(HeuristicValidator)
            }
        },
        SandboxIsolation::Heuristic => Arc::new(HeuristicValidator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heuristic_flags_unbalanced_terraform() {
        let report = HeuristicValidator
            .validate("resource \"a\" \"b\" {\n  name = \"x\"\n", ScriptKind::Terraform)
            .await
            .unwrap();

        assert!(!report.passed);
        assert_eq!(report.mode, ValidationMode::Heuristic);
        assert!(report.errors[0].contains("Mismatched braces"));
        assert!(report.warnings.iter().any(|w| w.contains("heuristic check only")));
    }

    #[tokio::test]
    async fn heuristic_passes_balanced_powershell() {
        let report = HeuristicValidator
            .validate("Get-ADUser -Filter * | Export-Csv out.csv", ScriptKind::PowerShell)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.mode, ValidationMode::Heuristic);
        assert!(report.warnings.iter().any(|w| w.contains("heuristic check only")));
    }

    struct BrokenSandbox;

    #[async_trait]
    impl SandboxValidator for BrokenSandbox {
        async fn validate(&self, _: &str, _: ScriptKind) -> Result<SandboxReport, SandboxError> {
            Err(SandboxError::Unavailable("no docker socket".into()))
        }
    }

    #[tokio::test]
    async fn fallback_degrades_to_heuristic_on_unavailable() {
        let validator = FallbackValidator::new(Arc::new(BrokenSandbox));
        let report = validator
            .validate("resource \"a\" \"b\" { name = \"x\" }", ScriptKind::Terraform)
            .await
            .unwrap();

        assert!(report.passed);
        assert_eq!(report.mode, ValidationMode::Heuristic);
    }

    struct FlakySandbox;

    #[async_trait]
    impl SandboxValidator for FlakySandbox {
        async fn validate(&self, _: &str, _: ScriptKind) -> Result<SandboxReport, SandboxError> {
            Err(SandboxError::Execution("exec died".into()))
        }
    }

    #[tokio::test]
    async fn fallback_propagates_execution_failures() {
        let validator = FallbackValidator::new(Arc::new(FlakySandbox));
        let err = validator.validate("x", ScriptKind::PowerShell).await.unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }
}
