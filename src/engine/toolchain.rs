//! Toolchain Integration
//!
//! Compiler and test-runner seams for the pipeline. Production
//! implementations shell out to the configured commands with a hard
//! wall-clock timeout; a timed-out invocation counts as a failure, not
//! an error.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::types::{ReportStatus, TestResult, TestStatus, TestingReport};

/// Result of a whole-project compile/type check.
#[derive(Clone, Debug)]
pub struct CompileOutcome {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait Compiler: Send + Sync {
    async fn check(&self, workspace: &Path) -> Result<CompileOutcome>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the test subset selected by `filters` (all tests when empty).
    async fn run(&self, workspace: &Path, filters: &[String]) -> Result<TestingReport>;
}

// ─── Subprocess implementations ──────────────────────────────────

pub struct SubprocessCompiler {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessCompiler {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            command: config.compile_command.clone(),
            args: config.compile_args.clone(),
            timeout: Duration::from_secs(config.subprocess_timeout_secs),
        }
    }
}

#[async_trait]
impl Compiler for SubprocessCompiler {
    async fn check(&self, workspace: &Path) -> Result<CompileOutcome> {
        debug!("compile check: {} {:?}", self.command, self.args);
        match run_with_timeout(&self.command, &self.args, workspace, self.timeout).await? {
            Some((success, output)) => Ok(CompileOutcome { success, output }),
            None => {
                warn!("compile check timed out after {:?}", self.timeout);
                Ok(CompileOutcome {
                    success: false,
                    output: format!("compile check timed out after {:?}", self.timeout),
                })
            }
        }
    }
}

pub struct SubprocessTestRunner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessTestRunner {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            command: config.test_command.clone(),
            args: config.test_args.clone(),
            timeout: Duration::from_secs(config.subprocess_timeout_secs),
        }
    }
}

#[async_trait]
impl TestRunner for SubprocessTestRunner {
    async fn run(&self, workspace: &Path, filters: &[String]) -> Result<TestingReport> {
        let mut args = self.args.clone();
        args.extend(filters.iter().cloned());
        debug!("test run: {} {:?}", self.command, args);

        let started = Instant::now();
        let outcome = run_with_timeout(&self.command, &args, workspace, self.timeout).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Some((success, output)) => {
                let mut report = parse_test_output(&output);
                report.duration_ms = duration_ms;
                // Trust the exit code over the parse when they disagree.
                report.status = if success {
                    ReportStatus::Passed
                } else {
                    ReportStatus::Failed
                };
                Ok(report)
            }
            None => {
                warn!("test run timed out after {:?}", self.timeout);
                Ok(TestingReport {
                    status: ReportStatus::Failed,
                    results: vec![TestResult {
                        name: "(suite)".to_string(),
                        status: TestStatus::Failed,
                        duration_ms,
                        message: Some(format!("timed out after {:?}", self.timeout)),
                    }],
                    passed: 0,
                    failed: 1,
                    skipped: 0,
                    duration_ms,
                    coverage: None,
                })
            }
        }
    }
}

/// Spawn the subprocess with a hard timeout. `Ok(None)` means timeout.
async fn run_with_timeout(
    command: &str,
    args: &[String],
    workspace: &Path,
    timeout: Duration,
) -> Result<Option<(bool, String)>> {
    let child = tokio::process::Command::new(command)
        .args(args)
        .current_dir(workspace)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(output) => {
            let output = output.with_context(|| format!("failed to spawn {command}"))?;
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(Some((output.status.success(), text)))
        }
        Err(_) => Ok(None),
    }
}

/// Extract per-test lines and pass/fail counts from libtest-style output.
fn parse_test_output(output: &str) -> TestingReport {
    let line_re = Regex::new(r"(?m)^test (\S+) \.\.\. (ok|FAILED|ignored)$")
        .expect("static regex");
    let summary_re = Regex::new(r"(\d+) passed; (\d+) failed; (\d+) ignored")
        .expect("static regex");

    let mut report = TestingReport::default();
    for caps in line_re.captures_iter(output) {
        let status = match &caps[2] {
            "ok" => TestStatus::Passed,
            "FAILED" => TestStatus::Failed,
            _ => TestStatus::Skipped,
        };
        report.results.push(TestResult {
            name: caps[1].to_string(),
            status,
            duration_ms: 0,
            message: None,
        });
    }
    if let Some(caps) = summary_re.captures(output) {
        report.passed = caps[1].parse().unwrap_or(0);
        report.failed = caps[2].parse().unwrap_or(0);
        report.skipped = caps[3].parse().unwrap_or(0);
    } else {
        report.passed = report
            .results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count() as u32;
        report.failed = report
            .results
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
            .count() as u32;
    }
    report
}
