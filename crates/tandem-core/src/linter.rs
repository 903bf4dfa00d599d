//! Ephemeral linter pool.
//!
//! Every lint spawns a fresh child, pipes the file content on stdin, and
//! collects JSON findings from stdout. A semaphore bounds concurrency;
//! waiters time out on their own clock. Unlike checker workers, a timed-out
//! linter child is killed — they are cheap to respawn.

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use smol_str::SmolStr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::config::LinterConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSource, Severity};
use crate::error::AnalysisError;

/// Upper bound on concurrently running linter processes.
const MAX_PROCESSES: usize = 8;

/// Diagnostics produced by one lint pass.
#[derive(Debug, Clone)]
pub struct LinterAnalysis {
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

struct LinterInner {
    config: RwLock<LinterConfig>,
    semaphore: Arc<Semaphore>,
    shutting_down: AtomicBool,
    stop_signal: Notify,
    running: AtomicUsize,
}

/// The pool handle.
#[derive(Clone)]
pub struct LinterPool {
    inner: Arc<LinterInner>,
}

impl LinterPool {
    pub fn new(config: LinterConfig) -> Self {
        Self {
            inner: Arc::new(LinterInner {
                config: RwLock::new(config),
                semaphore: Arc::new(Semaphore::new(MAX_PROCESSES)),
                shutting_down: AtomicBool::new(false),
                stop_signal: Notify::new(),
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub fn update_config(&self, config: LinterConfig) {
        *self.inner.config.write() = config;
    }

    /// Processes currently running, for the inspector.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Kills running processes and fails queued waiters.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        self.inner.stop_signal.notify_waiters();
    }

    /// Lints one file.
    pub async fn lint(&self, uri: &str, content: &str) -> Result<LinterAnalysis, AnalysisError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(AnalysisError::ShuttingDown);
        }
        let config = self.inner.config.read().clone();
        let queue_wait = Duration::from_millis(config.file_timeout_ms);

        // Queue-wait timeout: waiters past the semaphore bound fail on their
        // own clock. A closed semaphore means shutdown.
        let permit = match timeout(queue_wait, self.inner.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AnalysisError::ShuttingDown),
            Err(_) => {
                return Err(AnalysisError::Timeout {
                    uri: SmolStr::new(uri),
                    after_ms: config.file_timeout_ms,
                })
            }
        };
        let _permit = permit;

        let started = Instant::now();
        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let outcome = self.run_linter(uri, content, &config).await;
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status_code, stdout) = outcome?;
        // Stdout is the source of truth: exit codes above 1 are failures only
        // when the linter wrote nothing at all. Non-empty but unparseable
        // output is tolerated as zero findings.
        if status_code > 1 && String::from_utf8_lossy(&stdout).trim().is_empty() {
            return Err(AnalysisError::AnalyzerFailed(SmolStr::new(format!(
                "linter exited with code {status_code} and empty stdout"
            ))));
        }
        let diagnostics = parse_output(&stdout, uri, duration_ms).unwrap_or_default();
        Ok(LinterAnalysis {
            diagnostics,
            duration_ms,
        })
    }

    async fn run_linter(
        &self,
        uri: &str,
        content: &str,
        config: &LinterConfig,
    ) -> Result<(i32, Vec<u8>), AnalysisError> {
        let binary = config.binary();
        let mut command = Command::new(&binary);
        command.arg("--format=json");
        command.arg(format!("--stdin-filename={}", file_name_of(uri)));
        command.arg("-");
        if let Some(path) = &config.config_path {
            command.arg(format!("--config={}", path.display()));
        }
        for (rule, level) in &config.rules {
            command.arg(level.flag()).arg(rule.as_str());
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| AnalysisError::Spawn {
            binary: SmolStr::new(binary.to_string_lossy().as_ref()),
            message: SmolStr::new(err.to_string()),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(content.as_bytes()).await {
                debug!("Linter stdin write failed early: {err}");
            }
            // Dropping stdin closes the pipe so the linter sees EOF.
        }

        let per_request = Duration::from_millis(config.file_timeout_ms);
        let outcome = {
            let collect = collect_output(&mut child);
            tokio::pin!(collect);
            let stopped = self.inner.stop_signal.notified();
            tokio::pin!(stopped);
            tokio::select! {
                result = timeout(per_request, &mut collect) => match result {
                    Ok(result) => ChildOutcome::Finished(result),
                    Err(_) => ChildOutcome::TimedOut,
                },
                _ = &mut stopped => ChildOutcome::Stopped,
            }
        };

        match outcome {
            ChildOutcome::Finished(result) => result,
            ChildOutcome::TimedOut => {
                // In-flight linter timeouts kill the child.
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(AnalysisError::Timeout {
                    uri: SmolStr::new(uri),
                    after_ms: config.file_timeout_ms,
                })
            }
            ChildOutcome::Stopped => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(AnalysisError::ShuttingDown)
            }
        }
    }
}

enum ChildOutcome {
    Finished(Result<(i32, Vec<u8>), AnalysisError>),
    TimedOut,
    Stopped,
}

async fn collect_output(child: &mut Child) -> Result<(i32, Vec<u8>), AnalysisError> {
    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| AnalysisError::Protocol(SmolStr::new("linter stdout not piped")))?;
    let mut stdout = Vec::new();
    stdout_pipe.read_to_end(&mut stdout).await?;
    let status = child.wait().await?;
    Ok((status.code().unwrap_or(-1), stdout))
}

/// Parses linter stdout.
///
/// Primary shape: a JSON array (or single object) of raw findings. Fallback:
/// one diagnostic per line matched by a colon-separated pattern. Returns
/// `None` when nothing parseable was found.
fn parse_output(stdout: &[u8], uri: &str, compute_time_ms: u64) -> Option<Vec<Diagnostic>> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = serde_json::from_str::<LinterOutput>(trimmed) {
        let raw = match parsed {
            LinterOutput::List(list) => list,
            LinterOutput::Single(single) => vec![*single],
        };
        return Some(
            raw.into_iter()
                .map(|finding| finding.into_diagnostic(uri, compute_time_ms))
                .collect(),
        );
    }
    let fallback = parse_fallback_lines(trimmed, uri, compute_time_ms);
    if fallback.is_empty() {
        None
    } else {
        Some(fallback)
    }
}

static FALLBACK_LINE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?P<column>\d+):?\s*(?P<severity>error|warning|warn|info|advice|hint|help|deny)\b:?\s*(?:\[(?P<code>[^\]]+)\]\s*)?(?P<message>.+)$",
    )
    .ok()
});

fn parse_fallback_lines(text: &str, uri: &str, compute_time_ms: u64) -> Vec<Diagnostic> {
    let Some(pattern) = FALLBACK_LINE.as_ref() else {
        return Vec::new();
    };
    let mut diagnostics = Vec::new();
    for line in text.lines() {
        let Some(captures) = pattern.captures(line.trim()) else {
            continue;
        };
        let parse_u32 = |name: &str| {
            captures
                .name(name)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(1)
        };
        let severity = captures
            .name("severity")
            .and_then(|m| Severity::from_linter_raw(m.as_str()))
            .unwrap_or(Severity::Warning);
        diagnostics.push(
            Diagnostic {
                file: SmolStr::new(uri),
                line: parse_u32("line"),
                column: parse_u32("column"),
                end_line: None,
                end_column: None,
                message: captures
                    .name("message")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default(),
                severity,
                source: DiagnosticSource::Linter,
                code: captures.name("code").map(|m| SmolStr::new(m.as_str())),
                compute_time_ms,
                attachment: None,
            }
            .normalized(),
        );
    }
    diagnostics
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LinterOutput {
    List(Vec<RawLintFinding>),
    Single(Box<RawLintFinding>),
}

#[derive(Debug, Deserialize)]
struct RawLintFinding {
    message: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, alias = "ruleId")]
    rule_id: Option<SmolStr>,
    #[serde(default)]
    file: Option<SmolStr>,
    #[serde(default)]
    start: Option<RawPosition>,
    #[serde(default)]
    end: Option<RawPosition>,
    #[serde(default)]
    fix: Option<RawFix>,
    #[serde(default)]
    help: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(default)]
    line: u32,
    #[serde(default)]
    column: u32,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct RawFix {
    #[serde(default)]
    edits: Vec<RawEdit>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct RawEdit {
    span: RawSpan,
    content: String,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct RawSpan {
    start: u64,
    end: u64,
}

impl RawLintFinding {
    fn into_diagnostic(self, uri: &str, compute_time_ms: u64) -> Diagnostic {
        let severity = self
            .severity
            .as_deref()
            .and_then(Severity::from_linter_raw)
            .unwrap_or(Severity::Warning);
        let (line, column) = self
            .start
            .as_ref()
            .map(|start| (start.line, start.column))
            .unwrap_or((1, 1));
        let (end_line, end_column) = self
            .end
            .as_ref()
            .map(|end| (Some(end.line), Some(end.column)))
            .unwrap_or((None, None));
        // Fix payloads ride along for downstream quick-fix surfaces.
        let attachment = match (&self.fix, &self.help) {
            (None, None) => None,
            (fix, help) => Some(json!({ "fix": fix, "help": help })),
        };
        Diagnostic {
            file: self.file.unwrap_or_else(|| SmolStr::new(uri)),
            line,
            column,
            end_line,
            end_column,
            message: self.message,
            severity,
            source: DiagnosticSource::Linter,
            code: self.rule_id,
            compute_time_ms,
            attachment,
        }
        .normalized()
    }
}

fn file_name_of(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}
