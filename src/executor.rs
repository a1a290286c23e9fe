//! Execution supervisor: builds and runs a report's external command under a
//! hard timeout with periodic liveness heartbeats.
//!
//! The child is waited on in bounded slices no larger than the heartbeat
//! interval; each slice that elapses without completion fires the heartbeat
//! callback (which refreshes the report lock) before waiting again. There is
//! no dedicated monitor thread.
//!
//! Commands are opaque to this crate: the only contract is an exit code,
//! a timed-out flag and captured output.

use std::{future::Future, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command, time::Instant};
use tracing::{debug, warn};

use crate::db::{Report, Request};

/// Conventional exit code reported for a forcibly terminated command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the child died without one (killed by signal).
const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The report has no usable command template. Treated as an execution
    /// failure subject to the retry policy, never fatal to the worker.
    #[error("report {0} has no command configured")]
    MissingCommand(String),

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error while supervising command: {0}")]
    Io(#[from] std::io::Error),
}

/// The command to execute, in the form the configured execution mode wants.
///
/// Shell form is a single string handed to the system shell (needed for
/// script-file commands with embedded spaces); argv form is pre-tokenized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Human-readable command line for logs and the per-request log file.
    pub fn display_line(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Argv(argv) => argv.join(" "),
        }
    }
}

/// Outcome of one supervised execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Build the final command from the report's template plus the request's
/// parameters and input path.
///
/// Each parameter becomes a `--name "value"` pair; nested object/array
/// values are flattened to their serialized JSON text. Parameters are
/// validated only for serializability, never for shape.
pub fn build_command(
    report: &Report,
    request: &Request,
    use_shell: bool,
) -> Result<CommandSpec, ExecError> {
    let template = report
        .command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ExecError::MissingCommand(report.code.clone()))?;

    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(input_path) = request.input_path.as_deref().filter(|p| !p.is_empty()) {
        pairs.push(("input_path".to_string(), input_path.to_string()));
    }
    if let Some(params) = request.parameters.as_object() {
        for (key, value) in params {
            pairs.push((key.clone(), render_param_value(value)));
        }
    }

    if use_shell {
        // Quote the template path in case it contains spaces and the report
        // author did not quote it themselves.
        let base = if template.contains(' ') && !template.starts_with('"') {
            format!("\"{template}\"")
        } else {
            template.to_string()
        };
        let mut line = base;
        for (key, value) in &pairs {
            line.push_str(&format!(" --{key} \"{value}\""));
        }
        Ok(CommandSpec::Shell(line))
    } else {
        let mut argv = tokenize(template);
        for (key, value) in pairs {
            argv.push(format!("--{key}"));
            argv.push(value);
        }
        Ok(CommandSpec::Argv(argv))
    }
}

fn render_param_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split a command template into argv tokens, honoring double quotes.
/// Quotes group; they are not kept in the token.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Run the command, firing `on_heartbeat` once per elapsed wait slice and
/// force-killing the child once `timeout` is exceeded.
///
/// On timeout the partial output captured so far is preserved and the result
/// carries `timed_out = true` with the conventional sentinel exit code.
pub async fn run_supervised<F, Fut>(
    spec: &CommandSpec,
    timeout: Duration,
    heartbeat_interval: Duration,
    mut on_heartbeat: F,
) -> Result<ExecutionResult, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut command = match spec {
        CommandSpec::Shell(line) => {
            let mut cmd = if cfg!(windows) {
                let mut c = Command::new("cmd");
                c.arg("/C");
                c
            } else {
                let mut c = Command::new("sh");
                c.arg("-c");
                c
            };
            cmd.arg(line);
            cmd
        }
        CommandSpec::Argv(argv) => {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| ExecError::MissingCommand("<empty argv>".to_string()))?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn().map_err(ExecError::Spawn)?;

    // Drain pipes concurrently so a chatty child never blocks on a full pipe.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let slice = heartbeat_interval.max(Duration::from_millis(10));
    let mut timed_out = false;
    let mut exit_code = NO_EXIT_CODE;

    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = timeout.as_secs(),
                "command exceeded timeout; killing"
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
            timed_out = true;
            exit_code = TIMEOUT_EXIT_CODE;
            break;
        }

        let wait_slice = slice.min(timeout - elapsed);
        match tokio::time::timeout(wait_slice, child.wait()).await {
            Ok(status) => {
                exit_code = status?.code().unwrap_or(NO_EXIT_CODE);
                break;
            }
            Err(_elapsed_slice) => {
                debug!("wait slice elapsed; heartbeating");
                on_heartbeat().await;
            }
        }
    }

    let duration = started.elapsed();
    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    if timed_out {
        stderr.push_str(&format!(
            "\n[timeout] exceeded {} seconds",
            timeout.as_secs()
        ));
    }

    Ok(ExecutionResult {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn test_report(command: Option<&str>) -> Report {
        Report {
            id: 1,
            code: "SALES_DAILY".to_string(),
            name: "Daily sales".to_string(),
            command: command.map(str::to_string),
            output_base_path: Some("/srv/reports/sales".to_string()),
            allowed_extensions: Some("csv;xlsx".to_string()),
            active: true,
        }
    }

    fn test_request(input_path: Option<&str>, parameters: serde_json::Value) -> Request {
        let now = Utc::now();
        Request {
            id: 10,
            request_id: "REQ_20250615_ABCD1234".to_string(),
            report_id: 1,
            requested_by: "analyst".to_string(),
            state: "running".to_string(),
            progress: 10,
            status_message: None,
            input_path: input_path.map(str::to_string),
            parameters,
            attempts: 0,
            max_attempts: 2,
            output_path: None,
            log_path: None,
            error_detail: None,
            requested_at: now,
            started_at: Some(now),
            finished_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn tokenize_honors_quotes() {
        assert_eq!(
            tokenize(r#""/opt/run me/report.sh" --fast"#),
            vec!["/opt/run me/report.sh", "--fast"]
        );
        assert_eq!(tokenize("a  b\tc"), vec!["a", "b", "c"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn missing_command_is_config_error() {
        let report = test_report(None);
        let request = test_request(None, json!({}));
        assert!(matches!(
            build_command(&report, &request, true),
            Err(ExecError::MissingCommand(_))
        ));

        let blank = test_report(Some("   "));
        assert!(matches!(
            build_command(&blank, &request, true),
            Err(ExecError::MissingCommand(_))
        ));
    }

    #[test]
    fn shell_command_quotes_spaced_template_and_params() {
        let report = test_report(Some("/opt/reports/run sales.sh"));
        let request = test_request(
            Some("/data/in.csv"),
            json!({"month": "2025-06", "limit": 50}),
        );
        let spec = build_command(&report, &request, true).unwrap();
        assert_eq!(
            spec,
            CommandSpec::Shell(
                r#""/opt/reports/run sales.sh" --input_path "/data/in.csv" --month "2025-06" --limit "50""#
                    .to_string()
            )
        );
    }

    #[test]
    fn argv_command_splits_template_and_appends_pairs() {
        let report = test_report(Some("/opt/reports/run.sh --mode batch"));
        let request = test_request(None, json!({"region": "emea"}));
        let spec = build_command(&report, &request, false).unwrap();
        assert_eq!(
            spec,
            CommandSpec::Argv(vec![
                "/opt/reports/run.sh".to_string(),
                "--mode".to_string(),
                "batch".to_string(),
                "--region".to_string(),
                "emea".to_string(),
            ])
        );
    }

    #[test]
    fn nested_params_flatten_to_json_text() {
        let report = test_report(Some("run.sh"));
        let request = test_request(None, json!({"filters": {"region": "emea", "min": 3}}));
        let spec = build_command(&report, &request, false).unwrap();
        let CommandSpec::Argv(argv) = spec else {
            panic!("expected argv form");
        };
        assert_eq!(argv[1], "--filters");
        let parsed: serde_json::Value = serde_json::from_str(&argv[2]).unwrap();
        assert_eq!(parsed, json!({"region": "emea", "min": 3}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let spec = CommandSpec::Shell("echo out; echo err >&2; exit 3".to_string());
        let result = run_supervised(
            &spec,
            Duration::from_secs(5),
            Duration::from_secs(1),
            || async {},
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_reports_sentinel() {
        let spec = CommandSpec::Argv(vec!["sleep".to_string(), "10".to_string()]);
        let started = std::time::Instant::now();
        let result = run_supervised(
            &spec,
            Duration::from_millis(300),
            Duration::from_millis(50),
            || async {},
        )
        .await
        .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("[timeout]"));
        // Forcible termination, not a full 10s wait.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn heartbeats_fire_while_waiting() {
        let beats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&beats);
        let spec = CommandSpec::Argv(vec!["sleep".to_string(), "1".to_string()]);
        let result = run_supervised(
            &spec,
            Duration::from_secs(10),
            Duration::from_millis(100),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await
        .unwrap();
        assert!(result.is_success());
        assert!(beats.load(Ordering::SeqCst) >= 3);
    }
}
