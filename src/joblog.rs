//! Durable per-request execution logs.
//!
//! One file per request correlation id, written before any database outcome
//! update. If the subsequent DB write fails, this file is the last line of
//! defense for postmortem diagnosis.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;

use crate::executor::ExecutionResult;

/// Keep captured output in the log file bounded; a runaway child can emit
/// gigabytes.
const OUTPUT_TRUNCATE_BYTES: usize = 64 * 1024;

/// Writes one human-readable log file per request into a fixed directory.
#[derive(Debug, Clone)]
pub struct RequestLogWriter {
    dir: PathBuf,
}

impl RequestLogWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the execution log for a request and return its path.
    ///
    /// Either `result` (a completed run, successful or not) or `error`
    /// (a worker-level pipeline failure) may be present; both appear when a
    /// run completed and resolution still failed.
    pub fn write(
        &self,
        correlation_id: &str,
        command_line: &str,
        result: Option<&ExecutionResult>,
        error: Option<&str>,
    ) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{correlation_id}.log"));

        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("request_id={correlation_id}"));
        lines.push(format!("timestamp_utc={}", Utc::now().to_rfc3339()));
        lines.push(format!("command={command_line}"));

        if let Some(result) = result {
            lines.push(format!(
                "duration_sec={:.3}",
                result.duration.as_secs_f64()
            ));
            lines.push(format!("timed_out={}", result.timed_out));
            lines.push(format!("returncode={}", result.exit_code));
            lines.push(String::new());
            lines.push("=== STDOUT ===".to_string());
            lines.push(truncate_output(&result.stdout));
            lines.push(String::new());
            lines.push("=== STDERR ===".to_string());
            lines.push(truncate_output(&result.stderr));
        }

        if let Some(error) = error {
            lines.push(String::new());
            lines.push("=== WORKER_ERROR ===".to_string());
            lines.push(error.to_string());
        }

        let mut file = fs::File::create(&path)?;
        file.write_all(lines.join("\n").as_bytes())?;
        Ok(path)
    }
}

fn truncate_output(text: &str) -> String {
    if text.len() <= OUTPUT_TRUNCATE_BYTES {
        return text.to_string();
    }
    // Cut on a char boundary.
    let mut end = OUTPUT_TRUNCATE_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..end], text.len() - end)
}
