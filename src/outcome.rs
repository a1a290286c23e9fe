//! Retry/outcome resolution: maps execution results onto the bounded
//! retry/failure state machine.
//!
//! Every failure — non-zero exit, timeout, missing report, or an unexpected
//! pipeline error — funnels through [`record_failure`], so a request is
//! never left `running` indefinitely. `attempts` counts completed execution
//! attempts; a request reaches `failed` only on its max_attempts-th failed
//! attempt, never earlier.

use tracing::{info, warn};

use crate::db::{Database, DbResult, Report, RequestId};
use crate::executor::ExecutionResult;

/// Error detail stored on the request row is truncated; the full text lives
/// in the per-request log file.
const ERROR_DETAIL_TRUNCATE: usize = 1500;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// attempts < max_attempts after this failure: back to the queue.
    Requeue { attempt: i32, max_attempts: i32 },
    /// Attempts exhausted: terminal failure.
    Fail { attempt: i32, max_attempts: i32 },
}

/// Decide the transition for a failed attempt, given the attempts completed
/// before it and the configured bound (clamped to at least one).
pub fn decide(attempts_before: i32, max_attempts: i32) -> RetryDecision {
    let attempt = attempts_before + 1;
    let max_attempts = max_attempts.max(1);
    if attempt < max_attempts {
        RetryDecision::Requeue {
            attempt,
            max_attempts,
        }
    } else {
        RetryDecision::Fail {
            attempt,
            max_attempts,
        }
    }
}

/// Condensed failure text stored in the request's `error_detail` column.
pub fn failure_detail(result: &ExecutionResult) -> String {
    let stderr = truncate(&result.stderr, ERROR_DETAIL_TRUNCATE);
    format!(
        "returncode={}; timed_out={}; stderr={stderr}",
        result.exit_code, result.timed_out
    )
}

/// Finalize a successful run.
///
/// The output path is resolved strictly from the report's configured output
/// base, never inferred from process output or parameters.
pub async fn record_success(
    db: &Database,
    request_id: RequestId,
    report: &Report,
    log_path: &str,
) -> DbResult<()> {
    let output_path = report
        .output_base_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    let applied = db
        .mark_request_succeeded(request_id, log_path, output_path)
        .await?;
    if !applied {
        warn!(request = %request_id, "request no longer running; success outcome dropped");
        return Ok(());
    }

    info!(request = %request_id, report = %report.code, "request succeeded");
    Ok(())
}

/// Record a failed attempt, requeueing or finalizing per the retry policy.
///
/// Attempt counters are re-read from the store at resolution time so a
/// stale in-memory snapshot can never skew the bound. Returns `None` when
/// the request had already been resolved: a terminal state is never
/// re-entered, even by a late failure funnel.
pub async fn record_failure(
    db: &Database,
    request_id: RequestId,
    log_path: &str,
    error_detail: &str,
) -> DbResult<Option<RetryDecision>> {
    let (attempts_before, max_attempts) = db.request_attempt_counts(request_id).await?;
    let decision = decide(attempts_before, max_attempts);
    let error_detail = truncate(error_detail, ERROR_DETAIL_TRUNCATE);

    let applied = match decision {
        RetryDecision::Requeue {
            attempt,
            max_attempts,
        } => {
            let applied = db
                .requeue_request_for_retry(
                    request_id,
                    attempt,
                    max_attempts,
                    log_path,
                    &error_detail,
                )
                .await?;
            if applied {
                info!(
                    request = %request_id,
                    attempt,
                    max_attempts,
                    "attempt failed; requeued for retry"
                );
            }
            applied
        }
        RetryDecision::Fail {
            attempt,
            max_attempts,
        } => {
            let applied = db
                .mark_request_failed(request_id, attempt, max_attempts, log_path, &error_detail)
                .await?;
            if applied {
                info!(
                    request = %request_id,
                    attempt,
                    max_attempts,
                    "attempts exhausted; request failed"
                );
            }
            applied
        }
    };

    if !applied {
        warn!(request = %request_id, "request no longer running; failure outcome dropped");
        return Ok(None);
    }

    Ok(Some(decision))
}

fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
