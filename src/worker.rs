//! The worker loop: poll, claim, execute, resolve, sleep.
//!
//! Each worker process runs one of these loops. The loop is the outermost
//! failure boundary: any error at poll granularity is logged and followed by
//! the next tick rather than terminating the process. Per-job errors funnel
//! through the retry/outcome resolver so a claimed request is never left
//! `running`, and the report lock is released in a guaranteed final step no
//! matter which branch the job took.

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    db::{Database, ReportId, Request, RequestId},
    executor,
    joblog::RequestLogWriter,
    outcome,
};

/// Handle to a spawned worker loop.
pub struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl Worker {
    /// Spawn the worker loop onto the runtime.
    pub fn start(config: Config, database: Database) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = WorkerTask {
                log_writer: RequestLogWriter::new(config.log_dir.clone()),
                config,
                database,
                shutdown_rx,
                gate_was_open: None,
            };
            if let Err(err) = task.run().await {
                error!(?err, "worker loop terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("worker task panicked: {err}")),
        }
    }
}

struct WorkerTask {
    config: Config,
    database: Database,
    log_writer: RequestLogWriter,
    shutdown_rx: watch::Receiver<bool>,
    gate_was_open: Option<bool>,
}

impl WorkerTask {
    async fn run(mut self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            job_timeout_secs = self.config.job_timeout.as_secs(),
            active_hours = %self.config.active_hours,
            "starting worker loop",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_cycle().await {
                        metrics::counter!("reportq_worker_errors_total").increment(1);
                        error!(?err, "poll cycle failed; backing off one interval");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("worker loop shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Evaluate the admission gate, logging open/closed transitions once per
    /// edge rather than once per poll.
    fn gate_allows(&mut self) -> bool {
        let open = self.config.active_hours.is_open();
        if self.gate_was_open != Some(open) {
            if open {
                info!(window = %self.config.active_hours, "admission window opened; resuming claims");
            } else {
                info!(window = %self.config.active_hours, "admission window closed; pausing claims");
            }
            self.gate_was_open = Some(open);
        }
        open
    }

    /// One poll cycle: claim and resolve requests back to back until the
    /// queue yields nothing. The interval sleep applies only between empty
    /// polls, not between consecutive jobs. Gate and shutdown are re-checked
    /// before each claim so a closing window or a shutdown signal ends the
    /// cycle at the next job boundary.
    async fn poll_cycle(&mut self) -> Result<()> {
        loop {
            if !self.gate_allows() || *self.shutdown_rx.borrow() {
                return Ok(());
            }

            let claimed = self
                .database
                .claim_next_request(&self.config.worker_id, self.config.lock_stale_seconds())
                .await?;

            let Some(request) = claimed else {
                debug!("queue empty or all candidate reports locked");
                return Ok(());
            };

            metrics::counter!("reportq_claims_total").increment(1);
            info!(
                request = %request.request_id,
                report_id = request.report_id,
                attempt = request.attempts + 1,
                "claimed request"
            );

            self.process_request(request).await;
        }
    }

    /// Run one claimed request through execute → resolve → release.
    ///
    /// Never returns an error: any pipeline failure is funneled into the
    /// retry/outcome path, and the report lock is released regardless.
    async fn process_request(&self, request: Request) {
        let request_id = RequestId(request.id);
        let report_id = ReportId(request.report_id);

        if let Err(err) = self.execute_request(&request).await {
            metrics::counter!("reportq_job_failures_total").increment(1);
            let detail = format!("unhandled worker error: {err:#}");
            error!(request = %request.request_id, %detail, "job pipeline failed");

            let log_path = match self
                .log_writer
                .write(&request.request_id, "N/A", None, Some(&detail))
            {
                Ok(path) => path.display().to_string(),
                Err(io_err) => {
                    error!(?io_err, "failed to write request log");
                    String::new()
                }
            };

            if let Err(db_err) =
                outcome::record_failure(&self.database, request_id, &log_path, &detail).await
            {
                // The request stays running with a decaying lock; flagged by
                // count_stale_locks monitoring.
                error!(?db_err, request = %request.request_id, "failed to record failure outcome");
            }
        }

        match self
            .database
            .release_report_lock(report_id, request_id, &self.config.worker_id)
            .await
        {
            Ok(true) => debug!(report = %report_id, "released report lock"),
            Ok(false) => warn!(
                report = %report_id,
                "report lock no longer ours at release; skipped"
            ),
            Err(err) => error!(?err, report = %report_id, "failed to release report lock"),
        }
    }

    /// The happy-path pipeline. A job that runs and exits non-zero is still
    /// `Ok(())` here — that outcome is resolved inside. `Err` means the
    /// pipeline itself broke (missing report, store hiccup, unbuildable
    /// command) and the caller funnels it into the failure path.
    async fn execute_request(&self, request: &Request) -> Result<()> {
        let request_id = RequestId(request.id);
        let report_id = ReportId(request.report_id);

        let report = self
            .database
            .get_report(report_id)
            .await?
            .ok_or_else(|| anyhow!("report {report_id} no longer exists"))?;

        self.database
            .update_request_progress(request_id, 20, "preparing execution")
            .await?;

        let spec = executor::build_command(&report, request, self.config.use_shell)?;
        let command_line = spec.display_line();
        info!(
            report = %report.code,
            request = %request.request_id,
            command = %command_line,
            "executing command"
        );

        self.database
            .update_request_progress(request_id, 40, "running command")
            .await?;

        let heartbeat_db = self.database.clone();
        let heartbeat_worker = self.config.worker_id.clone();
        let result = executor::run_supervised(
            &spec,
            self.config.job_timeout,
            self.config.heartbeat_interval,
            move || {
                let db = heartbeat_db.clone();
                let worker_id = heartbeat_worker.clone();
                async move {
                    match db
                        .heartbeat_report_lock(report_id, request_id, &worker_id)
                        .await
                    {
                        Ok(true) => debug!(report = %report_id, "lock heartbeat"),
                        // Reclaimed after going stale; do not resurrect it.
                        Ok(false) => warn!(report = %report_id, "lock no longer ours; heartbeat skipped"),
                        Err(err) => warn!(?err, report = %report_id, "lock heartbeat failed"),
                    }
                }
            },
        )
        .await?;

        self.database
            .update_request_progress(request_id, 80, "recording result")
            .await?;

        let log_path = self
            .log_writer
            .write(&request.request_id, &command_line, Some(&result), None)
            .context("failed to write request log")?
            .display()
            .to_string();

        if result.is_success() {
            outcome::record_success(&self.database, request_id, &report, &log_path).await?;
        } else {
            metrics::counter!("reportq_job_failures_total").increment(1);
            let detail = outcome::failure_detail(&result);
            warn!(request = %request.request_id, %detail, "command failed");
            outcome::record_failure(&self.database, request_id, &log_path, &detail).await?;
        }

        Ok(())
    }
}
