//! Request store operations: the queue claimer and state transitions.
//!
//! The claimer is the heart of the multi-worker coordination. It scans
//! queued rows in `(requested_at, id)` order with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never block each other, then tries to take the
//! candidate's report lock inside the same transaction. A candidate whose
//! report is held live by another worker is skipped, not failed; ordering
//! across distinct reports is therefore best-effort rather than strict FIFO.

use sqlx::{Connection, PgConnection};

use super::{
    Database, DbError, DbResult, Report, ReportId, Request, RequestId, EVENT_KIND_ERROR,
    EVENT_KIND_STATE, EVENT_ORIGIN_WORKER,
};

/// How many queued candidates one claim transaction inspects before giving
/// up. Bounds the number of row locks held while every report is contended.
const CLAIM_SCAN_LIMIT: i64 = 20;

const REQUEST_COLUMNS: &str = r#"
    id, request_id, report_id, requested_by, state, progress, status_message,
    input_path, parameters, attempts, max_attempts, output_path, log_path,
    error_detail, requested_at, started_at, finished_at, updated_at
"#;

impl Database {
    // ========================================================================
    // Queue Claimer
    // ========================================================================

    /// Atomically claim the next eligible queued request for `worker_id`.
    ///
    /// Returns `None` when the queue is empty or every candidate's report is
    /// currently locked by another worker. Any row locks taken while
    /// scanning are rolled back before returning.
    ///
    /// Guarantee: no two workers ever receive the same request, and no two
    /// workers ever hold a live lock on the same report simultaneously.
    pub async fn claim_next_request(
        &self,
        worker_id: &str,
        stale_seconds: i64,
    ) -> DbResult<Option<Request>> {
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, report_id
            FROM requests
            WHERE state = 'queued'
            ORDER BY requested_at, id
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(CLAIM_SCAN_LIMIT)
        .fetch_all(&mut *tx)
        .await?;

        for (request_id, report_id) in candidates {
            // Each acquisition attempt runs under a savepoint. A conflicting
            // upsert row-locks the existing lock row even when the guard
            // rejects the update; carrying those locks across candidates
            // would let two claimers deadlock on reports tried in opposite
            // orders. Rolling the savepoint back releases the row lock.
            let mut attempt = tx.begin().await?;

            let acquired = Self::try_acquire_report_lock(
                &mut *attempt,
                ReportId(report_id),
                RequestId(request_id),
                worker_id,
                stale_seconds,
            )
            .await?;
            if !acquired {
                // Lock contention: another worker is executing this report.
                attempt.rollback().await?;
                continue;
            }

            sqlx::query(
                r#"
                UPDATE requests
                SET state = 'running',
                    progress = 10,
                    status_message = $2,
                    started_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(request_id)
            .bind(format!("claimed by worker {worker_id}"))
            .execute(&mut *attempt)
            .await?;

            Self::insert_event(
                &mut *attempt,
                RequestId(request_id),
                EVENT_KIND_STATE,
                "running",
            )
            .await?;

            attempt.commit().await?;
            tx.commit().await?;

            let request = self.get_request(RequestId(request_id)).await?;
            return Ok(Some(request));
        }

        tx.rollback().await?;
        Ok(None)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Load a request by its internal id.
    pub async fn get_request(&self, id: RequestId) -> DbResult<Request> {
        let query = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1");
        let request = sqlx::query_as::<_, Request>(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("request {id}")))?;

        Ok(request)
    }

    /// Load the report a request executes against, if it still exists.
    pub async fn get_report(&self, id: ReportId) -> DbResult<Option<Report>> {
        let report = sqlx::query_as::<_, Report>(
            r#"
            SELECT id, code, name, command, output_base_path, allowed_extensions, active
            FROM reports
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(report)
    }

    /// Re-read the attempt counters for the retry decision. Counts are read
    /// at resolution time, never trusted from the claimed snapshot.
    pub async fn request_attempt_counts(&self, id: RequestId) -> DbResult<(i32, i32)> {
        let counts: (i32, i32) =
            sqlx::query_as("SELECT attempts, max_attempts FROM requests WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("request {id}")))?;

        Ok(counts)
    }

    // ========================================================================
    // State Transitions
    // ========================================================================

    /// Advance the progress checkpoint within the current attempt.
    pub async fn update_request_progress(
        &self,
        id: RequestId,
        progress: i32,
        message: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE requests
            SET progress = $2,
                status_message = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(progress)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finalize a request as succeeded.
    ///
    /// The output path comes strictly from the report's configured output
    /// base; callers never infer it from process output or parameters.
    ///
    /// Only a `running` request can be finalized; the state update and its
    /// event commit together. Returns `false` when the request was no longer
    /// running — already resolved, so nothing is touched.
    pub async fn mark_request_succeeded(
        &self,
        id: RequestId,
        log_path: &str,
        output_path: Option<&str>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'succeeded',
                progress = 100,
                status_message = 'finished successfully',
                log_path = $2,
                output_path = $3,
                error_detail = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id.0)
        .bind(log_path)
        .bind(output_path)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_event(&mut *tx, id, EVENT_KIND_STATE, "succeeded").await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Requeue a failed attempt for retry: back to `queued`, progress reset
    /// to zero, error detail and log path preserved for diagnosis.
    ///
    /// Guarded the same way as the terminal transitions: returns `false`
    /// without touching the row when the request is not `running`, so a late
    /// failure funnel can never reopen an already-resolved request.
    pub async fn requeue_request_for_retry(
        &self,
        id: RequestId,
        attempts: i32,
        max_attempts: i32,
        log_path: &str,
        error_detail: &str,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'queued',
                progress = 0,
                status_message = $2,
                attempts = $3,
                log_path = $4,
                error_detail = $5,
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id.0)
        .bind(format!("retry scheduled ({attempts}/{max_attempts})"))
        .bind(attempts)
        .bind(log_path)
        .bind(error_detail)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_event(
            &mut *tx,
            id,
            EVENT_KIND_ERROR,
            &format!("execution failed; requeued {attempts}/{max_attempts}: {error_detail}"),
        )
        .await?;
        tx.commit().await?;

        Ok(true)
    }

    /// Finalize a request as failed after exhausting its attempts.
    ///
    /// Returns `false` without touching the row when the request is not
    /// `running`.
    pub async fn mark_request_failed(
        &self,
        id: RequestId,
        attempts: i32,
        max_attempts: i32,
        log_path: &str,
        error_detail: &str,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE requests
            SET state = 'failed',
                progress = 100,
                status_message = 'finished with error',
                attempts = $2,
                log_path = $3,
                error_detail = $4,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id.0)
        .bind(attempts)
        .bind(log_path)
        .bind(error_detail)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::insert_event(
            &mut *tx,
            id,
            EVENT_KIND_ERROR,
            &format!("final failure ({attempts}/{max_attempts}): {error_detail}"),
        )
        .await?;
        tx.commit().await?;

        Ok(true)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Append an audit event to a request. The scheduler writes these but
    /// never reads them back; every write rides inside the transaction of
    /// the transition it records.
    async fn insert_event(
        conn: &mut PgConnection,
        request_id: RequestId,
        kind: &str,
        detail: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO request_events (request_id, kind, detail, origin)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(request_id.0)
        .bind(kind)
        .bind(detail)
        .bind(EVENT_ORIGIN_WORKER)
        .execute(conn)
        .await?;

        Ok(())
    }
}
