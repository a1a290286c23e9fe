//! Report lock operations.
//!
//! One row per report in `report_locks` enforces single-active-executor-per-
//! report across worker processes. A lock is live while its heartbeat is
//! younger than the configured staleness threshold; beyond that any worker
//! may reclaim it, which is how work survives a crashed holder.
//!
//! Heartbeat and release are guarded by the full (report, request, worker)
//! triple: a delayed or zombie worker whose lock was already reclaimed can
//! neither resurrect nor evict the new holder.

use sqlx::PgConnection;

use super::{Database, DbResult, ReportId, ReportLock, RequestId};

impl Database {
    /// Acquire or refresh the lock for a report inside an open transaction.
    ///
    /// Succeeds when no lock row exists, the existing row is stale, or the
    /// row is already held by the same (worker, request) pair (idempotent
    /// refresh). Returns `false` on contention; contention is a normal
    /// skip-and-continue condition during claiming, never an error.
    pub(crate) async fn try_acquire_report_lock(
        conn: &mut PgConnection,
        report_id: ReportId,
        request_id: RequestId,
        worker_id: &str,
        stale_seconds: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO report_locks (report_id, worker_id, request_id, acquired_at, heartbeat_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (report_id) DO UPDATE
            SET worker_id = EXCLUDED.worker_id,
                request_id = EXCLUDED.request_id,
                acquired_at = NOW(),
                heartbeat_at = NOW()
            WHERE report_locks.heartbeat_at < NOW() - ($4 || ' seconds')::interval
               OR (report_locks.worker_id = EXCLUDED.worker_id
                   AND report_locks.request_id = EXCLUDED.request_id)
            "#,
        )
        .bind(report_id.0)
        .bind(worker_id)
        .bind(request_id.0)
        .bind(stale_seconds.to_string())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh the heartbeat on a held lock.
    ///
    /// Silent no-op (returns `false`) when the stored holder no longer
    /// matches the caller's triple — a job whose lock went stale and was
    /// reclaimed must not resurrect it.
    pub async fn heartbeat_report_lock(
        &self,
        report_id: ReportId,
        request_id: RequestId,
        worker_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE report_locks
            SET heartbeat_at = NOW()
            WHERE report_id = $1 AND request_id = $2 AND worker_id = $3
            "#,
        )
        .bind(report_id.0)
        .bind(request_id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a held lock. No-op when the triple does not match, so a
    /// delayed worker cannot evict a legitimate new holder.
    pub async fn release_report_lock(
        &self,
        report_id: ReportId,
        request_id: RequestId,
        worker_id: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM report_locks
            WHERE report_id = $1 AND request_id = $2 AND worker_id = $3
            "#,
        )
        .bind(report_id.0)
        .bind(request_id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch the current lock row for a report, if any.
    pub async fn get_report_lock(&self, report_id: ReportId) -> DbResult<Option<ReportLock>> {
        let lock = sqlx::query_as::<_, ReportLock>(
            r#"
            SELECT report_id, worker_id, request_id, acquired_at, heartbeat_at
            FROM report_locks
            WHERE report_id = $1
            "#,
        )
        .bind(report_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(lock)
    }

    /// Count locks whose heartbeat has gone stale.
    ///
    /// Monitoring hook for crashed holders: the orphaned `running` request
    /// behind a stale lock is not automatically requeued, so operators watch
    /// this number.
    pub async fn count_stale_locks(&self, stale_seconds: i64) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM report_locks
            WHERE heartbeat_at < NOW() - ($1 || ' seconds')::interval
            "#,
        )
        .bind(stale_seconds.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
