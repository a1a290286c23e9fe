//! End-to-end worker loop tests: claim → execute → resolve → release against
//! a real database and real child processes.
//!
//! Skipped unless `REPORTQ_DATABASE_URL` is set; unix-only because the
//! commands run under `sh`.
#![cfg(unix)]

use std::{env, os::unix::fs::PermissionsExt, time::Duration};

use serial_test::serial;
use uuid::Uuid;

use reportq::{ActiveHours, Config, Database, ReportId, RequestId, Worker};

/// Write an executable shell script and return its path as the report's
/// command template. Commands run as script files, the way deployed reports
/// are configured; the template itself is a single path.
fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_str().unwrap().to_string()
}

async fn setup_db() -> Option<Database> {
    let database_url = match env::var("REPORTQ_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: REPORTQ_DATABASE_URL not set");
            return None;
        }
    };
    let db = Database::connect(&database_url).await.ok()?;
    sqlx::query("TRUNCATE request_events, report_locks, requests, reports CASCADE")
        .execute(db.pool())
        .await
        .ok()?;
    Some(db)
}

fn worker_config(database_url: &str, log_dir: &std::path::Path, job_timeout: Duration) -> Config {
    Config {
        database_url: database_url.to_string(),
        poll_interval: Duration::from_millis(100),
        worker_id: "flow-test-worker".to_string(),
        job_timeout,
        heartbeat_interval: Duration::from_millis(200),
        lock_stale_after: Duration::from_secs(30),
        log_dir: log_dir.to_path_buf(),
        use_shell: true,
        active_hours: ActiveHours::new(0, 0, chrono_tz::UTC),
    }
}

async fn create_report(db: &Database, command: &str) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO reports (code, name, command, output_base_path)
        VALUES ($1, 'flow test', $2, '/srv/reports/out')
        RETURNING id
        "#,
    )
    .bind(format!("FLOW_{}", Uuid::new_v4().simple()))
    .bind(command)
    .fetch_one(db.pool())
    .await
    .unwrap()
}

async fn create_request(db: &Database, report_id: i64, max_attempts: i32) -> (i64, String) {
    let correlation = format!("REQ_{}", Uuid::new_v4().simple());
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO requests (request_id, report_id, requested_by, state, max_attempts)
        VALUES ($1, $2, 'tester', 'queued', $3)
        RETURNING id
        "#,
    )
    .bind(&correlation)
    .bind(report_id)
    .bind(max_attempts)
    .fetch_one(db.pool())
    .await
    .unwrap();
    (id, correlation)
}

/// Poll until the request reaches a terminal state, or panic after 15s.
async fn wait_for_terminal(db: &Database, id: i64) -> reportq::Request {
    for _ in 0..150 {
        let request = db.get_request(RequestId(id)).await.unwrap();
        if request.state == "succeeded" || request.state == "failed" {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("request {id} never reached a terminal state");
}

#[tokio::test]
#[serial]
async fn successful_run_end_to_end() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let command = write_script(scripts.path(), "ok.sh", "echo report done");
    let report_id = create_report(&db, &command).await;
    let (id, correlation) = create_request(&db, report_id, 2).await;

    let config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(30),
    );
    let worker = Worker::start(config, db.clone());

    let request = wait_for_terminal(&db, id).await;
    worker.shutdown().await.unwrap();

    assert_eq!(request.state, "succeeded");
    assert_eq!(request.progress, 100);
    assert_eq!(request.attempts, 0);
    assert_eq!(request.output_path.as_deref(), Some("/srv/reports/out"));
    assert!(request.error_detail.is_none());

    // Durable per-request log was written before the DB outcome.
    let log_path = log_dir.path().join(format!("{correlation}.log"));
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("returncode=0"));
    assert!(contents.contains("report done"));
    assert_eq!(request.log_path.as_deref(), Some(log_path.to_str().unwrap()));

    // Lock released in the guaranteed final step.
    assert!(db
        .get_report_lock(ReportId(report_id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[serial]
async fn failing_run_retries_then_fails() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let command = write_script(scripts.path(), "fail.sh", "exit 7");
    let report_id = create_report(&db, &command).await;
    let (id, _) = create_request(&db, report_id, 2).await;

    let config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(30),
    );
    let worker = Worker::start(config, db.clone());

    let request = wait_for_terminal(&db, id).await;
    worker.shutdown().await.unwrap();

    assert_eq!(request.state, "failed");
    assert_eq!(request.attempts, 2);
    assert_eq!(request.progress, 100);
    let detail = request.error_detail.unwrap();
    assert!(detail.contains("returncode=7"), "detail: {detail}");

    // One requeue event plus one final-failure event.
    let error_events: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM request_events WHERE request_id = $1 AND kind = 'error'",
    )
    .bind(id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(error_events, 2);

    assert!(db
        .get_report_lock(ReportId(report_id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[serial]
async fn timed_out_run_routes_through_failure_path() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let command = write_script(scripts.path(), "slow.sh", "sleep 10");
    let report_id = create_report(&db, &command).await;
    let (id, correlation) = create_request(&db, report_id, 1).await;

    let config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(1),
    );
    let started = std::time::Instant::now();
    let worker = Worker::start(config, db.clone());

    let request = wait_for_terminal(&db, id).await;
    worker.shutdown().await.unwrap();

    // Forcibly terminated, not waited out.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(request.state, "failed");
    let detail = request.error_detail.unwrap();
    assert!(detail.contains("timed_out=true"), "detail: {detail}");
    assert!(detail.contains("returncode=124"), "detail: {detail}");

    let contents =
        std::fs::read_to_string(log_dir.path().join(format!("{correlation}.log"))).unwrap();
    assert!(contents.contains("timed_out=true"));
}

#[tokio::test]
#[serial]
async fn missing_report_funnels_into_failure_path() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();

    let report_id = create_report(&db, "echo hi").await;
    let (id, correlation) = create_request(&db, report_id, 1).await;
    // Blank out the command: a configuration error, not a worker crash.
    sqlx::query("UPDATE reports SET command = NULL WHERE id = $1")
        .bind(report_id)
        .execute(db.pool())
        .await
        .unwrap();

    let config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(30),
    );
    let worker = Worker::start(config, db.clone());

    let request = wait_for_terminal(&db, id).await;
    worker.shutdown().await.unwrap();

    assert_eq!(request.state, "failed");
    let detail = request.error_detail.unwrap();
    assert!(detail.contains("no command configured"), "detail: {detail}");

    let contents =
        std::fs::read_to_string(log_dir.path().join(format!("{correlation}.log"))).unwrap();
    assert!(contents.contains("=== WORKER_ERROR ==="));

    // Worker process survived the bad job and released the lock.
    assert!(db
        .get_report_lock(ReportId(report_id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[serial]
async fn progress_advances_through_running_checkpoint() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    // Long enough that the command-running checkpoint is observable from
    // outside while the child sleeps.
    let command = write_script(scripts.path(), "steady.sh", "sleep 3");
    let report_id = create_report(&db, &command).await;
    let (id, _) = create_request(&db, report_id, 1).await;

    let config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(30),
    );
    let worker = Worker::start(config, db.clone());

    let mut saw_running_checkpoint = false;
    for _ in 0..200 {
        let request = db.get_request(RequestId(id)).await.unwrap();
        if request.state == "succeeded" || request.state == "failed" {
            break;
        }
        if request.progress == 40 {
            assert_eq!(request.status_message.as_deref(), Some("running command"));
            saw_running_checkpoint = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let request = wait_for_terminal(&db, id).await;
    worker.shutdown().await.unwrap();

    assert!(
        saw_running_checkpoint,
        "progress never observed at the command-running checkpoint"
    );
    assert_eq!(request.state, "succeeded");
    assert_eq!(request.progress, 100);
}

#[tokio::test]
#[serial]
async fn back_to_back_requests_drain_in_one_poll_cycle() {
    let Some(db) = setup_db().await else { return };
    let log_dir = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();

    let command = write_script(scripts.path(), "quick.sh", "echo done");
    let mut ids = Vec::new();
    for _ in 0..3 {
        let report_id = create_report(&db, &command).await;
        let (id, _) = create_request(&db, report_id, 1).await;
        ids.push(id);
    }

    // A long interval: if the loop slept between jobs, each later request
    // would wait out a full tick and blow well past the bound below.
    let mut config = worker_config(
        &env::var("REPORTQ_DATABASE_URL").unwrap(),
        log_dir.path(),
        Duration::from_secs(30),
    );
    config.poll_interval = Duration::from_secs(10);

    let started = std::time::Instant::now();
    let worker = Worker::start(config, db.clone());

    for id in &ids {
        let request = wait_for_terminal(&db, *id).await;
        assert_eq!(request.state, "succeeded");
    }
    worker.shutdown().await.unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(8),
        "queued requests were not drained within one poll cycle"
    );
}
