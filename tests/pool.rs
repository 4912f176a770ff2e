//! Worker-pool lifecycle tests against stub processes.

#![cfg(unix)]

use std::time::{Duration, Instant};
use textlayer::WorkerPool;

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_force_kills_a_hanging_worker_within_the_timeout() {
    // A worker that handshakes correctly and then ignores EOF forever —
    // the shape of an engine wedged in teardown.
    let mut pool = WorkerPool::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo '{"status":"ready"}'; exec sleep 600"#.to_string(),
        ],
        2,
        Duration::from_secs(1),
        Duration::from_secs(5),
    );

    pool.start().await.expect("stub workers should start");
    let pids = pool.worker_pids();
    assert_eq!(pids.len(), 2);
    for &pid in &pids {
        assert!(process_alive(pid), "worker {pid} should be running");
    }

    let begin = Instant::now();
    pool.stop().await;
    let elapsed = begin.elapsed();

    // Graceful window (1s) + kill reap, with generous slack for CI.
    assert!(
        elapsed < Duration::from_secs(8),
        "stop took {elapsed:?}, expected to be bounded"
    );
    for &pid in &pids {
        assert!(
            !process_alive(pid),
            "worker {pid} still alive after forced shutdown"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_quick_for_a_cooperative_worker() {
    // `cat` exits on stdin EOF, which is exactly the graceful path.
    let mut pool = WorkerPool::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo '{"status":"ready"}'; exec cat > /dev/null"#.to_string(),
        ],
        1,
        Duration::from_secs(10),
        Duration::from_secs(5),
    );

    pool.start().await.expect("stub worker should start");
    let pids = pool.worker_pids();

    let begin = Instant::now();
    pool.stop().await;

    assert!(begin.elapsed() < Duration::from_secs(5));
    for &pid in &pids {
        assert!(!process_alive(pid));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_fails_cleanly_when_a_worker_reports_a_bad_handshake() {
    let mut pool = WorkerPool::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"echo '{"status":"engine load failed"}'"#.to_string(),
        ],
        1,
        Duration::from_secs(1),
        Duration::from_secs(5),
    );

    let err = pool.start().await.unwrap_err();
    assert!(err.contains("engine load failed"), "got: {err}");
    pool.stop().await;
}
