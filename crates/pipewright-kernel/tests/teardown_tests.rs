//! Tests for resource release: abandoned sequences, group close, host
//! shutdown. Every test body runs under a timeout so a leak shows up as a
//! failure instead of a hung test run.

use std::future::Future;
use std::time::{Duration, Instant};

use pipewright_kernel::{Enumerable, Host, ProcessGroup, ProcessSpec, ProcessState, RuntimeConfig};

const LIMIT: Duration = Duration::from_secs(10);

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(LIMIT, fut).await.expect("timed out: something leaked or hung")
}

fn host() -> Host {
    Host::new(RuntimeConfig::testing())
}

/// Poll until no child of `group` is left.
async fn wait_until_empty(group: &ProcessGroup) {
    while group.live_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// True once `pid` no longer exists (exited and reaped).
fn is_gone(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    matches!(kill(Pid::from_raw(pid as i32), None), Err(nix::errno::Errno::ESRCH))
}

async fn wait_until_gone(pid: u32) {
    while !is_gone(pid) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Early abandonment
// ============================================================================

#[tokio::test]
async fn first_line_of_infinite_producer() {
    within(async {
        let host = host();
        let first = host.exec(ProcessSpec::new("yes")).lines().first().await.unwrap();
        assert_eq!(first.as_deref(), Some("y"));
        assert_eq!(host.group().live_count(), 0);
    })
    .await;
}

#[tokio::test]
async fn take_one_of_a_million_kills_the_producer() {
    within(async {
        let host = host();
        let mut lines = host
            .exec(ProcessSpec::new("seq").args(["1", "1000000"]))
            .lines()
            .take(1);

        assert_eq!(lines.next().await.unwrap().unwrap(), "1");
        // take() has dropped the stage already.
        assert_eq!(host.group().live_count(), 0);
        assert!(lines.next().await.is_none());
    })
    .await;
}

#[tokio::test]
async fn dropped_stage_process_exits() {
    within(async {
        let host = host();
        let mut lines = host.exec(ProcessSpec::new("yes")).lines();
        lines.next().await.unwrap().unwrap();

        let pid = host.group().list()[0].pid;
        drop(lines);
        assert_eq!(host.group().live_count(), 0);
        wait_until_gone(pid).await;
    })
    .await;
}

#[tokio::test]
async fn abandoning_pipeline_tail_tears_down_every_stage() {
    within(async {
        let host = host();
        let lines = host
            .exec(ProcessSpec::new("yes"))
            .stream()
            .pipe(host.group(), ProcessSpec::new("cat"))
            .pipe(host.group(), ProcessSpec::new("cat"))
            .lines()
            .take(3)
            .collect()
            .await
            .unwrap();
        assert_eq!(lines, vec![b"y".to_vec(); 3]);

        // Upstream stages live in aborted feeder tasks; they go on their next poll.
        wait_until_empty(host.group()).await;
    })
    .await;
}

#[tokio::test]
async fn error_in_consumer_releases_processes() {
    within(async {
        let host = host();
        let err = host
            .exec(ProcessSpec::new("yes"))
            .lines()
            .enumerate()
            .try_map(|(i, line)| if i < 5 { Ok(line) } else { Err("enough") })
            .collect()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("enough"));
        assert_eq!(host.group().live_count(), 0);
    })
    .await;
}

#[tokio::test]
async fn abandoned_concurrent_map_releases_workers() {
    within(async {
        let host = host();
        let group = std::sync::Arc::new(host.new_group());
        let g = group.clone();
        let mut seq = Enumerable::from_iterator(0..100).concurrent_map(4, move |_: u32| {
            let exec = g.exec(ProcessSpec::new("sleep").arg("30"));
            async move { exec.run().await }
        });

        // Wait for the workers to have spawned, then walk away.
        let pulled = tokio::time::timeout(Duration::from_millis(200), seq.next()).await;
        assert!(pulled.is_err(), "sleep 30 finished early?");
        while group.live_count() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(seq);
        wait_until_empty(&group).await;
    })
    .await;
}

// ============================================================================
// Group and host teardown
// ============================================================================

#[tokio::test]
async fn group_close_is_idempotent() {
    within(async {
        let host = host();
        let group = host.new_group();
        let handles: Vec<_> = (0..5)
            .map(|_| group.spawn(&ProcessSpec::new("sleep").arg("30")).unwrap())
            .collect();
        assert_eq!(group.live_count(), 5);

        group.close();
        group.close();

        assert_eq!(group.live_count(), 0);
        for handle in &handles {
            assert!(handle.is_closed());
            let status = handle.wait().await.unwrap();
            assert_eq!(status.signal, Some(15));
            // A second wait sees the same status.
            assert_eq!(handle.wait().await.unwrap(), status);
        }
    })
    .await;
}

#[tokio::test]
async fn sigterm_ignored_escalates_to_sigkill() {
    within(async {
        let host = host();
        let handle = host
            .group()
            .spawn(&ProcessSpec::new("sh").args(["-c", "trap '' TERM; echo ready; exec sleep 30"]))
            .unwrap();
        let ready = handle.stdout().read_chunk(64).await.unwrap().unwrap();
        assert_eq!(ready, b"ready\n");

        let started = Instant::now();
        handle.close();
        let status = handle.wait().await.unwrap();
        assert_eq!(status.signal, Some(9));
        assert!(started.elapsed() >= host.config().kill_grace);
    })
    .await;
}

#[tokio::test]
async fn host_drop_closes_forgotten_processes() {
    within(async {
        let (pid, handle) = {
            let host = host();
            let group = host.new_group();
            let handle = group.spawn(&ProcessSpec::new("sleep").arg("30")).unwrap();
            std::mem::forget(group);
            (handle.pid(), handle)
        };
        assert!(handle.is_closed());
        assert_eq!(handle.wait().await.unwrap().signal, Some(15));
        wait_until_gone(pid).await;
    })
    .await;
}

#[tokio::test]
async fn listing_reports_exit() {
    within(async {
        let host = host();
        let handle = host.group().spawn(&ProcessSpec::new("true")).unwrap();
        handle.wait().await.unwrap();
        let info = handle.info();
        assert!(matches!(info.state, ProcessState::Exited { status } if status.success()));
    })
    .await;
}
