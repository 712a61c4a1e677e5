//! End-to-end tests for process pipelines.
//!
//! These use POSIX tools only (sh, cat, seq, grep, sort, wc, pwd).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipewright_kernel::{
    Enumerable, Host, Input, PipelineError, ProcessSpec, RuntimeConfig, StderrPolicy, stderr_channel,
};

fn host() -> Host {
    Host::new(RuntimeConfig::testing())
}

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("sh").args(["-c", script])
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[tokio::test]
async fn exit_code_error() {
    let host = host();
    let err = host.exec(sh("exit 17")).run_bytes().await.unwrap_err();
    match &err {
        PipelineError::ExitCode { code, command, .. } => {
            assert_eq!(*code, 17);
            assert_eq!(command, &vec!["sh".to_string(), "-c".into(), "exit 17".into()]);
        }
        other => panic!("expected ExitCode, got {other:?}"),
    }
    assert_eq!(err.exit_code(), Some(17));
}

#[tokio::test]
async fn signal_error() {
    let host = host();
    let err = host.exec(sh("kill -9 $$")).run().await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Signal { signal: 9, .. }),
        "expected SIGKILL, got {err:?}"
    );
}

#[tokio::test]
async fn upstream_failure_surfaces_downstream() {
    let host = host();
    let upstream = host.exec(sh("echo a; echo b; exit 3")).stream();
    let mut lines = upstream.pipe(host.group(), ProcessSpec::new("cat")).text_lines();

    // The failure is seen at the next pull after it happens, so how much of
    // cat's output comes first depends on timing.
    let mut seen = Vec::new();
    let err = loop {
        match lines.next().await {
            Some(Ok(line)) => seen.push(line),
            Some(Err(e)) => break e,
            None => panic!("upstream failure was swallowed"),
        }
    };
    let seen: Vec<&str> = seen.iter().map(String::as_str).collect();
    assert!(["a", "b"].starts_with(&seen), "unexpected lines {seen:?}");
    assert!(err.is_upstream(), "expected upstream wrapper, got {err:?}");
    assert_eq!(err.root_cause().exit_code(), Some(3));
    assert!(lines.next().await.is_none());
}

#[tokio::test]
async fn upstream_failure_wins_over_own_failure() {
    let host = host();
    let err = host
        .exec(sh("exit 3"))
        .stream()
        .pipe(host.group(), sh("cat; exit 4"))
        .collect()
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert_eq!(err.root_cause().exit_code(), Some(3));
}

#[tokio::test]
async fn in_process_transform_failure_is_upstream_to_next_stage() {
    let host = host();
    let source = Enumerable::from_iterator(vec!["1".to_string(), "x".to_string()]).try_map(|s| {
        s.parse::<u32>().map(|n| format!("{n}"))
    });
    let err = source
        .pipe_lines(host.group(), ProcessSpec::new("cat"))
        .collect()
        .await
        .unwrap_err();
    assert!(err.is_upstream());
    assert!(matches!(err.root_cause(), PipelineError::Transform(_)));
}

#[tokio::test]
async fn allow_failure_returns_output() {
    let host = host();
    let out = host
        .exec(sh("echo partial; exit 2"))
        .allow_failure()
        .run_text()
        .await
        .unwrap();
    assert_eq!(out, "partial\n");
}

#[tokio::test]
async fn recover_suppresses_stage_error() {
    let host = host();
    let lines = host
        .exec(sh("echo kept; exit 1"))
        .lines()
        .recover(|e| match e.exit_code() {
            Some(1) => Ok(None),
            _ => Err(e),
        })
        .collect()
        .await
        .unwrap();
    assert_eq!(lines, vec!["kept"]);
}

// ============================================================================
// Pipelines
// ============================================================================

#[tokio::test]
async fn three_stage_pipeline() {
    let host = host();
    let count = host
        .exec(ProcessSpec::new("seq").args(["1", "20"]))
        .stream()
        .pipe(host.group(), ProcessSpec::new("grep").arg("1"))
        .pipe(host.group(), ProcessSpec::new("wc").arg("-l"))
        .text_lines()
        .collect()
        .await
        .unwrap();
    // 1, 10..19
    assert_eq!(count.len(), 1);
    assert_eq!(count[0].trim(), "11");
    assert_eq!(host.group().live_count(), 0);
}

#[tokio::test]
async fn in_process_stage_between_processes() {
    let host = host();
    let shouted = host
        .exec(ProcessSpec::new("printf").arg("b\\na\\nc\\n"))
        .lines()
        .map(|l| l.to_uppercase())
        .filter(|l| l != "C")
        .pipe_lines(host.group(), ProcessSpec::new("sort"))
        .collect()
        .await
        .unwrap();
    assert_eq!(shouted, vec!["A", "B"]);
}

#[tokio::test]
async fn large_output_crosses_chunk_boundaries() {
    let host = host();
    let total = host
        .exec(ProcessSpec::new("seq").args(["1", "50000"]))
        .lines()
        .fold(0u64, |acc, line| acc + line.parse::<u64>().unwrap_or(0))
        .await
        .unwrap();
    assert_eq!(total, 50000 * 50001 / 2);
}

#[tokio::test]
async fn stdin_variants() {
    let host = host();

    let bytes = host.exec(ProcessSpec::new("cat")).stdin(b"raw".as_slice()).run_bytes().await.unwrap();
    assert_eq!(bytes, b"raw");

    let lines = host
        .exec(ProcessSpec::new("cat"))
        .stdin(Input::Lines(vec!["x".into(), "y".into()]))
        .run_lines()
        .await
        .unwrap();
    assert_eq!(lines, vec!["x", "y"]);

    let empty = host.exec(ProcessSpec::new("cat")).stdin(Input::Null).run_bytes().await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn working_directory_and_env() {
    let host = host();
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let pwd = host
        .exec(ProcessSpec::new("pwd").cwd(dir.path()))
        .run_text()
        .await
        .unwrap();
    let actual = std::path::Path::new(pwd.trim()).canonicalize().unwrap();
    assert_eq!(actual, expected);

    let greeting = host
        .exec(sh("echo \"$GREETING\"").env("GREETING", "hello"))
        .run_text()
        .await
        .unwrap();
    assert_eq!(greeting, "hello\n");
}

#[tokio::test]
async fn path_program_from_file_url() {
    let host = host();
    let out = host
        .exec(ProcessSpec::new("file:///bin/sh").args(["-c", "echo via-path"]))
        .run_text()
        .await
        .unwrap();
    assert_eq!(out, "via-path\n");
}

// ============================================================================
// Stderr
// ============================================================================

#[tokio::test]
async fn stderr_callback_sees_lines() {
    let host = host();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    host.exec(sh("echo one >&2; echo two >&2"))
        .stderr(StderrPolicy::each(move |line| sink.lock().unwrap().push(line.to_string())))
        .run()
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
}

#[tokio::test]
async fn stderr_merged_across_stages() {
    let host = host();
    let (sink, mut rx) = stderr_channel();
    let out = host
        .exec(sh("echo first-stage >&2; echo data"))
        .stderr(StderrPolicy::Forward(sink.clone()))
        .stream()
        .pipe_into(
            host.exec(sh("cat; echo second-stage >&2"))
                .stderr(StderrPolicy::Forward(sink)),
        )
        .text_lines()
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec!["data"]);

    let mut lines = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while lines.len() < 2 {
            match rx.recv().await {
                Some(line) => lines.push(line),
                None => break,
            }
        }
    });
    deadline.await.expect("stderr lines should arrive");
    lines.sort();
    assert_eq!(lines, vec!["first-stage", "second-stage"]);
}

// ============================================================================
// Concurrency with processes
// ============================================================================

#[tokio::test]
async fn concurrent_map_over_processes_keeps_order() {
    let host = host();
    let group = Arc::new(host.new_group());
    let g = group.clone();
    let out = Enumerable::from_iterator(1..=12)
        .concurrent_map(4, move |n: u32| {
            let exec = g.exec(sh(&format!("sleep 0.0{}; echo {n}", 9 - n % 10)));
            async move { exec.run_text().await }
        })
        .map(|s| s.trim().to_string())
        .collect()
        .await
        .unwrap();
    let expected: Vec<String> = (1..=12).map(|n| n.to_string()).collect();
    assert_eq!(out, expected);
    assert_eq!(group.live_count(), 0);
}

#[tokio::test]
async fn concurrent_map_process_failure() {
    let host = host();
    let group = Arc::new(host.new_group());
    let g = group.clone();
    let err = Enumerable::from_iterator(0..6)
        .concurrent_unordered_map(3, move |n: u32| {
            let exec = g.exec(sh(&format!("exit {}", if n == 4 { 9 } else { 0 })));
            async move { exec.run().await }
        })
        .collect()
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(9));
}

#[tokio::test]
async fn tee_process_output() {
    let host = host();
    let mut branches = host
        .exec(ProcessSpec::new("seq").args(["1", "5"]))
        .lines()
        .tee(2);
    let sum = branches.pop().unwrap();
    let count = branches.pop().unwrap();

    let (sum, count) = tokio::join!(
        sum.fold(0u32, |acc, l| acc + l.parse::<u32>().unwrap_or(0)),
        count.count(),
    );
    assert_eq!(sum.unwrap(), 15);
    assert_eq!(count.unwrap(), 5);
}

#[tokio::test]
async fn cached_process_output_runs_once() {
    let host = host();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("runs");
    let script = format!("echo run >> {}; echo out", marker.display());

    let cached = host.exec(sh(&script)).lines().cache();
    assert_eq!(cached.replay().collect().await.unwrap(), vec!["out"]);
    assert_eq!(cached.replay().collect().await.unwrap(), vec!["out"]);

    let runs = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(runs.lines().count(), 1);
}
