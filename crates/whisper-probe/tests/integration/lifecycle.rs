//! Peer lifecycle: readiness, shutdown, reaping, subprocess isolation.

use std::time::Duration;

use whisper_probe::{
    Exit, InProcessPeer, LifecycleError, NodeEntry, Peer, PeerState, ReadinessProbe,
};

use crate::harness::{closed_port_endpoint, fast_probe, idle_entry, mock_peer_delayed, stop, MockRelay};

#[tokio::test]
async fn test_in_process_peer_walks_every_state() {
    let relay = MockRelay::new();
    let mut peer = mock_peer_delayed("node-a", &relay, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(peer.state(), PeerState::NotStarted);

    peer.start().await.unwrap();
    assert_eq!(peer.state(), PeerState::Starting);

    peer.wait_ready(&fast_probe()).await.unwrap();
    assert_eq!(peer.state(), PeerState::Ready);

    // Already ready: no second probe.
    assert_eq!(peer.wait_ready(&fast_probe()).await.unwrap(), Duration::ZERO);

    peer.shutdown();
    assert_eq!(peer.state(), PeerState::ShuttingDown);
    peer.shutdown();
    assert_eq!(peer.state(), PeerState::ShuttingDown);

    let t = peer.terminated().await.unwrap();
    assert!(matches!(t.exit, Exit::Returned), "exit: {:?}", t.exit);
    assert_eq!(peer.state(), PeerState::Terminated);
}

/// Readiness follows the node, not a fixed delay.
#[tokio::test]
async fn test_ready_waits_for_slow_node() {
    let relay = MockRelay::new();
    let mut peer = mock_peer_delayed("slow", &relay, Duration::from_millis(300))
        .await
        .unwrap();
    peer.start().await.unwrap();

    let waited = peer.wait_ready(&fast_probe()).await.unwrap();
    assert!(waited >= Duration::from_millis(250), "ready after {waited:?}");

    stop(&mut peer).await;
}

#[tokio::test]
async fn test_not_ready_within_deadline() {
    let mut peer = InProcessPeer::new("ghost", closed_port_endpoint(), idle_entry());
    peer.start().await.unwrap();

    let probe = ReadinessProbe {
        timeout: Duration::from_millis(300),
        ..fast_probe()
    };
    let err = peer.wait_ready(&probe).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotReady { .. }), "{err}");
    assert_eq!(peer.state(), PeerState::Starting);

    let t = stop(&mut peer).await;
    assert!(t.exit.is_clean());
}

/// An entry that gives up while starting ends the readiness wait early.
#[tokio::test]
async fn test_in_process_exit_during_startup_fails_fast() {
    let entry: NodeEntry =
        Box::new(|_stop| Box::pin(async move { Err(anyhow::anyhow!("address in use")) }));
    let mut peer = InProcessPeer::new("crashy", closed_port_endpoint(), entry);
    peer.start().await.unwrap();

    let probe = ReadinessProbe {
        timeout: Duration::from_secs(10),
        ..fast_probe()
    };
    let started = std::time::Instant::now();
    let err = peer.wait_ready(&probe).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    match err {
        LifecycleError::Exited { peer: name, status } => {
            assert_eq!(name, "crashy");
            assert!(status.contains("address in use"), "{status}");
        }
        other => panic!("unexpected error: {other}"),
    }

    let t = stop(&mut peer).await;
    assert!(matches!(t.exit, Exit::Failed(_)));
}

#[tokio::test]
async fn test_wait_ready_before_start_rejected() {
    let mut peer = InProcessPeer::new("idle", closed_port_endpoint(), idle_entry());
    let err = peer.wait_ready(&fast_probe()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition {
            from: PeerState::NotStarted,
            ..
        }
    ));
}

#[cfg(unix)]
mod subprocess {
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use whisper_probe::subprocess_task::SpawnSpec;
    use whisper_probe::{Exit, LifecycleError, Peer, PeerState, ReadinessProbe, SubprocessPeer};

    use crate::harness::{closed_port_endpoint, fast_probe, stop};

    fn spec(program: &str, args: &[&str], env: &[(&str, &str)]) -> SpawnSpec {
        SpawnSpec {
            peer: "proc".into(),
            program: PathBuf::from(program),
            args: args.iter().map(|s| s.to_string()).collect(),
            workdir: None,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_long_running_child_killed_and_reaped_once() {
        let mut peer = SubprocessPeer::new(spec("sleep", &["30"], &[]), closed_port_endpoint());
        peer.start().await.unwrap();
        assert!(peer.pid().is_some());

        let started = Instant::now();
        let t = stop(&mut peer).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        match t.exit {
            Exit::Status(status) => assert!(!status.success(), "sleep was not killed"),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert!(t.kill_error.is_none());

        assert!(matches!(
            peer.terminated().await.unwrap_err(),
            LifecycleError::InvalidTransition {
                from: PeerState::Terminated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure_once() {
        let mut peer = SubprocessPeer::new(
            spec("/nonexistent/wnode-status", &["-http=true"], &[]),
            closed_port_endpoint(),
        );
        let err = peer.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn { .. }), "{err}");

        // Readiness fails fast instead of probing a node that never ran.
        let err = peer.wait_ready(&fast_probe()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn { .. }));

        let t = stop(&mut peer).await;
        assert!(matches!(t.exit, Exit::SpawnFailed(_)));
        assert!(peer.terminated().await.is_err());
    }

    /// The secret reaches the child through its environment only.
    #[tokio::test]
    async fn test_secret_in_child_env_and_stderr_captured() {
        let script = r#"echo "pw=$ACCOUNT_PASSWORD" >&2; exec sleep 30"#;
        let mut peer = SubprocessPeer::new(
            spec("sh", &["-c", script], &[("ACCOUNT_PASSWORD", "s3cret")]),
            closed_port_endpoint(),
        );
        peer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let t = stop(&mut peer).await;
        assert!(t.stderr.iter().any(|l| l == "pw=s3cret"), "stderr: {:?}", t.stderr);
        assert!(std::env::var_os("ACCOUNT_PASSWORD").is_none());
    }

    /// A node that crashes on startup is reported with its exit status,
    /// well before the readiness budget runs out.
    #[tokio::test]
    async fn test_crash_during_startup_ends_wait_ready() {
        let mut peer = SubprocessPeer::new(
            spec("sh", &["-c", "exit 3"], &[]),
            closed_port_endpoint(),
        );
        peer.start().await.unwrap();

        let probe = ReadinessProbe {
            timeout: Duration::from_secs(10),
            ..fast_probe()
        };
        let started = Instant::now();
        let err = peer.wait_ready(&probe).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        match &err {
            LifecycleError::Exited { status, .. } => assert!(status.contains('3'), "{status}"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(peer.state(), PeerState::Starting);

        // Asking again gives the same answer without probing.
        let again = peer.wait_ready(&probe).await.unwrap_err();
        assert!(matches!(again, LifecycleError::Exited { .. }));

        let t = stop(&mut peer).await;
        match t.exit {
            Exit::Status(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_early_exit_reported_after_shutdown() {
        let mut peer = SubprocessPeer::new(
            spec("sh", &["-c", "echo bye >&2; exit 3"], &[]),
            closed_port_endpoint(),
        );
        peer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let t = stop(&mut peer).await;
        match t.exit {
            Exit::Status(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert!(t.kill_error.is_none());
        assert_eq!(t.stderr, vec!["bye".to_string()]);
    }
}
