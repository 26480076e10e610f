//! End-to-end publish/subscribe runs against mock nodes.

use std::path::PathBuf;
use std::time::Duration;

use whisper_probe::scenario::{run_pubsub, ScenarioError, ScenarioOutcome, Step};
use whisper_probe::subprocess_task::SpawnSpec;
use whisper_probe::{Exit, InProcessPeer, Peer, PeerState, SubprocessPeer};

use crate::harness::{closed_port_endpoint, fast_settings, idle_entry, mock_peer, MockRelay, PostMode};

fn assert_both_reaped(outcome: &ScenarioOutcome) {
    assert_eq!(outcome.terminations.len(), 2);
    for t in &outcome.terminations {
        let t = t.as_ref().unwrap();
        assert!(t.exit.is_clean(), "{} ended with {:?}", t.peer, t.exit);
    }
    assert!(outcome.clean_teardown());
}

#[tokio::test]
async fn test_message_delivered_end_to_end() {
    let relay = MockRelay::new().with_delay(Duration::from_millis(150));
    let mut sender = mock_peer("node-a", &relay).await.unwrap();
    let mut receiver = mock_peer("node-b", &relay).await.unwrap();
    let settings = fast_settings();

    let outcome = run_pubsub(&mut sender, &mut receiver, &settings).await;

    let report = outcome.result.as_ref().unwrap();
    assert_ne!(report.keys.sender_key, report.keys.receiver_key);
    assert_eq!(report.delivery.message.topic.to_string(), "0xe00123a5");
    assert_eq!(
        report.delivery.message.payload,
        b"sent before filter was active (symmetric)".to_vec()
    );
    assert!(report.delivery.polls >= 1);
    assert!(report.ack.accepted());
    assert_eq!(relay.relayed(), 1);

    assert!(outcome.is_success());
    assert_both_reaped(&outcome);
    assert_eq!(sender.state(), PeerState::Terminated);
    assert_eq!(receiver.state(), PeerState::Terminated);
}

#[tokio::test]
async fn test_dropped_message_not_delivered() {
    let relay = MockRelay::new().dropping();
    let mut sender = mock_peer("node-a", &relay).await.unwrap();
    let mut receiver = mock_peer("node-b", &relay).await.unwrap();
    let mut settings = fast_settings();
    settings.delivery_timeout = Duration::from_millis(500);

    let outcome = run_pubsub(&mut sender, &mut receiver, &settings).await;

    match outcome.result.as_ref().unwrap_err() {
        ScenarioError::NotDelivered { waited, polls } => {
            assert!(*waited >= Duration::from_millis(400), "gave up after {waited:?}");
            assert!(*polls >= 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_both_reaped(&outcome);
}

#[tokio::test]
async fn test_post_error_aborts_before_polling() {
    let relay = MockRelay::new().with_post_mode(PostMode::Fail);
    let mut sender = mock_peer("node-a", &relay).await.unwrap();
    let mut receiver = mock_peer("node-b", &relay).await.unwrap();

    let outcome = run_pubsub(&mut sender, &mut receiver, &fast_settings()).await;

    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.step(), Step::PostMessage);
    match err {
        ScenarioError::Client { source, .. } => assert_eq!(source.rpc_code(), Some(-32000)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(relay.relayed(), 0);
    assert_both_reaped(&outcome);
}

#[tokio::test]
async fn test_refused_post_is_not_accepted() {
    let relay = MockRelay::new().with_post_mode(PostMode::Refuse);
    let mut sender = mock_peer("node-a", &relay).await.unwrap();
    let mut receiver = mock_peer("node-b", &relay).await.unwrap();

    let outcome = run_pubsub(&mut sender, &mut receiver, &fast_settings()).await;

    match outcome.result.as_ref().unwrap_err() {
        ScenarioError::NotAccepted { peer, .. } => assert_eq!(peer, "node-a"),
        other => panic!("unexpected error: {other}"),
    }
    assert_both_reaped(&outcome);
}

#[tokio::test]
async fn test_unready_receiver_fails_at_start() {
    let relay = MockRelay::new();
    let mut sender = mock_peer("node-a", &relay).await.unwrap();
    let mut receiver = InProcessPeer::new("node-b", closed_port_endpoint(), idle_entry());
    let mut settings = fast_settings();
    settings.readiness.timeout = Duration::from_millis(300);

    let outcome = run_pubsub(&mut sender, &mut receiver, &settings).await;

    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.step(), Step::StartNodes);
    assert!(err.to_string().contains("node-b"), "{err}");
    assert_both_reaped(&outcome);
    assert_eq!(relay.relayed(), 0);
}

/// Sender spawn fails: the receiver is never started, both are still reaped.
#[tokio::test]
async fn test_spawn_failure_still_tears_down() {
    let relay = MockRelay::new();
    let mut sender = SubprocessPeer::new(
        SpawnSpec {
            peer: "node-a".into(),
            program: PathBuf::from("/nonexistent/wnode-status"),
            args: vec!["-httpport=8537".into()],
            workdir: None,
            env: Vec::new(),
        },
        closed_port_endpoint(),
    );
    let mut receiver = mock_peer("node-b", &relay).await.unwrap();

    let outcome = run_pubsub(&mut sender, &mut receiver, &fast_settings()).await;

    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.step(), Step::StartNodes);

    let exits: Vec<&Exit> = outcome
        .terminations
        .iter()
        .map(|t| &t.as_ref().unwrap().exit)
        .collect();
    assert!(matches!(exits[0], Exit::SpawnFailed(_)));
    assert!(matches!(exits[1], Exit::NotStarted));
    assert!(!outcome.clean_teardown());
}
