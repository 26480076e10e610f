//! WhisperClient against mock nodes: error classes, key exchange, filters.

use std::time::Duration;

use serde_json::json;
use whisper_client::ErrorKind;
use whisper_probe::scenario::exchange_key;
use whisper_probe::Peer;
use whisper_protocol::{Envelope, FilterId, ReceivedMessage, SymKeyId, Topic};

use crate::harness::{client, closed_port_endpoint, running_mock, stop, MockRelay};

fn envelope() -> Envelope {
    let topic: Topic = "0xe00123a5".parse().unwrap();
    Envelope::new(topic, b"hello from node-a".to_vec())
}

/// Poll until something arrives, or give up after `timeout`.
async fn poll_until_some(
    c: &whisper_client::WhisperClient,
    filter: &FilterId,
    timeout: Duration,
) -> Vec<ReceivedMessage> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let messages = c.poll_filter(filter).await.unwrap();
        if !messages.is_empty() || tokio::time::Instant::now() > deadline {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_version_answers() {
    let relay = MockRelay::new();
    let mut node = running_mock("node-a", &relay).await;
    let version = client(node.endpoint()).version().await.unwrap();
    assert_eq!(version, "6.0");
    stop(&mut node).await;
}

/// Unknown handle -> node answers with a JSON-RPC error object.
#[tokio::test]
async fn test_unknown_key_is_rpc_error() {
    let relay = MockRelay::new();
    let mut node = running_mock("node-a", &relay).await;
    let c = client(node.endpoint());

    let err = c
        .fetch_sym_key(&SymKeyId("no-such-key".into()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rpc);
    assert_eq!(err.rpc_code(), Some(-32000));

    let err = c
        .post_message(&SymKeyId("no-such-key".into()), &envelope())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rpc);

    let err = c.call_raw("shh_bogus", json!([])).await.unwrap_err();
    assert_eq!(err.rpc_code(), Some(-32601));

    stop(&mut node).await;
}

#[tokio::test]
async fn test_unreachable_node_is_transport_error() {
    let c = client(&closed_port_endpoint());
    let err = c.create_sym_key().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_non_rpc_body_is_decode_error() {
    let relay = MockRelay::new();
    let mut node = running_mock("node-a", &relay).await;
    let c = client(&format!("{}/garbage", node.endpoint()));

    let err = c.version().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);

    stop(&mut node).await;
}

/// Same material on both nodes, under different local handles.
#[tokio::test]
async fn test_key_exchange_between_nodes() {
    let relay = MockRelay::new();
    let mut a = running_mock("node-a", &relay).await;
    let mut b = running_mock("node-b", &relay).await;
    let (ca, cb) = (client(a.endpoint()), client(b.endpoint()));

    let keys = exchange_key(&ca, &cb).await.unwrap();
    assert_ne!(keys.sender_key, keys.receiver_key);

    let on_a = ca.fetch_sym_key(&keys.sender_key).await.unwrap();
    let on_b = cb.fetch_sym_key(&keys.receiver_key).await.unwrap();
    assert_eq!(on_a, on_b);
    assert!(!on_a.as_bytes().is_empty());

    // Handles are local to the node that issued them.
    let err = cb.fetch_sym_key(&keys.sender_key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rpc);

    stop(&mut a).await;
    stop(&mut b).await;
}

#[tokio::test]
async fn test_poll_delivers_at_most_once() {
    let relay = MockRelay::new();
    let mut a = running_mock("node-a", &relay).await;
    let mut b = running_mock("node-b", &relay).await;
    let (ca, cb) = (client(a.endpoint()), client(b.endpoint()));
    let keys = exchange_key(&ca, &cb).await.unwrap();
    let env = envelope();

    let filter = cb
        .register_filter(&keys.receiver_key, &[env.topic])
        .await
        .unwrap();
    assert!(cb.poll_filter(&filter).await.unwrap().is_empty());

    let ack = ca.post_message(&keys.sender_key, &env).await.unwrap();
    assert!(ack.accepted());

    let first = poll_until_some(&cb, &filter, Duration::from_secs(2)).await;
    assert_eq!(first.len(), 1);
    assert!(first[0].matches(&env));

    let second = cb.poll_filter(&filter).await.unwrap();
    assert!(second.is_empty(), "message returned twice: {second:?}");

    stop(&mut a).await;
    stop(&mut b).await;
}

/// A filter only sees messages posted after it was installed.
#[tokio::test]
async fn test_filter_misses_messages_posted_before_it() {
    let relay = MockRelay::new();
    let mut a = running_mock("node-a", &relay).await;
    let mut b = running_mock("node-b", &relay).await;
    let (ca, cb) = (client(a.endpoint()), client(b.endpoint()));
    let keys = exchange_key(&ca, &cb).await.unwrap();

    let early = envelope();
    ca.post_message(&keys.sender_key, &early).await.unwrap();

    let filter = cb
        .register_filter(&keys.receiver_key, &[early.topic])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cb.poll_filter(&filter).await.unwrap().is_empty());

    let late = Envelope::new(early.topic, b"posted after the filter".to_vec());
    ca.post_message(&keys.sender_key, &late).await.unwrap();

    let got = poll_until_some(&cb, &filter, Duration::from_secs(2)).await;
    assert_eq!(got.len(), 1);
    assert!(got[0].matches(&late));
    assert!(!got[0].matches(&early));

    stop(&mut a).await;
    stop(&mut b).await;
}

#[tokio::test]
async fn test_other_topic_not_delivered() {
    let relay = MockRelay::new();
    let mut a = running_mock("node-a", &relay).await;
    let mut b = running_mock("node-b", &relay).await;
    let (ca, cb) = (client(a.endpoint()), client(b.endpoint()));
    let keys = exchange_key(&ca, &cb).await.unwrap();

    let filter = cb
        .register_filter(&keys.receiver_key, &[envelope().topic])
        .await
        .unwrap();
    let elsewhere = Envelope::new("0x01020304".parse().unwrap(), b"not for you".to_vec());
    ca.post_message(&keys.sender_key, &elsewhere).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cb.poll_filter(&filter).await.unwrap().is_empty());

    stop(&mut a).await;
    stop(&mut b).await;
}
