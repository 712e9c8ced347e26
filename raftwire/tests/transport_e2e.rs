//! End-to-end tests driving client and server transports over in-memory
//! networking: every RPC kind round-trips, streamed payloads survive
//! chunking bit-exactly, and the member's consumption policy decides which
//! entries stick.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{start_pair, random_bytes, ReceiveEntriesBehavior, TestMember};
use raftwire::{Entry, MemberResponse, MemoryNetworkProvider, TransportConfig};

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_vote_roundtrip() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(7));
    let (server, client) = start_pair(
        &net,
        "vote-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let response = client.vote(5, 12, 4, &token()).await.expect("vote");
    assert_eq!(response, MemberResponse::new(7, true));

    assert_eq!(client.metrics().exchanges_completed(), 1);
    assert_eq!(client.metrics().exchanges_faulted(), 0);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_reaches_member_with_commit_index() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(9));
    let (server, client) = start_pair(
        &net,
        "hb-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let response = client.heartbeat(9, 33, 8, 30, &token()).await.expect("heartbeat");
    assert_eq!(response, MemberResponse::new(9, true));

    let calls = member.append_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].term, 9);
    assert_eq!(calls[0].prev_log_index, 33);
    assert_eq!(calls[0].prev_log_term, 8);
    assert_eq!(calls[0].commit_index, 30);
    assert_eq!(calls[0].offered, 0);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_resign_roundtrip() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(1));
    let (server, client) = start_pair(
        &net,
        "resign-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    assert!(client.resign(&token()).await.expect("resign"));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_resign_denied() {
    let net = MemoryNetworkProvider::new();
    let mut member = TestMember::new(1);
    member.resigns = false;
    let (server, client) = start_pair(
        &net,
        "resign-denied",
        Arc::new(member),
        TransportConfig::default(),
    )
    .await;

    assert!(!client.resign(&token()).await.expect("resign"));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_metadata_roundtrip() {
    let net = MemoryNetworkProvider::new();
    let mut map = HashMap::new();
    map.insert("node".to_string(), "raft-2".to_string());
    map.insert("zone".to_string(), "eu-central".to_string());
    let member = Arc::new(TestMember::new(1).with_metadata(map.clone()));
    let (server, client) = start_pair(
        &net,
        "meta-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let fetched = client.metadata(&token()).await.expect("metadata");
    assert_eq!(fetched, map);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_metadata_chunked_across_packets() {
    let net = MemoryNetworkProvider::new();
    let mut map = HashMap::new();
    for i in 0..16 {
        map.insert(
            format!("key-{i}"),
            String::from_utf8(vec![b'a' + (i as u8 % 26); 200]).expect("ascii"),
        );
    }
    let member = Arc::new(TestMember::new(1).with_metadata(map.clone()));
    // Small buffers force the response map across many packets.
    let config = TransportConfig::default().with_buffer_capacity(128);
    let (server, client) = start_pair(&net, "meta-big", Arc::clone(&member), config).await;

    let fetched = client.metadata(&token()).await.expect("metadata");
    assert_eq!(fetched, map);
    assert!(client.metrics().packets_received() > 10);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_append_entries_empty_batch() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(3));
    let (server, client) = start_pair(
        &net,
        "append-empty",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let response = client
        .append_entries(3, Vec::new(), 4, 2, 4, &token())
        .await
        .expect("append");
    assert_eq!(response, MemberResponse::new(3, true));
    assert_eq!(member.append_calls()[0].offered, 0);

    client.close().await;
    server.shutdown().await;
}

/// The worked example: term 42, prevLogIndex 1, prevLogTerm 56, commitIndex
/// 10, two entries with terms 10 and 11, the second flagged as a snapshot;
/// the server receives all and answers {term: 43, success: true}.
#[tokio::test]
async fn test_append_entries_two_entries_received_exactly() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(43));
    let (server, client) = start_pair(
        &net,
        "append-two",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let first_content = b"first entry content".to_vec();
    let second_content = random_bytes(100);
    let entries = vec![
        Entry::new(10, 1_700_000_000_001, false, first_content.clone()),
        Entry::new(11, 1_700_000_000_002, true, second_content.clone()),
    ];

    let response = client
        .append_entries(42, entries, 1, 56, 10, &token())
        .await
        .expect("append");
    assert_eq!(response, MemberResponse::new(43, true));

    let calls = member.append_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].term, 42);
    assert_eq!(calls[0].prev_log_index, 1);
    assert_eq!(calls[0].prev_log_term, 56);
    assert_eq!(calls[0].commit_index, 10);
    assert_eq!(calls[0].offered, 2);

    let recorded = member.recorded_entries();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].term, 10);
    assert_eq!(recorded[0].timestamp, 1_700_000_000_001);
    assert!(!recorded[0].is_snapshot);
    assert_eq!(recorded[0].content, first_content);
    assert_eq!(recorded[1].term, 11);
    assert_eq!(recorded[1].timestamp, 1_700_000_000_002);
    assert!(recorded[1].is_snapshot);
    assert_eq!(recorded[1].content, second_content);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_append_entries_multi_chunk_contents() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(5));
    // 128-byte buffers leave ~97 bytes of entry content per packet, so both
    // entries span several continuation packets.
    let config = TransportConfig::default().with_buffer_capacity(128);
    let (server, client) = start_pair(&net, "append-chunked", Arc::clone(&member), config).await;

    let small = random_bytes(500);
    let large = random_bytes(1000);
    let entries = vec![
        Entry::new(4, 100, false, small.clone()),
        Entry::new(5, 101, false, large.clone()),
    ];

    let response = client
        .append_entries(5, entries, 9, 4, 9, &token())
        .await
        .expect("append");
    assert_eq!(response, MemberResponse::new(5, true));

    let recorded = member.recorded_entries();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].content, small);
    assert_eq!(recorded[1].content, large);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_append_entries_consumption_behaviors() {
    for (behavior, expected_terms) in [
        (ReceiveEntriesBehavior::ReceiveAll, vec![1, 2, 3]),
        (ReceiveEntriesBehavior::ReceiveFirst, vec![1]),
        (ReceiveEntriesBehavior::DropAll, vec![]),
        (ReceiveEntriesBehavior::DropFirst, vec![2, 3]),
    ] {
        let net = MemoryNetworkProvider::new();
        let member = Arc::new(TestMember::new(6).with_behavior(behavior));
        let (server, client) = start_pair(
            &net,
            "append-behavior",
            Arc::clone(&member),
            TransportConfig::default(),
        )
        .await;

        let entries = vec![
            Entry::new(1, 10, false, b"one".to_vec()),
            Entry::new(2, 11, false, b"two".to_vec()),
            Entry::new(3, 12, false, b"three".to_vec()),
        ];
        let response = client
            .append_entries(6, entries, 0, 0, 0, &token())
            .await
            .expect("append");
        // Consuming a prefix is the member's choice; the protocol still
        // answers normally.
        assert_eq!(response, MemberResponse::new(6, true));

        let terms: Vec<i64> = member.recorded_entries().iter().map(|e| e.term).collect();
        assert_eq!(terms, expected_terms, "behavior {behavior:?}");

        client.close().await;
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_install_snapshot_single_chunk() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(12));
    let (server, client) = start_pair(
        &net,
        "snap-small",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let content = random_bytes(64);
    let snapshot = Entry::new(12, 900, true, content.clone());
    let response = client
        .install_snapshot(12, snapshot, 77, &token())
        .await
        .expect("snapshot");
    assert_eq!(response, MemberResponse::new(12, true));

    let calls = member.snapshot_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].term, 12);
    assert_eq!(calls[0].snapshot_index, 77);

    let recorded = member.recorded_entries();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].term, 12);
    assert_eq!(recorded[0].timestamp, 900);
    assert!(recorded[0].is_snapshot);
    assert_eq!(recorded[0].content, content);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_install_snapshot_multi_chunk() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(12));
    let config = TransportConfig::default().with_buffer_capacity(256);
    let (server, client) = start_pair(&net, "snap-big", Arc::clone(&member), config).await;

    let content = random_bytes(5000);
    let snapshot = Entry::new(12, 901, true, content.clone());
    let response = client
        .install_snapshot(12, snapshot, 123, &token())
        .await
        .expect("snapshot");
    assert_eq!(response, MemberResponse::new(12, true));

    let recorded = member.recorded_entries();
    assert_eq!(recorded[0].content, content);
    assert!(client.metrics().packets_sent() > 10);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_streaming_entry_with_unknown_length() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(8));
    let config = TransportConfig::default().with_buffer_capacity(128);
    let (server, client) = start_pair(&net, "append-stream", Arc::clone(&member), config).await;

    let content = random_bytes(700);
    let reader = Box::new(std::io::Cursor::new(content.clone()));
    let entries = vec![Entry::streaming(8, 55, false, None, reader)];

    let response = client
        .append_entries(8, entries, 0, 0, 0, &token())
        .await
        .expect("append");
    assert_eq!(response, MemberResponse::new(8, true));

    let recorded = member.recorded_entries();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].timestamp, 55);
    assert_eq!(recorded[0].content, content);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_sequential_mixed_exchanges_share_connection() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(2));
    let (server, client) = start_pair(
        &net,
        "mixed-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let vote = client.vote(2, 1, 1, &token()).await.expect("vote");
    assert_eq!(vote.term, 2);

    let hb = client.heartbeat(2, 1, 1, 1, &token()).await.expect("heartbeat");
    assert_eq!(hb.term, 2);

    let entries = vec![Entry::new(2, 1, false, b"mixed".to_vec())];
    let append = client
        .append_entries(2, entries, 1, 1, 1, &token())
        .await
        .expect("append");
    assert_eq!(append.term, 2);

    let map = client.metadata(&token()).await.expect("metadata");
    assert_eq!(map.get("node").map(String::as_str), Some("test-member"));

    assert_eq!(client.metrics().exchanges_completed(), 4);

    client.close().await;
    server.shutdown().await;
}
