//! Concurrency, cancellation, and backpressure behavior: exchanges never
//! cross-talk, canceled exchanges leave the connection and the server pool
//! healthy, and pool exhaustion surfaces as a busy rejection rather than a
//! failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use common::{start_pair, TestMember};
use raftwire::{
    with_deadline, MemberResponse, MemoryNetworkProvider, RaftClient, TransportConfig,
    TransportError,
};

fn token() -> CancellationToken {
    CancellationToken::new()
}

async fn wait_for_pool_drain(server: &raftwire::RaftServer) {
    for _ in 0..200 {
        if server.exchange_pool().available() == server.exchange_pool().capacity() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "pool never drained: {}/{} available",
        server.exchange_pool().available(),
        server.exchange_pool().capacity()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hundred_concurrent_votes_one_connection() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(7));
    let (server, client) = start_pair(
        &net,
        "vote-storm",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for i in 0..100i64 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.vote(5, i, 4, &token()).await
        }));
    }

    for handle in handles {
        let response = handle.await.expect("join").expect("vote");
        assert_eq!(response, MemberResponse::new(7, true));
    }
    assert_eq!(client.metrics().exchanges_completed(), 100);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_votes_across_connections() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(7));
    let server = raftwire::RaftServer::bind(
        &net,
        "vote-fanout",
        Arc::clone(&member) as Arc<dyn raftwire::LocalMember>,
        TransportConfig::default(),
    )
    .await
    .expect("bind");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let net = net.clone();
        handles.push(tokio::spawn(async move {
            let client = RaftClient::connect(&net, "vote-fanout", TransportConfig::default())
                .await
                .expect("connect");
            for i in 0..10i64 {
                let response = client.vote(5, i, 4, &token()).await.expect("vote");
                assert_eq!(response, MemberResponse::new(7, true));
            }
            client.close().await;
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(server.metrics().exchanges_completed(), 100);
    wait_for_pool_drain(&server).await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_faults_caller_and_releases_pool() {
    let net = MemoryNetworkProvider::new();
    let gate = Arc::new(Semaphore::new(0));
    let member = Arc::new(TestMember::new(7).with_gate(Arc::clone(&gate)));
    let (server, client) = start_pair(
        &net,
        "cancel-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    // The member stalls, so the response cannot arrive before the token
    // fires; the caller must observe the cancellation within bounded time.
    let cancel = token();
    let cancel_handle = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_handle.cancel();
    });

    let result = client.vote(5, 1, 1, &cancel).await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert_eq!(client.metrics().exchanges_faulted(), 1);

    // Let the server finish: it completes its processing and response write
    // regardless of the client's cancellation, and the handler returns to
    // the pool.
    gate.add_permits(1);
    wait_for_pool_drain(&server).await;

    // The stale response is drained before the next exchange, which then
    // proceeds normally on the same connection.
    gate.add_permits(1);
    let response = client.vote(6, 2, 2, &token()).await.expect("second vote");
    assert_eq!(response, MemberResponse::new(7, true));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_surfaces_distinct_error() {
    let net = MemoryNetworkProvider::new();
    let gate = Arc::new(Semaphore::new(0));
    let member = Arc::new(TestMember::new(7).with_gate(Arc::clone(&gate)));
    let (server, client) = start_pair(
        &net,
        "timeout-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let client_ref = &client;
    let result = with_deadline(Duration::from_millis(50), |cancel| async move {
        client_ref.vote(5, 1, 1, &cancel).await
    })
    .await;
    assert!(matches!(result, Err(TransportError::Timeout)));

    gate.add_permits(1);
    wait_for_pool_drain(&server).await;

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_exhaustion_rejects_with_busy() {
    let net = MemoryNetworkProvider::new();
    let gate = Arc::new(Semaphore::new(0));
    let member = Arc::new(TestMember::new(7).with_gate(Arc::clone(&gate)));
    let config = TransportConfig::default().with_pool_capacity(1);
    let (server, client_a) = start_pair(&net, "busy-node", Arc::clone(&member), config.clone()).await;
    let client_b = RaftClient::connect(&net, "busy-node", config)
        .await
        .expect("second client");

    // First request claims the only handler and stalls in the member.
    let client_a = Arc::new(client_a);
    let first = {
        let client_a = Arc::clone(&client_a);
        tokio::spawn(async move { client_a.vote(5, 1, 1, &token()).await })
    };

    // Give the first request time to claim the handler.
    for _ in 0..200 {
        if server.exchange_pool().available() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.exchange_pool().available(), 0);

    // Second connection finds the pool empty: busy rejection, not a crash.
    let result = client_b.vote(5, 2, 2, &token()).await;
    assert!(matches!(result, Err(TransportError::Busy)));
    assert_eq!(server.metrics().pool_rejections(), 1);

    // Releasing the member lets the first request complete normally.
    gate.add_permits(1);
    let response = first.await.expect("join").expect("first vote");
    assert_eq!(response, MemberResponse::new(7, true));

    wait_for_pool_drain(&server).await;
    client_b.close().await;
    client_a.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_member_fault_surfaces_to_caller() {
    let net = MemoryNetworkProvider::new();
    let member = Arc::new(TestMember::new(7).failing_votes());
    let (server, client) = start_pair(
        &net,
        "fault-node",
        Arc::clone(&member),
        TransportConfig::default(),
    )
    .await;

    let result = client.vote(5, 1, 1, &token()).await;
    assert!(matches!(result, Err(TransportError::RemoteFault)));
    assert_eq!(server.metrics().exchanges_faulted(), 1);

    // The connection survives a member fault; a healthy RPC still works.
    let resigned = client.resign(&token()).await.expect("resign");
    assert!(resigned);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_cross_talk_between_interleaved_results() {
    // Two members with different terms behind two servers; a client per
    // server issues votes concurrently and each answer must carry its own
    // server's term.
    let net = MemoryNetworkProvider::new();
    let member_a = Arc::new(TestMember::new(100));
    let member_b = Arc::new(TestMember::new(200));
    let (server_a, client_a) = start_pair(
        &net,
        "node-a",
        Arc::clone(&member_a),
        TransportConfig::default(),
    )
    .await;
    let (server_b, client_b) = start_pair(
        &net,
        "node-b",
        Arc::clone(&member_b),
        TransportConfig::default(),
    )
    .await;

    let client_a = Arc::new(client_a);
    let client_b = Arc::new(client_b);
    let mut handles = Vec::new();
    for i in 0..20i64 {
        let a = Arc::clone(&client_a);
        let b = Arc::clone(&client_b);
        handles.push(tokio::spawn(async move {
            let ra = a.vote(1, i, 1, &token()).await.expect("vote a");
            let rb = b.vote(1, i, 1, &token()).await.expect("vote b");
            (ra, rb)
        }));
    }
    for handle in handles {
        let (ra, rb) = handle.await.expect("join");
        assert_eq!(ra.term, 100);
        assert_eq!(rb.term, 200);
    }

    client_a.close().await;
    client_b.close().await;
    server_a.shutdown().await;
    server_b.shutdown().await;
}
