//! Shared fixtures for the end-to-end tests: a scriptable local member and
//! helpers for wiring client/server pairs over in-memory networking.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use raftwire::{
    EntryProducer, LocalMember, MemberError, MemberResponse, MemoryNetworkProvider, RaftClient,
    RaftServer, ReceivedEntry, TransportConfig,
};

/// How the test member consumes the entries a replication request offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEntriesBehavior {
    ReceiveAll,
    ReceiveFirst,
    DropAll,
    DropFirst,
}

/// Arguments of a recorded `receive_entries` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendCall {
    pub term: i64,
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub commit_index: i64,
    pub offered: usize,
}

/// Arguments of a recorded `receive_snapshot` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCall {
    pub term: i64,
    pub snapshot_index: i64,
}

/// A local member with scriptable answers that records everything the
/// transport relays to it.
pub struct TestMember {
    pub term: i64,
    pub success: bool,
    pub resigns: bool,
    pub fail_votes: bool,
    pub behavior: ReceiveEntriesBehavior,
    pub metadata_map: HashMap<String, String>,
    pub gate: Option<Arc<Semaphore>>,
    pub recorded: Mutex<Vec<ReceivedEntry>>,
    pub append_calls: Mutex<Vec<AppendCall>>,
    pub snapshot_calls: Mutex<Vec<SnapshotCall>>,
}

impl TestMember {
    pub fn new(term: i64) -> Self {
        let mut metadata_map = HashMap::new();
        metadata_map.insert("node".to_string(), "test-member".to_string());
        Self {
            term,
            success: true,
            resigns: true,
            fail_votes: false,
            behavior: ReceiveEntriesBehavior::ReceiveAll,
            metadata_map,
            gate: None,
            recorded: Mutex::new(Vec::new()),
            append_calls: Mutex::new(Vec::new()),
            snapshot_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: ReceiveEntriesBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_metadata(mut self, map: HashMap<String, String>) -> Self {
        self.metadata_map = map;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_votes(mut self) -> Self {
        self.fail_votes = true;
        self
    }

    pub fn recorded_entries(&self) -> Vec<ReceivedEntry> {
        self.recorded.lock().expect("recorded lock").clone()
    }

    pub fn append_calls(&self) -> Vec<AppendCall> {
        self.append_calls.lock().expect("append lock").clone()
    }

    pub fn snapshot_calls(&self) -> Vec<SnapshotCall> {
        self.snapshot_calls.lock().expect("snapshot lock").clone()
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
    }
}

#[async_trait]
impl LocalMember for TestMember {
    async fn receive_vote(
        &self,
        _sender: &str,
        _term: i64,
        _last_log_index: i64,
        _last_log_term: i64,
    ) -> Result<MemberResponse, MemberError> {
        self.wait_gate().await;
        if self.fail_votes {
            return Err(MemberError::LogStore("vote persistence failed".to_string()));
        }
        Ok(MemberResponse::new(self.term, self.success))
    }

    async fn receive_entries(
        &self,
        _sender: &str,
        term: i64,
        mut entries: EntryProducer,
        prev_log_index: i64,
        prev_log_term: i64,
        commit_index: i64,
    ) -> Result<MemberResponse, MemberError> {
        self.wait_gate().await;
        self.append_calls.lock().expect("append lock").push(AppendCall {
            term,
            prev_log_index,
            prev_log_term,
            commit_index,
            offered: entries.remaining(),
        });

        let mut recorded = self.recorded.lock().expect("recorded lock");
        match self.behavior {
            ReceiveEntriesBehavior::ReceiveAll => recorded.extend(entries),
            ReceiveEntriesBehavior::ReceiveFirst => {
                if let Some(entry) = entries.next() {
                    recorded.push(entry);
                }
            }
            ReceiveEntriesBehavior::DropAll => {}
            ReceiveEntriesBehavior::DropFirst => {
                let _ = entries.next();
                recorded.extend(entries);
            }
        }
        Ok(MemberResponse::new(self.term, self.success))
    }

    async fn receive_snapshot(
        &self,
        _sender: &str,
        term: i64,
        snapshot: ReceivedEntry,
        snapshot_index: i64,
    ) -> Result<MemberResponse, MemberError> {
        self.wait_gate().await;
        self.snapshot_calls
            .lock()
            .expect("snapshot lock")
            .push(SnapshotCall {
                term,
                snapshot_index,
            });
        self.recorded.lock().expect("recorded lock").push(snapshot);
        Ok(MemberResponse::new(self.term, self.success))
    }

    async fn resign(&self) -> Result<bool, MemberError> {
        self.wait_gate().await;
        Ok(self.resigns)
    }

    async fn metadata(&self) -> Result<HashMap<String, String>, MemberError> {
        self.wait_gate().await;
        Ok(self.metadata_map.clone())
    }
}

/// Bind a server for `member` and connect one client to it.
pub async fn start_pair(
    net: &MemoryNetworkProvider,
    address: &str,
    member: Arc<TestMember>,
    config: TransportConfig,
) -> (RaftServer, RaftClient) {
    let server = RaftServer::bind(net, address, member, config.clone())
        .await
        .expect("server bind");
    let client = RaftClient::connect(net, address, config)
        .await
        .expect("client connect");
    (server, client)
}

/// Random content of `len` bytes for chunking tests.
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}
