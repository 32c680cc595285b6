//! Test Harness - loopback client/server pairs for protocol scenarios

use std::sync::{Arc, Once};

use rpma_aof_engine::{
    compute_budget, server_budget, AccessFlags, AofError, ClientConfig, ClientEngine, Connection,
    EngineConfig, FlushRequest, FlushResponse, FlushStatus, LocalRegion, LoopbackConfig,
    LoopbackEndpoint, LoopbackFabric, Message, RecordingPmem, RemoteCapacity, ServerConfig,
    ServerEngine, ServerWorkspace, WrOpcode, MAX_MSG_SIZE,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("engine error: {0}")]
    Engine(#[from] AofError),
    #[error("server task failed: {0}")]
    ServerTask(String),
    #[error("unexpected message from client: {0:?}")]
    UnexpectedMessage(Message),
}

static TRACING: Once = Once::new();

/// Route engine logs to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    });
}

/// A small configuration whose limits are easy to hit from a test.
pub fn small_config(msg_num: u32, durability_msg_count: u32) -> EngineConfig {
    EngineConfig {
        client: ClientConfig {
            msg_num,
            max_outstanding_writes: durability_msg_count.max(msg_num) * 2,
            durability_msg_count,
            data_region_size: 64 * 1024,
            response_timeout_ms: 2000,
            ..ClientConfig::default()
        },
        server: ServerConfig {
            max_msg_num: durability_msg_count,
            workspace_size: 1 << 20,
            busy_wait_polling: false,
        },
        ..EngineConfig::default()
    }
}

type Serving = JoinHandle<(ServerEngine, Result<(), AofError>)>;

/// A client connected to a server engine running `serve` on a spawned task.
pub struct ServedPair {
    pub client: ClientEngine,
    pub client_end: LoopbackEndpoint,
    pub server_end: LoopbackEndpoint,
    pub pmem: Arc<RecordingPmem>,
    shutdown: watch::Sender<bool>,
    serving: Serving,
}

impl ServedPair {
    /// Start both engines. Must be called inside a Tokio runtime.
    pub fn start(config: &EngineConfig) -> Result<Self, HarnessError> {
        init_tracing();
        let (client_end, server_end) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(
                config.client.max_outstanding_writes,
                config.client.durability_msg_count,
            ),
            ServerEngine::budget_for(&config.server),
        );
        let pmem = Arc::new(RecordingPmem::new());
        let mut server = ServerEngine::new(
            Arc::new(server_end.clone()),
            pmem.clone(),
            config.server.clone(),
        )?;
        let workspace = server.workspace();
        let (shutdown, rx) = watch::channel(false);
        let serving = tokio::spawn(async move {
            let served = server.serve(rx).await;
            (server, served)
        });
        let client = ClientEngine::connect(
            Arc::new(client_end.clone()),
            workspace,
            config.client.clone(),
        )?;
        debug!(
            durability = config.client.durability_msg_count,
            max_msg_num = config.server.max_msg_num,
            "served pair started"
        );
        Ok(Self {
            client,
            client_end,
            server_end,
            pmem,
            shutdown,
            serving,
        })
    }

    /// Stop serving and hand back both engines.
    pub async fn stop(self) -> Result<(ClientEngine, ServerEngine), HarnessError> {
        let _ = self.shutdown.send(true);
        let (server, served) = self
            .serving
            .await
            .map_err(|e| HarnessError::ServerTask(e.to_string()))?;
        served?;
        Ok((self.client, server))
    }
}

/// Hand-driven server side: nothing is answered until the test says so.
pub struct ManualPeer {
    pub endpoint: LoopbackEndpoint,
    pub workspace: LocalRegion,
    msgs: LocalRegion,
    capacity: u32,
}

impl ManualPeer {
    /// Connect `config` to a manual peer advertising `capacity` durability slots.
    pub fn connect(
        config: ClientConfig,
        capacity: u32,
    ) -> Result<(ClientEngine, LoopbackEndpoint, ManualPeer), HarnessError> {
        init_tracing();
        let (a, b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(config.max_outstanding_writes, config.durability_msg_count),
            server_budget(RemoteCapacity(capacity)),
        );
        let workspace = b.register_region(
            1 << 20,
            AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
        )?;
        let msgs = b.register_region(
            (u64::from(capacity) + 1) * MAX_MSG_SIZE as u64,
            AccessFlags::MESSAGING,
        )?;
        let peer = ManualPeer {
            endpoint: b,
            workspace,
            msgs,
            capacity,
        };
        for slot in 0..capacity {
            peer.post_receive(u64::from(slot))?;
        }
        let descriptor = ServerWorkspace {
            region: peer.workspace.remote(),
            max_msg_num: RemoteCapacity(capacity),
            size: peer.workspace.len,
        };
        let client = ClientEngine::connect(Arc::new(a.clone()), descriptor, config)?;
        Ok((client, a, peer))
    }

    fn post_receive(&self, slot: u64) -> Result<(), HarnessError> {
        self.endpoint
            .post_receive(slot, &self.msgs, slot * MAX_MSG_SIZE as u64, MAX_MSG_SIZE as u64)?;
        Ok(())
    }

    /// Reap arrived flush requests, re-arming each receive.
    pub fn take_requests(&self) -> Result<Vec<FlushRequest>, HarnessError> {
        let mut requests = Vec::new();
        for ev in self.endpoint.poll_completions(usize::MAX)? {
            if ev.opcode != WrOpcode::Recv || !ev.status.is_success() {
                continue;
            }
            let bytes = self.endpoint.read_region(
                &self.msgs,
                ev.wr_id * MAX_MSG_SIZE as u64,
                u64::from(ev.byte_len),
            )?;
            self.post_receive(ev.wr_id)?;
            match Message::decode(&bytes)? {
                Message::FlushRequest(req) => requests.push(req),
                other => return Err(HarnessError::UnexpectedMessage(other)),
            }
        }
        Ok(requests)
    }

    /// Send a response for `correlation_id`, whether or not it was asked for.
    pub fn respond(&self, correlation_id: u64, status: FlushStatus) -> Result<(), HarnessError> {
        let bytes = Message::FlushResponse(FlushResponse {
            correlation_id,
            status,
        })
        .encode()?;
        let offset = u64::from(self.capacity) * MAX_MSG_SIZE as u64;
        self.endpoint.write_region(&self.msgs, offset, &bytes)?;
        self.endpoint
            .post_send(u64::MAX, &self.msgs, offset, bytes.len() as u64)?;
        Ok(())
    }

    /// Answer every pending request with `status`; returns the ids answered.
    pub fn answer_all(&self, status: FlushStatus) -> Result<Vec<u64>, HarnessError> {
        let mut ids = Vec::new();
        for req in self.take_requests()? {
            self.respond(req.correlation_id, status)?;
            ids.push(req.correlation_id);
        }
        Ok(ids)
    }

    /// Bytes the client has written into the workspace.
    pub fn workspace_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>, HarnessError> {
        Ok(self.endpoint.read_region(&self.workspace, offset, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpma_aof_engine::{IoUnit, QueueStatus};
    use std::time::Duration;

    #[test]
    fn test_small_config_is_valid() {
        let config = small_config(4, 4);
        assert!(config.validate().is_ok());
        assert_eq!(config.server.max_msg_num, 4);
        assert_eq!(config.client.max_outstanding_writes, 8);
    }

    #[test]
    fn test_manual_peer_sees_requests() {
        let (mut client, _end, peer) = ManualPeer::connect(small_config(4, 4).client, 4).unwrap();
        assert!(matches!(
            client.queue(IoUnit::durable(1, 0, 16)).unwrap(),
            QueueStatus::Queued(_)
        ));
        client.commit().unwrap();
        let requests = peer.take_requests().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].offset, 0);
        assert_eq!(requests[0].len, 16);
        assert_eq!(peer.endpoint.posted_receives(), 4);
    }

    #[tokio::test]
    async fn test_served_pair_round_trip() {
        let mut pair = ServedPair::start(&small_config(2, 2)).unwrap();
        pair.client.queue(IoUnit::durable(7, 512, 8)).unwrap();
        pair.client.commit().unwrap();
        let n = pair
            .client
            .get_events(1, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(pair.pmem.flushed_ranges(), vec![(512, 8)]);
        let (mut client, mut server) = pair.stop().await.unwrap();
        client.cleanup().unwrap();
        server.cleanup().unwrap();
    }
}
