//! Asynchronous I/O engine interface shared by the client and server.
//!
//! A benchmark driver talks to either side through [`IoEngine`]; which one it
//! gets is decided by [`EngineConfig::engine`] when calling [`open`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::client::{ClientEngine, QueueStatus};
use crate::config::{EngineConfig, EngineKind};
use crate::error::{AofError, Result};
use crate::pmem::PersistentMemory;
use crate::server::ServerEngine;
use crate::tracker::{IoOutcome, IoUnit};
use crate::transport::Connection;
use crate::wire::ServerWorkspace;

/// The asynchronous I/O contract both engines implement.
#[async_trait]
pub trait IoEngine: Send {
    /// Registered engine name.
    fn name(&self) -> &'static str;

    /// Offer an I/O unit.
    async fn queue(&mut self, io: IoUnit) -> Result<QueueStatus>;

    /// Post everything queued.
    fn commit(&mut self) -> Result<usize>;

    /// Wait for between `min` and `max` terminal operations.
    async fn get_events(&mut self, min: usize, max: usize, timeout: Duration) -> Result<usize>;

    /// Outcome `index` of the last `get_events`.
    fn event(&self, index: usize) -> Option<&IoOutcome>;

    /// Size of the target file.
    fn file_size(&self) -> u64;

    /// Release every resource.
    fn cleanup(&mut self) -> Result<()>;
}

#[async_trait]
impl IoEngine for ClientEngine {
    fn name(&self) -> &'static str {
        EngineKind::Client.name()
    }

    async fn queue(&mut self, io: IoUnit) -> Result<QueueStatus> {
        if !self.is_sync() {
            return ClientEngine::queue(self, io);
        }
        let outcome = self.queue_sync(io).await?;
        let id = outcome.correlation_id;
        self.stash_event(outcome);
        Ok(QueueStatus::Completed(id))
    }

    fn commit(&mut self) -> Result<usize> {
        ClientEngine::commit(self)
    }

    async fn get_events(&mut self, min: usize, max: usize, timeout: Duration) -> Result<usize> {
        ClientEngine::get_events(self, min, max, timeout).await
    }

    fn event(&self, index: usize) -> Option<&IoOutcome> {
        ClientEngine::event(self, index)
    }

    fn file_size(&self) -> u64 {
        ClientEngine::file_size(self)
    }

    fn cleanup(&mut self) -> Result<()> {
        ClientEngine::cleanup(self)
    }
}

#[async_trait]
impl IoEngine for ServerEngine {
    fn name(&self) -> &'static str {
        EngineKind::Server.name()
    }

    /// The server issues no I/O of its own.
    async fn queue(&mut self, _io: IoUnit) -> Result<QueueStatus> {
        Ok(QueueStatus::Busy)
    }

    fn commit(&mut self) -> Result<usize> {
        Ok(0)
    }

    async fn get_events(&mut self, min: usize, max: usize, timeout: Duration) -> Result<usize> {
        ServerEngine::get_events(self, min, max, timeout).await
    }

    fn event(&self, index: usize) -> Option<&IoOutcome> {
        ServerEngine::event(self, index)
    }

    fn file_size(&self) -> u64 {
        ServerEngine::file_size(self)
    }

    fn cleanup(&mut self) -> Result<()> {
        ServerEngine::cleanup(self)
    }
}

/// What each side needs beyond the connection.
pub enum EngineResources {
    /// The workspace descriptor received from the server.
    Client {
        /// Server-advertised workspace.
        workspace: ServerWorkspace,
    },
    /// The persistence layer behind the workspace.
    Server {
        /// Durability primitive.
        pmem: Arc<dyn PersistentMemory>,
    },
}

/// Build the engine `config` selects.
pub fn open(
    config: &EngineConfig,
    conn: Arc<dyn Connection>,
    resources: EngineResources,
) -> Result<Box<dyn IoEngine>> {
    let engine: Box<dyn IoEngine> = match (config.engine, resources) {
        (EngineKind::Client, EngineResources::Client { workspace }) => Box::new(
            ClientEngine::connect(conn, workspace, config.client.clone())?,
        ),
        (EngineKind::Server, EngineResources::Server { pmem }) => {
            Box::new(ServerEngine::new(conn, pmem, config.server.clone())?)
        }
        (kind, _) => {
            return Err(AofError::invalid_config(format!(
                "resources do not match engine {}",
                kind.name()
            )))
        }
    };
    info!(engine = engine.name(), "engine opened");
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{compute_budget, RemoteCapacity};
    use crate::config::{ClientConfig, ServerConfig};
    use crate::error::ErrorKind;
    use crate::loopback::{LoopbackConfig, LoopbackFabric};
    use crate::pmem::RecordingPmem;
    use tokio::sync::watch;

    fn config(engine: EngineKind) -> EngineConfig {
        EngineConfig {
            engine,
            client: ClientConfig {
                msg_num: 4,
                max_outstanding_writes: 4,
                durability_msg_count: 4,
                data_region_size: 4096,
                ..ClientConfig::default()
            },
            server: ServerConfig {
                max_msg_num: 4,
                workspace_size: 4096,
                busy_wait_polling: false,
            },
        }
    }

    #[test]
    fn test_open_rejects_mismatched_resources() {
        let (a, _b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(4, 4),
            compute_budget(0, 4),
        );
        let err = open(
            &config(EngineKind::Server),
            Arc::new(a),
            EngineResources::Client {
                workspace: ServerWorkspace {
                    region: crate::transport::RemoteRegion { rkey: 0, len: 0 },
                    max_msg_num: RemoteCapacity(4),
                    size: 0,
                },
            },
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_engines_through_trait_objects() {
        let cfg = config(EngineKind::Client);
        let (a, b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(4, 4),
            ServerEngine::budget_for(&cfg.server),
        );
        let pmem = Arc::new(RecordingPmem::new());
        let mut server = ServerEngine::new(Arc::new(b), pmem.clone(), cfg.server.clone()).unwrap();
        let mut client = open(
            &cfg,
            Arc::new(a),
            EngineResources::Client {
                workspace: server.workspace(),
            },
        )
        .unwrap();
        assert_eq!(client.name(), "rpma_aof_client");
        assert_eq!(client.file_size(), 4096);

        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn(async move {
            server.serve(rx).await.unwrap();
            server
        });

        assert!(matches!(
            client.queue(IoUnit::durable(1, 0, 64)).await.unwrap(),
            QueueStatus::Queued(_)
        ));
        assert_eq!(client.commit().unwrap(), 1);
        assert_eq!(
            client
                .get_events(1, 1, Duration::from_secs(5))
                .await
                .unwrap(),
            1
        );
        assert!(client.event(0).unwrap().is_ok());
        assert_eq!(pmem.flushed_ranges(), vec![(0, 64)]);

        tx.send(true).unwrap();
        let mut server = serving.await.unwrap();
        assert_eq!(IoEngine::name(&server), "rpma_aof_server");
        assert_eq!(
            IoEngine::queue(&mut server, IoUnit::write(0, 0, 1))
                .await
                .unwrap(),
            QueueStatus::Busy
        );
        client.cleanup().unwrap();
        IoEngine::cleanup(&mut server).unwrap();
    }

    #[tokio::test]
    async fn test_sync_client_completes_in_queue() {
        let mut cfg = config(EngineKind::Client);
        cfg.client.sync = true;
        let (a, b) = LoopbackFabric::connect(
            LoopbackConfig::default(),
            compute_budget(4, 4),
            ServerEngine::budget_for(&cfg.server),
        );
        let mut server =
            ServerEngine::new(Arc::new(b), Arc::new(RecordingPmem::new()), cfg.server.clone())
                .unwrap();
        let workspace = server.workspace();
        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn(async move { server.serve(rx).await });

        let mut client = open(&cfg, Arc::new(a), EngineResources::Client { workspace }).unwrap();
        let status = client.queue(IoUnit::durable(9, 128, 32)).await.unwrap();
        let QueueStatus::Completed(id) = status else {
            panic!("expected synchronous completion, got {status:?}");
        };
        let outcome = client.event(0).unwrap();
        assert_eq!(outcome.correlation_id, id);
        assert_eq!(outcome.tag, 9);
        assert!(outcome.is_ok());

        tx.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }
}
