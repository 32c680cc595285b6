//! Append workload driven through the client engine against a served loopback peer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use rpma_aof_engine::{
    compute_budget, ClientEngine, ClientStats, EngineConfig, FabricStats, FilePmem, IoEngine,
    IoOutcome, IoUnit, LoopbackConfig, LoopbackFabric, PersistentMemory, QueueStatus,
    RecordingPmem, ServerEngine, ServerStats, ServerWorkspace, WriteMode,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shape of one append run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub block_size: u64,
    pub total_bytes: u64,
    /// Every Nth write asks for durability; 0 disables durability.
    pub durable_every: u64,
    pub file: Option<PathBuf>,
    pub verify: bool,
}

impl Workload {
    fn blocks(&self) -> u64 {
        self.total_bytes / self.block_size
    }

    fn unit(&self, index: u64, workspace_blocks: u64) -> IoUnit {
        let offset = (index % workspace_blocks) * self.block_size;
        let durable = self.durable_every > 0 && (index + 1) % self.durable_every == 0;
        if durable {
            IoUnit::durable(index, offset, self.block_size)
        } else {
            IoUnit::write(index, offset, self.block_size)
        }
    }
}

/// Summary printed after a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub blocks: u64,
    pub bytes: u64,
    pub durable_requests: u64,
    pub failed: u64,
    pub elapsed_ms: u64,
    pub mib_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    pub verified: bool,
    pub client: ClientStats,
    pub server: ServerStats,
    pub fabric: FabricStats,
}

#[derive(Default)]
struct Tally {
    completed: u64,
    durable: u64,
    failed: u64,
    latency_total: Duration,
    latency_max: Duration,
}

impl Tally {
    fn record(&mut self, outcome: &IoOutcome) {
        self.completed += 1;
        if outcome.mode == WriteMode::Durable {
            self.durable += 1;
        }
        if !outcome.is_ok() {
            self.failed += 1;
            if let Some(details) = outcome.error_details() {
                warn!("{details}");
            }
        }
        self.latency_total += outcome.latency;
        self.latency_max = self.latency_max.max(outcome.latency);
    }
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Run `shape` against a freshly served loopback peer.
pub async fn run(config: &EngineConfig, shape: &Workload) -> Result<Report> {
    ensure!(shape.block_size > 0, "block size must be non-zero");
    ensure!(
        shape.block_size <= config.client.data_region_size,
        "block size {} exceeds the client data region ({})",
        shape.block_size,
        config.client.data_region_size
    );
    let workspace_blocks = config.server.workspace_size / shape.block_size;
    ensure!(
        workspace_blocks > 0,
        "block size {} exceeds the server workspace ({})",
        shape.block_size,
        config.server.workspace_size
    );

    let pmem: Arc<dyn PersistentMemory> = match &shape.file {
        Some(path) => Arc::new(
            FilePmem::create(path, config.server.workspace_size)
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Arc::new(RecordingPmem::new()),
    };

    let (client_end, server_end) = LoopbackFabric::connect(
        LoopbackConfig::default(),
        compute_budget(
            config.client.max_outstanding_writes,
            config.client.durability_msg_count,
        ),
        ServerEngine::budget_for(&config.server),
    );
    let fabric = client_end.clone();

    let mut server = ServerEngine::new(Arc::new(server_end), pmem, config.server.clone())?;
    // The descriptor crosses the connection as private data.
    let private_data = server.workspace().to_private_data()?;
    let workspace = ServerWorkspace::from_private_data(&private_data)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(async move {
        let served = server.serve(shutdown_rx).await;
        (server, served)
    });

    let mut client = ClientEngine::connect(Arc::new(client_end), workspace, config.client.clone())?;
    let data = pattern(shape.block_size);
    client.fill_data(0, &data)?;

    let started = Instant::now();
    let timeout = config.client.response_timeout();
    let tally = drive(&mut client, shape, workspace_blocks, timeout).await;
    let elapsed = started.elapsed();
    let client_stats = client.stats();
    client.cleanup()?;

    let _ = shutdown_tx.send(true);
    let (mut server, served) = serving.await.context("server task panicked")?;
    if let Err(e) = served {
        warn!(error = %e, "server stopped with an error");
    }
    let tally = tally?;

    let verified = if shape.verify {
        let written = shape.blocks().min(workspace_blocks);
        for block in 0..written {
            let got = server.read_workspace(block * shape.block_size, shape.block_size)?;
            ensure!(got == data, "block {block} does not match the written pattern");
        }
        debug!(blocks = written, "workspace verified");
        true
    } else {
        false
    };
    let server_stats = server.stats();
    server.cleanup()?;

    let bytes = tally.completed * shape.block_size;
    let secs = elapsed.as_secs_f64();
    let report = Report {
        blocks: tally.completed,
        bytes,
        durable_requests: tally.durable,
        failed: tally.failed,
        elapsed_ms: elapsed.as_millis() as u64,
        mib_per_sec: if secs > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        },
        avg_latency_us: if tally.completed > 0 {
            (tally.latency_total.as_micros() / tally.completed as u128) as u64
        } else {
            0
        },
        max_latency_us: tally.latency_max.as_micros() as u64,
        verified,
        client: client_stats,
        server: server_stats,
        fabric: fabric.stats(),
    };
    info!(
        blocks = report.blocks,
        failed = report.failed,
        mib_per_sec = report.mib_per_sec,
        "workload finished"
    );
    Ok(report)
}

async fn drive(
    engine: &mut dyn IoEngine,
    shape: &Workload,
    workspace_blocks: u64,
    timeout: Duration,
) -> Result<Tally> {
    let blocks = shape.blocks();
    let mut tally = Tally::default();
    let mut submitted = 0;

    while tally.completed < blocks {
        while submitted < blocks {
            match engine.queue(shape.unit(submitted, workspace_blocks)).await? {
                QueueStatus::Queued(_) => submitted += 1,
                QueueStatus::Completed(_) => {
                    submitted += 1;
                    if let Some(outcome) = engine.event(0) {
                        tally.record(outcome);
                    }
                }
                QueueStatus::Busy => break,
            }
        }

        match engine.commit() {
            Ok(_) => {}
            Err(e) if e.kind().is_retryable() => debug!(error = %e, "commit deferred"),
            Err(e) => return Err(e.into()),
        }

        if tally.completed == submitted {
            continue;
        }
        let in_flight = (submitted - tally.completed) as usize;
        // Anything still unanswered after one response timeout is expired by the engine.
        let reaped = engine.get_events(1, in_flight, timeout * 2).await?;
        ensure!(reaped > 0, "no completion within {timeout:?}");
        for index in 0..reaped {
            if let Some(outcome) = engine.event(index) {
                tally.record(outcome);
            }
        }
    }
    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpma_aof_engine::{ClientConfig, ServerConfig};
    use tempfile::TempDir;

    fn small_config() -> EngineConfig {
        EngineConfig {
            client: ClientConfig {
                msg_num: 4,
                max_outstanding_writes: 8,
                durability_msg_count: 4,
                data_region_size: 4096,
                ..ClientConfig::default()
            },
            server: ServerConfig {
                max_msg_num: 4,
                workspace_size: 64 * 1024,
                busy_wait_polling: false,
            },
            ..EngineConfig::default()
        }
    }

    fn shape(durable_every: u64) -> Workload {
        Workload {
            block_size: 1024,
            total_bytes: 32 * 1024,
            durable_every,
            file: None,
            verify: true,
        }
    }

    #[test]
    fn test_durable_cadence() {
        let s = shape(4);
        let durable: Vec<u64> = (0..8).filter(|i| s.unit(*i, 64).is_durable()).collect();
        assert_eq!(durable, vec![3, 7]);
        assert!(!(0..8).any(|i| shape(0).unit(i, 64).is_durable()));
    }

    #[test]
    fn test_offsets_wrap_inside_workspace() {
        let s = shape(1);
        assert_eq!(s.unit(0, 4).offset, 0);
        assert_eq!(s.unit(5, 4).offset, 1024);
    }

    #[tokio::test]
    async fn test_durable_run_completes_and_verifies() {
        let report = run(&small_config(), &shape(1)).await.unwrap();
        assert_eq!(report.blocks, 32);
        assert_eq!(report.durable_requests, 32);
        assert_eq!(report.failed, 0);
        assert!(report.verified);
        assert_eq!(report.server.flushes, 32);
        assert_eq!(report.fabric.writes, 32);
    }

    #[tokio::test]
    async fn test_fire_and_forget_run_sends_no_flushes() {
        let report = run(&small_config(), &shape(0)).await.unwrap();
        assert_eq!(report.blocks, 32);
        assert_eq!(report.durable_requests, 0);
        assert_eq!(report.server.flushes, 0);
        assert_eq!(report.client.flushes_posted, 0);
    }

    #[tokio::test]
    async fn test_sync_run() {
        let mut config = small_config();
        config.client.sync = true;
        let report = run(&config, &shape(2)).await.unwrap();
        assert_eq!(report.blocks, 32);
        assert_eq!(report.durable_requests, 16);
    }

    #[tokio::test]
    async fn test_file_backed_run_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aof.pmem");
        let mut s = shape(1);
        s.total_bytes = 4 * 1024;
        s.file = Some(path.clone());
        let report = run(&small_config(), &s).await.unwrap();
        assert_eq!(report.blocks, 4);
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 64 * 1024);
        assert_eq!(&contents[..1024], pattern(1024).as_slice());
    }

    #[test]
    fn test_failed_outcome_is_tallied() {
        let mut tally = Tally::default();
        let outcome = IoOutcome {
            tag: 7,
            correlation_id: 3,
            offset: 0,
            len: 1024,
            mode: WriteMode::Durable,
            result: Err(rpma_aof_engine::AofError::Timeout {
                correlation_id: 3,
                timeout_ms: 50,
            }),
            latency: Duration::from_micros(40),
        };
        tally.record(&outcome);
        assert_eq!(tally.completed, 1);
        assert_eq!(tally.durable, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.latency_max, Duration::from_micros(40));
    }

    #[tokio::test]
    async fn test_durable_run_without_receive_ring_fails_fast() {
        let mut config = small_config();
        config.client.durability_msg_count = 0;
        let err = run(&config, &shape(1)).await.unwrap_err();
        assert!(err.to_string().contains("durability_msg_count"), "{err:#}");
        let report = run(&config, &shape(0)).await.unwrap();
        assert_eq!(report.blocks, 32);
    }

    #[tokio::test]
    async fn test_block_larger_than_data_region_rejected() {
        let mut s = shape(1);
        s.block_size = 8192;
        assert!(run(&small_config(), &s).await.is_err());
    }
}
