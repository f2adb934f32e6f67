//! Engine runtime: partition workers and the flush scheduler
//!
//! ```text
//!   EngineHandle::send ──hash(connector)──▶ partition worker 0..N ──▶ ActorManager::ingest
//!                                                                         │
//!   interval / FlushNow / Shutdown ──────▶ flush scheduler ──────▶ ActorManager::flush
//! ```
//!
//! Each task owns an mpsc receiver; requests that need an answer carry a
//! oneshot `respond_to` channel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use super::cancel::FlushCancellation;
use super::manager::ActorManager;
use super::messages::{FlushCommand, FlushReport, RawData, WorkerCommand, WorkerStats};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, PersistenceError};

/// Partition of a telemetry point; stable for a given connector
pub fn partition_for(raw: &RawData, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    match raw.connector_id.as_deref().filter(|id| !id.is_empty()) {
        Some(connector) => connector.to_ascii_lowercase().hash(&mut hasher),
        None => raw.source_key().hash(&mut hasher),
    }
    (hasher.finish() % partitions.max(1) as u64) as usize
}

struct PartitionWorker {
    index: usize,
    manager: Arc<ActorManager>,
    telemetry_rx: mpsc::Receiver<RawData>,
    command_rx: mpsc::Receiver<WorkerCommand>,
    stats: WorkerStats,
}

impl PartitionWorker {
    #[instrument(skip(self), fields(partition = self.index))]
    async fn run(mut self) {
        debug!("starting partition worker");

        loop {
            tokio::select! {
                // telemetry first, so a Sync is answered after everything sent before it
                biased;

                Some(raw) = self.telemetry_rx.recv() => {
                    self.stats.received += 1;
                    if self.manager.ingest(&raw) > 0 {
                        self.stats.routed += 1;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        WorkerCommand::Sync { respond_to } => {
                            let _ = respond_to.send(self.stats);
                        }
                        WorkerCommand::Shutdown => break,
                    }
                }

                else => {
                    warn!("channels closed, shutting down");
                    break;
                }
            }
        }

        // drain what was queued before the shutdown
        while let Ok(raw) = self.telemetry_rx.try_recv() {
            self.stats.received += 1;
            if self.manager.ingest(&raw) > 0 {
                self.stats.routed += 1;
            }
        }

        debug!(
            "partition worker stopped after {} points ({} routed)",
            self.stats.received, self.stats.routed
        );
    }
}

struct FlushScheduler {
    manager: Arc<ActorManager>,
    command_rx: mpsc::Receiver<FlushCommand>,
    interval: Duration,
    cancellation: FlushCancellation,
}

impl FlushScheduler {
    async fn flush(&self) -> Result<FlushReport, PersistenceError> {
        let token = self.cancellation.begin();
        let result = self.manager.flush(&token).await;
        self.cancellation.finish();
        result
    }

    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting flush scheduler (every {:?})", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!("time-based flush triggered");
                    if let Err(e) = self.flush().await {
                        warn!("scheduled flush failed, retrying next interval: {e}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        FlushCommand::FlushNow { respond_to } => {
                            let _ = respond_to.send(self.flush().await);
                        }
                        FlushCommand::Shutdown { respond_to } => {
                            debug!("final flush before shutdown");
                            let _ = respond_to.send(self.flush().await);
                            return;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, flushing and shutting down");
                    if let Err(e) = self.flush().await {
                        warn!("final flush failed: {e}");
                    }
                    return;
                }
            }
        }
    }
}

struct PartitionHandle {
    telemetry: mpsc::Sender<RawData>,
    commands: mpsc::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

/// Handle to a running engine
pub struct EngineHandle {
    manager: Arc<ActorManager>,
    partitions: Vec<PartitionHandle>,
    flush: mpsc::Sender<FlushCommand>,
    flush_task: JoinHandle<()>,
    cancellation: FlushCancellation,
}

impl EngineHandle {
    /// Spawn the partition workers and the flush scheduler.
    pub fn spawn(manager: Arc<ActorManager>, config: &EngineConfig) -> Self {
        let capacity = config.channel_capacity.max(1);

        let partitions = (0..config.partitions.max(1))
            .map(|index| {
                let (telemetry, telemetry_rx) = mpsc::channel(capacity);
                let (commands, command_rx) = mpsc::channel(32);
                let worker = PartitionWorker {
                    index,
                    manager: Arc::clone(&manager),
                    telemetry_rx,
                    command_rx,
                    stats: WorkerStats::default(),
                };
                PartitionHandle {
                    telemetry,
                    commands,
                    task: tokio::spawn(worker.run()),
                }
            })
            .collect::<Vec<_>>();

        let cancellation = FlushCancellation::new();
        let (flush, command_rx) = mpsc::channel(32);
        let scheduler = FlushScheduler {
            manager: Arc::clone(&manager),
            command_rx,
            interval: config.flush_interval(),
            cancellation: cancellation.clone(),
        };
        let flush_task = tokio::spawn(scheduler.run());

        info!(
            "engine started with {} partitions, flushing every {:?}",
            partitions.len(),
            config.flush_interval()
        );

        Self {
            manager,
            partitions,
            flush,
            flush_task,
            cancellation,
        }
    }

    pub fn manager(&self) -> Arc<ActorManager> {
        Arc::clone(&self.manager)
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Queue one telemetry point; waits while its partition is full.
    pub async fn send(&self, raw: RawData) -> EngineResult<()> {
        let partition = partition_for(&raw, self.partitions.len());
        self.partitions[partition]
            .telemetry
            .send(raw)
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    /// Wait until every point sent so far has been ingested.
    pub async fn sync(&self) -> EngineResult<WorkerStats> {
        let mut total = WorkerStats::default();
        for partition in &self.partitions {
            let (tx, rx) = oneshot::channel();
            partition
                .commands
                .send(WorkerCommand::Sync { respond_to: tx })
                .await
                .map_err(|_| EngineError::Shutdown)?;
            let stats = rx.await.map_err(|_| EngineError::Shutdown)?;
            total.received += stats.received;
            total.routed += stats.routed;
        }
        Ok(total)
    }

    pub async fn flush(&self) -> EngineResult<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.flush
            .send(FlushCommand::FlushNow { respond_to: tx })
            .await
            .map_err(|_| EngineError::Shutdown)?;

        Ok(rx.await.map_err(|_| EngineError::Shutdown)??)
    }

    /// Ask the running flush to stop between actors. Returns false, and
    /// affects nothing, when no flush is running.
    pub fn cancel_flush(&self) -> bool {
        self.cancellation.cancel_running()
    }

    /// Stop the workers after draining their queues, then run a final flush.
    #[instrument(skip_all)]
    pub async fn shutdown(self) -> EngineResult<FlushReport> {
        for partition in &self.partitions {
            let _ = partition.commands.send(WorkerCommand::Shutdown).await;
        }
        let tasks = self.partitions.into_iter().map(|partition| partition.task);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("partition worker failed: {e}");
            }
        }

        let (tx, rx) = oneshot::channel();
        self.flush
            .send(FlushCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        let report = rx.await.map_err(|_| EngineError::Shutdown)??;

        if let Err(e) = self.flush_task.await {
            warn!("flush scheduler failed: {e}");
        }

        info!(
            "engine stopped; final flush wrote {} actor states",
            report.actors_written
        );
        Ok(report)
    }
}
