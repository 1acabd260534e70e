use crate::conflict::{
    detect, resolve, ConflictCheck, Resolution, ResolutionStrategy, SyncConflict,
};
use crate::connectivity::ConnectivityMonitor;
use crate::persist::{LogRecord, QueuePersistence};
use crate::queue::OpQueue;
use crate::remote::RemoteStore;
use chrono::{DateTime, Utc};
use notemesh_core::config::SyncSettings;
use notemesh_core::error::{ErrorKind, GatewayResult};
use notemesh_core::model::{Chunk, ChunkId};
use notemesh_core::op::{OpPayload, SyncOp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Send as soon as an op is enqueued, while online.
    Immediate,
    /// Group up to `batch_size` ops, or flush when `batch_timeout` elapses.
    #[default]
    Batched,
    /// Periodic flush every `sync_interval`.
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub strategy: DispatchStrategy,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub sync_interval: Duration,
    pub max_queue_size: usize,
    pub max_retry_attempts: u32,
    pub max_concurrent_operations: usize,
    pub conflict_check: ConflictCheck,
    pub resolution: ResolutionStrategy,
    /// Conflict detection toggles per op kind; updates default on.
    pub detect_on_update: bool,
    pub detect_on_delete: bool,
    pub snapshot_every_ops: u64,
    /// Deadline for each remote fetch/apply call.
    pub remote_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::Batched,
            batch_size: 32,
            batch_timeout: Duration::from_secs(2),
            sync_interval: Duration::from_secs(30),
            max_queue_size: 10_000,
            max_retry_attempts: 5,
            max_concurrent_operations: 4,
            conflict_check: ConflictCheck::Timestamp,
            resolution: ResolutionStrategy::RemoteWins,
            detect_on_update: true,
            detect_on_delete: false,
            snapshot_every_ops: 512,
            remote_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let defaults = Self::default();
        Self {
            strategy: match settings.strategy.as_str() {
                "immediate" => DispatchStrategy::Immediate,
                "scheduled" => DispatchStrategy::Scheduled,
                _ => DispatchStrategy::Batched,
            },
            batch_size: settings.batch_size,
            batch_timeout: Duration::from_millis(settings.batch_timeout_ms),
            sync_interval: Duration::from_millis(settings.sync_interval_ms),
            max_queue_size: settings.max_queue_size,
            max_retry_attempts: settings.max_retry_attempts,
            max_concurrent_operations: settings.max_concurrent_operations,
            conflict_check: match settings.conflict_check.as_str() {
                "checksum" => ConflictCheck::Checksum,
                "version" => ConflictCheck::Version,
                _ => ConflictCheck::Timestamp,
            },
            resolution: match settings.resolution.as_str() {
                "local_wins" => ResolutionStrategy::LocalWins,
                "merge" => ResolutionStrategy::Merge,
                "manual" => ResolutionStrategy::Manual,
                _ => ResolutionStrategy::RemoteWins,
            },
            snapshot_every_ops: settings.snapshot_every_ops,
            ..defaults
        }
    }
}

/// An op that exhausted its retry budget or failed a contract check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub op: SyncOp,
    pub error_kind: ErrorKind,
    pub error_code: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub enqueued: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub conflicts: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub flushes: u64,
}

enum DispatchOutcome {
    Done,
    Discarded,
    Requeue(SyncOp),
    Dead(DeadLetter),
    Parked(SyncOp, Box<SyncConflict>),
}

/// C5: durable queue of pending operations, policy-driven dispatch, conflict
/// detection/resolution, dead-lettering, and optional on-disk persistence.
pub struct SyncCoordinator {
    queue: Mutex<OpQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    stats: Mutex<SyncStats>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    manual_conflicts: Mutex<Vec<SyncConflict>>,
    parked: Mutex<HashSet<ChunkId>>,
    parked_ops: Mutex<Vec<SyncOp>>,
    persistence: Option<Mutex<QueuePersistence>>,
    /// Invoked when a conflict resolution replaces local state with remote
    /// content, so derived work (re-embedding) can be requeued.
    remote_apply_hook: Option<Box<dyn Fn(&Chunk) + Send + Sync>>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue: Mutex::new(OpQueue::new(config.max_queue_size)),
            remote,
            connectivity,
            config,
            stats: Mutex::new(SyncStats::default()),
            dead_letters: Mutex::new(Vec::new()),
            manual_conflicts: Mutex::new(Vec::new()),
            parked: Mutex::new(HashSet::new()),
            parked_ops: Mutex::new(Vec::new()),
            persistence: None,
            remote_apply_hook: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Open with on-disk queue persistence; the append log is replayed into
    /// memory before the coordinator accepts work.
    pub async fn open_persistent(
        dir: impl AsRef<Path>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> GatewayResult<Self> {
        let (persistence, recovered) =
            QueuePersistence::open(dir, config.snapshot_every_ops).await?;
        let coordinator = Self::new(remote, connectivity, config);
        {
            let mut queue = coordinator.queue.lock().await;
            queue.restore(recovered.pending);
        }
        *coordinator.dead_letters.lock().await = recovered.dead;
        Ok(Self {
            persistence: Some(Mutex::new(persistence)),
            ..coordinator
        })
    }

    pub fn with_remote_apply_hook(
        mut self,
        hook: impl Fn(&Chunk) + Send + Sync + 'static,
    ) -> Self {
        self.remote_apply_hook = Some(Box::new(hook));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn stats(&self) -> SyncStats {
        let mut stats = *self.stats.lock().await;
        stats.dropped = self.queue.lock().await.dropped();
        stats
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }

    pub async fn manual_conflicts(&self) -> Vec<SyncConflict> {
        self.manual_conflicts.lock().await.clone()
    }

    /// Enqueue one operation. While online with the immediate strategy (or a
    /// full batch under the batched strategy) this also triggers a flush.
    pub async fn enqueue(self: &Arc<Self>, op: SyncOp) -> GatewayResult<()> {
        if self.parked.lock().await.contains(&op.chunk_id) {
            debug!(chunk_id = %op.chunk_id, "chunk parked on a manual conflict, holding op");
            self.parked_ops.lock().await.push(op);
            return Ok(());
        }

        self.persist_record(&LogRecord::Enqueued(op.clone())).await;
        let (dropped, queue_len) = {
            let mut queue = self.queue.lock().await;
            let dropped = queue.enqueue(op);
            (dropped, queue.len())
        };
        if let Some(dropped) = dropped {
            // Overflow-dropped ops must not resurrect on log replay.
            self.persist_record(&LogRecord::Completed {
                op_id: dropped.op_id,
            })
            .await;
        }
        self.stats.lock().await.enqueued += 1;

        if self.connectivity.is_online() {
            let should_flush = match self.config.strategy {
                DispatchStrategy::Immediate => true,
                DispatchStrategy::Batched => queue_len >= self.config.batch_size,
                DispatchStrategy::Scheduled => false,
            };
            if should_flush {
                self.flush().await?;
            }
        }
        Ok(())
    }

    pub async fn enqueue_all(self: &Arc<Self>, ops: Vec<SyncOp>) -> GatewayResult<()> {
        for op in ops {
            self.enqueue(op).await?;
        }
        Ok(())
    }

    /// Mark the connectivity transition to online and flush what accumulated
    /// while offline. The first flush is always batched.
    pub async fn on_online(self: &Arc<Self>) -> GatewayResult<usize> {
        self.connectivity.set_online(true);
        self.flush().await
    }

    pub fn set_offline(&self) {
        self.connectivity.set_online(false);
    }

    /// Drain the queue in batches. Ops for different chunks are dispatched
    /// concurrently, bounded by `max_concurrent_operations`.
    pub async fn flush(self: &Arc<Self>) -> GatewayResult<usize> {
        if !self.connectivity.is_online() {
            return Ok(0);
        }

        let mut total = 0usize;
        loop {
            let batch = {
                let mut queue = self.queue.lock().await;
                queue.dequeue_batch(self.config.batch_size)
            };
            if batch.is_empty() {
                break;
            }
            self.stats.lock().await.flushes += 1;

            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_operations.max(1)));
            let mut tasks: JoinSet<DispatchOutcome> = JoinSet::new();
            for op in batch {
                let this = self.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    this.dispatch(op).await
                });
            }

            let progressed_before = total;
            let mut requeued = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(error = %e, "dispatch task panicked");
                        continue;
                    }
                };
                match outcome {
                    DispatchOutcome::Done => {
                        total += 1;
                        self.stats.lock().await.successful += 1;
                    }
                    DispatchOutcome::Discarded => {
                        total += 1;
                    }
                    DispatchOutcome::Requeue(op) => {
                        self.stats.lock().await.retried += 1;
                        requeued.push(op);
                    }
                    DispatchOutcome::Dead(letter) => {
                        self.persist_record(&LogRecord::DeadLettered(letter.clone()))
                            .await;
                        {
                            let mut stats = self.stats.lock().await;
                            stats.failed += 1;
                            stats.dead_lettered += 1;
                        }
                        warn!(
                            op_id = %letter.op.op_id,
                            code = %letter.error_code,
                            "operation dead-lettered"
                        );
                        self.dead_letters.lock().await.push(letter);
                    }
                    DispatchOutcome::Parked(op, conflict) => {
                        self.stats.lock().await.conflicts += 1;
                        self.parked.lock().await.insert(op.chunk_id);
                        self.parked_ops.lock().await.push(op);
                        self.manual_conflicts.lock().await.push(*conflict);
                    }
                }
            }

            // Retryable failures go back to the tail of their class for a
            // later flush; spinning on them here would hot-loop a downed remote.
            let made_progress = total > progressed_before;
            {
                let mut queue = self.queue.lock().await;
                for op in requeued {
                    queue.enqueue(op);
                }
            }
            if !made_progress || self.cancel.is_cancelled() || !self.connectivity.is_online() {
                break;
            }
        }

        self.maybe_snapshot().await;
        Ok(total)
    }

    async fn dispatch(self: &Arc<Self>, mut op: SyncOp) -> DispatchOutcome {
        if self.parked.lock().await.contains(&op.chunk_id) {
            self.parked_ops.lock().await.push(op);
            return DispatchOutcome::Discarded;
        }

        // Conflict detection before the write lands remotely.
        let detect_enabled = match &op.payload {
            OpPayload::Update { .. } => self.config.detect_on_update,
            OpPayload::Delete { .. } => self.config.detect_on_delete,
            _ => false,
        };
        let update_view = if detect_enabled {
            match &op.payload {
                OpPayload::Update {
                    chunk,
                    baseline: Some(baseline),
                } => Some((chunk.clone(), baseline.clone())),
                _ => None,
            }
        } else {
            None
        };
        if let Some((local, baseline)) = update_view {
            match self.remote_fetch(op.chunk_id).await {
                Ok(Some(remote_chunk)) => {
                    if let Some(conflict_type) =
                        detect(&baseline, &local, &remote_chunk, self.config.conflict_check)
                    {
                        let conflict = SyncConflict {
                            chunk_id: op.chunk_id,
                            local: local.clone(),
                            remote: remote_chunk,
                            conflict_type,
                        };
                        match resolve(self.config.resolution, &conflict) {
                            Resolution::UseLocal(_) => {
                                debug!(chunk_id = %op.chunk_id, "conflict: local wins");
                                self.stats.lock().await.conflicts += 1;
                            }
                            Resolution::UseRemote(remote_state) => {
                                debug!(chunk_id = %op.chunk_id, "conflict: remote wins, discarding local op");
                                self.stats.lock().await.conflicts += 1;
                                if let Some(hook) = &self.remote_apply_hook {
                                    hook(&remote_state);
                                }
                                self.persist_record(&LogRecord::Completed { op_id: op.op_id })
                                    .await;
                                return DispatchOutcome::Discarded;
                            }
                            Resolution::Merged(merged) => {
                                debug!(chunk_id = %op.chunk_id, "conflict: merged");
                                self.stats.lock().await.conflicts += 1;
                                if let Some(hook) = &self.remote_apply_hook {
                                    hook(&merged);
                                }
                                op.payload = OpPayload::Update {
                                    chunk: merged,
                                    baseline: None,
                                };
                            }
                            Resolution::Parked => {
                                return DispatchOutcome::Parked(op, Box::new(conflict));
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    return self.failure_outcome(op, err).await;
                }
            }
        }

        match self.remote_apply(&op).await {
            Ok(()) => {
                self.persist_record(&LogRecord::Completed { op_id: op.op_id })
                    .await;
                DispatchOutcome::Done
            }
            Err(err) => self.failure_outcome(op, err).await,
        }
    }

    async fn remote_fetch(&self, chunk_id: ChunkId) -> GatewayResult<Option<Chunk>> {
        match tokio::time::timeout(self.config.remote_timeout, self.remote.fetch(chunk_id)).await {
            Ok(result) => result,
            Err(_) => Err(notemesh_core::error::GatewayError::timeout(
                "REMOTE_DEADLINE",
                "remote fetch deadline exceeded",
            )),
        }
    }

    async fn remote_apply(&self, op: &SyncOp) -> GatewayResult<()> {
        match tokio::time::timeout(self.config.remote_timeout, self.remote.apply(op)).await {
            Ok(result) => result,
            Err(_) => Err(notemesh_core::error::GatewayError::timeout(
                "REMOTE_DEADLINE",
                "remote apply deadline exceeded",
            )),
        }
    }

    async fn failure_outcome(
        &self,
        mut op: SyncOp,
        err: notemesh_core::error::GatewayError,
    ) -> DispatchOutcome {
        op.attempts += 1;
        if err.retryable && op.attempts <= self.config.max_retry_attempts {
            debug!(
                op_id = %op.op_id,
                attempts = op.attempts,
                error = %err,
                "retryable failure, requeueing at class tail"
            );
            DispatchOutcome::Requeue(op)
        } else {
            DispatchOutcome::Dead(DeadLetter {
                error_kind: err.kind,
                error_code: err.code.clone(),
                failed_at: Utc::now(),
                op,
            })
        }
    }

    /// Release a manually parked chunk, resolving its conflicts with the
    /// given strategy and re-enqueueing held ops.
    pub async fn resolve_manual(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        strategy: ResolutionStrategy,
    ) -> GatewayResult<usize> {
        let conflicts: Vec<SyncConflict> = {
            let mut manual = self.manual_conflicts.lock().await;
            let (matching, rest): (Vec<_>, Vec<_>) =
                manual.drain(..).partition(|c| c.chunk_id == chunk_id);
            *manual = rest;
            matching
        };

        for conflict in &conflicts {
            match resolve(strategy, conflict) {
                Resolution::UseRemote(remote_state) | Resolution::Merged(remote_state) => {
                    if let Some(hook) = &self.remote_apply_hook {
                        hook(&remote_state);
                    }
                }
                Resolution::UseLocal(_) | Resolution::Parked => {}
            }
        }

        self.parked.lock().await.remove(&chunk_id);
        let held: Vec<SyncOp> = {
            let mut parked_ops = self.parked_ops.lock().await;
            let (matching, rest): (Vec<_>, Vec<_>) =
                parked_ops.drain(..).partition(|op| op.chunk_id == chunk_id);
            *parked_ops = rest;
            matching
        };
        let released = held.len();
        if strategy == ResolutionStrategy::RemoteWins {
            // The operator discarded the local side; held writes go with it.
            return Ok(released);
        }
        for mut op in held {
            // The operator has ruled; released ops dispatch without re-detection.
            if let OpPayload::Update { baseline, .. } = &mut op.payload {
                *baseline = None;
            }
            self.enqueue(op).await?;
        }
        Ok(released)
    }

    /// Background loop driving the configured dispatch strategy until the
    /// cancellation token fires. Pending items survive cancellation in the
    /// persisted log.
    pub async fn run(self: Arc<Self>) {
        let tick = match self.config.strategy {
            DispatchStrategy::Immediate => self.config.batch_timeout,
            DispatchStrategy::Batched => self.config.batch_timeout,
            DispatchStrategy::Scheduled => self.config.sync_interval,
        };
        info!(strategy = ?self.config.strategy, "sync coordinator started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    if self.connectivity.is_online() && self.queue_len().await > 0 {
                        if let Err(err) = self.flush().await {
                            error!(error = %err, "scheduled flush failed");
                        }
                    }
                }
            }
        }
        info!("sync coordinator stopped");
    }

    /// Cancel background work and write a final snapshot.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.snapshot_now().await;
    }

    pub async fn snapshot_now(&self) {
        if let Some(persistence) = &self.persistence {
            let pending = self.queue.lock().await.snapshot();
            let dead = self.dead_letters.lock().await.clone();
            if let Err(err) = persistence.lock().await.snapshot(pending, dead).await {
                error!(error = %err, "queue snapshot failed");
            }
        }
    }

    async fn maybe_snapshot(&self) {
        let due = match &self.persistence {
            Some(persistence) => persistence.lock().await.snapshot_due(),
            None => false,
        };
        if due {
            self.snapshot_now().await;
        }
    }

    async fn persist_record(&self, record: &LogRecord) {
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.lock().await.record(record).await {
                // Persistence failures must not block sync; logged and carried on.
                error!(error = %err, "queue persistence append failed");
            }
        }
    }
}
