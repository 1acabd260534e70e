use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;
use notemesh_core::error::ErrorKind;
use notemesh_core::model::Chunk;
use notemesh_core::op::{OpBaseline, OpPayload, OpPriorities, SyncOp};
use sync::{
    ConflictCheck, ConnectivityMonitor, DispatchStrategy, MockRemoteStore, RemoteStore,
    ResolutionStrategy, SyncConfig, SyncCoordinator,
};

fn create_op(chunk: &Chunk) -> SyncOp {
    SyncOp::new(
        chunk.chunk_id,
        &chunk.document_id,
        OpPayload::Create {
            chunk: chunk.clone(),
        },
        &OpPriorities::default(),
    )
}

fn update_op(chunk: &Chunk, baseline: OpBaseline) -> SyncOp {
    SyncOp::new(
        chunk.chunk_id,
        &chunk.document_id,
        OpPayload::Update {
            chunk: chunk.clone(),
            baseline: Some(baseline),
        },
        &OpPriorities::default(),
    )
}

fn coordinator(
    remote: Arc<MockRemoteStore>,
    online: bool,
    config: SyncConfig,
) -> Arc<SyncCoordinator> {
    Arc::new(SyncCoordinator::new(
        remote,
        Arc::new(ConnectivityMonitor::new(online)),
        config,
    ))
}

#[tokio::test]
async fn offline_ops_accumulate_then_flush_in_one_batch_when_online() {
    let remote = Arc::new(MockRemoteStore::new());
    let coordinator = coordinator(remote.clone(), false, SyncConfig::default());

    for i in 0..5 {
        let chunk = Chunk::new("doc-1", format!("chunk {i}"));
        coordinator.enqueue(create_op(&chunk)).await.unwrap();
    }

    assert_eq!(coordinator.queue_len().await, 5);
    assert_eq!(remote.applied_count(), 0, "zero remote calls while offline");

    let flushed = coordinator.on_online().await.unwrap();
    assert_eq!(flushed, 5, "exactly five creates in one batched flush");
    assert_eq!(coordinator.queue_len().await, 0);
    assert_eq!(remote.applied_count(), 5);

    let stats = coordinator.stats().await;
    assert_eq!(stats.successful, 5);
    assert_eq!(stats.flushes, 1);
}

#[tokio::test]
async fn remote_wins_discards_local_and_applies_remote_state() {
    let remote = Arc::new(MockRemoteStore::new());

    // Remote already moved past the local baseline.
    let base = Chunk::new("doc-1", "original");
    let baseline = OpBaseline::of(&base, Some(1));
    let mut remote_chunk = base.clone();
    remote_chunk.contents = "remote edit".into();
    remote_chunk.last_updated = base.last_updated + ChronoDuration::seconds(10);
    remote.seed(remote_chunk.clone()).await;

    let applied_locally: Arc<Mutex<Option<Chunk>>> = Arc::new(Mutex::new(None));
    let hook_target = applied_locally.clone();

    let config = SyncConfig {
        resolution: ResolutionStrategy::RemoteWins,
        conflict_check: ConflictCheck::Timestamp,
        ..SyncConfig::default()
    };
    let coordinator = Arc::new(
        SyncCoordinator::new(
            remote.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            config,
        )
        .with_remote_apply_hook(move |chunk| {
            *hook_target.lock().unwrap() = Some(chunk.clone());
        }),
    );

    let mut local = base.clone();
    local.contents = "local edit".into();
    local.touch();
    coordinator
        .enqueue(update_op(&local, baseline))
        .await
        .unwrap();
    coordinator.flush().await.unwrap();

    assert_eq!(remote.applied_count(), 0, "no op sent for the losing local");
    let replaced = applied_locally.lock().unwrap().clone().unwrap();
    assert_eq!(replaced.contents, "remote edit");
    assert_eq!(coordinator.stats().await.conflicts, 1);
}

#[tokio::test]
async fn local_wins_overwrites_remote() {
    let remote = Arc::new(MockRemoteStore::new());
    let base = Chunk::new("doc-1", "original");
    let baseline = OpBaseline::of(&base, None);
    let mut remote_chunk = base.clone();
    remote_chunk.contents = "remote edit".into();
    remote_chunk.last_updated = base.last_updated + ChronoDuration::seconds(10);
    remote.seed(remote_chunk).await;

    let config = SyncConfig {
        resolution: ResolutionStrategy::LocalWins,
        ..SyncConfig::default()
    };
    let coordinator = coordinator(remote.clone(), true, config);

    let mut local = base.clone();
    local.contents = "local edit".into();
    coordinator
        .enqueue(update_op(&local, baseline))
        .await
        .unwrap();
    coordinator.flush().await.unwrap();

    assert_eq!(remote.applied_count(), 1);
    let now_remote = remote.fetch(local.chunk_id).await.unwrap().unwrap();
    assert_eq!(now_remote.contents, "local edit");
}

#[tokio::test]
async fn retryable_failures_requeue_then_dead_letter_on_exhaustion() {
    let remote = Arc::new(MockRemoteStore::new());
    remote.fail_times(10, ErrorKind::Network, "CONN_RESET");

    let config = SyncConfig {
        max_retry_attempts: 2,
        ..SyncConfig::default()
    };
    let coordinator = coordinator(remote.clone(), true, config);

    let chunk = Chunk::new("doc-1", "x");
    coordinator.enqueue(create_op(&chunk)).await.unwrap();

    // Each flush consumes one attempt; the op returns to the tail between flushes.
    coordinator.flush().await.unwrap();
    coordinator.flush().await.unwrap();
    coordinator.flush().await.unwrap();

    let dead = coordinator.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].op.attempts, 3);
    assert_eq!(dead[0].error_code, "CONN_RESET");
    assert_eq!(coordinator.queue_len().await, 0);
    assert_eq!(coordinator.stats().await.dead_lettered, 1);
}

#[tokio::test]
async fn non_retryable_failure_dead_letters_immediately() {
    let remote = Arc::new(MockRemoteStore::new());
    remote.fail_times(1, ErrorKind::Validation, "BAD_CHUNK");

    let coordinator = coordinator(remote.clone(), true, SyncConfig::default());
    let chunk = Chunk::new("doc-1", "x");
    coordinator.enqueue(create_op(&chunk)).await.unwrap();
    coordinator.flush().await.unwrap();

    let dead = coordinator.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error_kind, ErrorKind::Validation);
}

#[tokio::test]
async fn queue_overflow_drops_oldest_and_survives() {
    let config = SyncConfig {
        max_queue_size: 3,
        ..SyncConfig::default()
    };
    let remote = Arc::new(MockRemoteStore::new());
    let coordinator = coordinator(remote.clone(), false, config);

    for i in 0..5 {
        let chunk = Chunk::new("doc-1", format!("chunk {i}"));
        coordinator.enqueue(create_op(&chunk)).await.unwrap();
    }

    assert_eq!(coordinator.queue_len().await, 3);
    assert_eq!(coordinator.stats().await.dropped, 2);
}

#[tokio::test]
async fn manual_conflicts_park_the_chunk_until_resolved() {
    let remote = Arc::new(MockRemoteStore::new());
    let base = Chunk::new("doc-1", "original");
    let baseline = OpBaseline::of(&base, None);
    let mut remote_chunk = base.clone();
    remote_chunk.contents = "remote edit".into();
    remote_chunk.last_updated = base.last_updated + ChronoDuration::seconds(10);
    remote.seed(remote_chunk).await;

    let config = SyncConfig {
        resolution: ResolutionStrategy::Manual,
        ..SyncConfig::default()
    };
    let coordinator = coordinator(remote.clone(), true, config);

    let mut local = base.clone();
    local.contents = "local edit".into();
    coordinator
        .enqueue(update_op(&local, baseline.clone()))
        .await
        .unwrap();
    coordinator.flush().await.unwrap();

    assert_eq!(coordinator.manual_conflicts().await.len(), 1);
    assert_eq!(remote.applied_count(), 0);

    // Further writes to the parked chunk are held, not dispatched.
    coordinator
        .enqueue(update_op(&local, baseline))
        .await
        .unwrap();
    coordinator.flush().await.unwrap();
    assert_eq!(remote.applied_count(), 0);

    let released = coordinator
        .resolve_manual(local.chunk_id, ResolutionStrategy::LocalWins)
        .await
        .unwrap();
    assert_eq!(released, 2);
    coordinator.flush().await.unwrap();
    assert!(remote.applied_count() >= 1, "held ops dispatched after release");
}

#[tokio::test]
async fn persisted_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MockRemoteStore::new());
    let chunk = Chunk::new("doc-1", "durable");

    {
        let coordinator = Arc::new(
            SyncCoordinator::open_persistent(
                dir.path(),
                remote.clone(),
                Arc::new(ConnectivityMonitor::new(false)),
                SyncConfig::default(),
            )
            .await
            .unwrap(),
        );
        coordinator.enqueue(create_op(&chunk)).await.unwrap();
        assert_eq!(coordinator.queue_len().await, 1);
    }

    let coordinator = Arc::new(
        SyncCoordinator::open_persistent(
            dir.path(),
            remote.clone(),
            Arc::new(ConnectivityMonitor::new(true)),
            SyncConfig::default(),
        )
        .await
        .unwrap(),
    );
    assert_eq!(coordinator.queue_len().await, 1, "log replayed into memory");

    coordinator.flush().await.unwrap();
    assert_eq!(remote.applied_count(), 1);
    assert_eq!(remote.applied_ops()[0].chunk_id, chunk.chunk_id);
}

#[tokio::test]
async fn immediate_strategy_dispatches_on_enqueue() {
    let config = SyncConfig {
        strategy: DispatchStrategy::Immediate,
        ..SyncConfig::default()
    };
    let remote = Arc::new(MockRemoteStore::new());
    let coordinator = coordinator(remote.clone(), true, config);

    let chunk = Chunk::new("doc-1", "now");
    coordinator.enqueue(create_op(&chunk)).await.unwrap();
    assert_eq!(remote.applied_count(), 1);
    assert_eq!(coordinator.queue_len().await, 0);
}
