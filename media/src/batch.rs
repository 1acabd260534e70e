use crate::library::{MediaLibrary, UploadOptions, UploadOutcome};
use bytes::Bytes;
use notemesh_core::error::GatewayResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub name: String,
    pub bytes: Bytes,
    pub mime_type: String,
    pub options: UploadOptions,
}

/// Per-batch progress pushed to subscribers after every finished item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemFailure {
    pub index: usize,
    pub name: String,
    pub error_code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<UploadOutcome>,
    pub failed: Vec<BatchItemFailure>,
}

/// Bounded-concurrency batch uploader. Per-item failures are collected, not
/// fatal; the pool drains (or cancels) before the report is returned.
pub struct BatchProcessor {
    library: Arc<MediaLibrary>,
    concurrency: usize,
}

impl BatchProcessor {
    pub fn new(library: Arc<MediaLibrary>, concurrency: usize) -> Self {
        Self {
            library,
            concurrency: concurrency.max(1),
        }
    }

    /// Kick off a batch. Returns a progress receiver immediately and a handle
    /// resolving to the final report.
    pub fn start(
        &self,
        tasks: Vec<UploadTask>,
        cancel: CancellationToken,
    ) -> (
        watch::Receiver<BatchProgress>,
        tokio::task::JoinHandle<BatchReport>,
    ) {
        let total = tasks.len();
        let (progress_tx, progress_rx) = watch::channel(BatchProgress {
            total,
            ..BatchProgress::default()
        });
        let library = self.library.clone();
        let concurrency = self.concurrency;

        let handle = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut pool: JoinSet<(usize, String, GatewayResult<UploadOutcome>)> = JoinSet::new();

            for (index, task) in tasks.into_iter().enumerate() {
                let library = library.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                pool.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    if cancel.is_cancelled() {
                        return (
                            index,
                            task.name.clone(),
                            Err(notemesh_core::error::GatewayError::cancelled()),
                        );
                    }
                    let outcome = library
                        .upload(task.bytes, &task.mime_type, &task.options)
                        .await;
                    (index, task.name, outcome)
                });
            }

            let mut report = BatchReport::default();
            let mut done = 0usize;
            while let Some(joined) = pool.join_next().await {
                let Ok((index, name, outcome)) = joined else {
                    continue;
                };
                done += 1;
                match outcome {
                    Ok(success) => report.succeeded.push(success),
                    Err(err) => {
                        warn!(item = %name, error = %err, "batch upload item failed");
                        report.failed.push(BatchItemFailure {
                            index,
                            name: name.clone(),
                            error_code: err.code.clone(),
                            message: err.message.clone(),
                        });
                    }
                }
                let _ = progress_tx.send(BatchProgress {
                    total,
                    done,
                    failed: report.failed.len(),
                    current: Some(name),
                });
            }

            info!(
                total,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "batch upload complete"
            );
            report
        });

        (progress_rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::vision::{HashingImageEmbedder, MockVisionService};
    use storage::{ChunkStore, InMemoryVectorIndex};

    fn library() -> Arc<MediaLibrary> {
        Arc::new(MediaLibrary::new(
            Arc::new(ChunkStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(MockVisionService),
            Arc::new(HashingImageEmbedder::default()),
            Arc::new(InMemoryVectorIndex::new()),
        ))
    }

    fn task(name: &str, payload: &'static [u8]) -> UploadTask {
        UploadTask {
            name: name.to_string(),
            bytes: Bytes::from_static(payload),
            mime_type: "image/png".to_string(),
            options: UploadOptions {
                analyze: true,
                embed: true,
                document_id: None,
            },
        }
    }

    #[tokio::test]
    async fn batch_reports_progress_and_collects_results() {
        let processor = BatchProcessor::new(library(), 3);
        let tasks = vec![task("a", b"aaa"), task("b", b"bbb"), task("c", b"ccc")];

        let (mut progress, handle) = processor.start(tasks, CancellationToken::new());
        let report = handle.await.unwrap();

        assert_eq!(report.succeeded.len(), 3);
        assert!(report.failed.is_empty());

        let last = progress.borrow_and_update().clone();
        assert_eq!(last.total, 3);
        assert_eq!(last.done, 3);
        assert_eq!(last.failed, 0);
    }

    #[tokio::test]
    async fn duplicate_content_within_batch_is_deduplicated() {
        let library = library();
        let processor = BatchProcessor::new(library.clone(), 1);
        let tasks = vec![task("one", b"same-bytes"), task("two", b"same-bytes")];

        let (_progress, handle) = processor.start(tasks, CancellationToken::new());
        let report = handle.await.unwrap();

        assert_eq!(report.succeeded.len(), 2);
        assert!(report.succeeded.iter().any(|o| o.reused));
        let ids: std::collections::HashSet<_> =
            report.succeeded.iter().map(|o| o.chunk_id).collect();
        assert_eq!(ids.len(), 1, "both uploads share one chunk");
    }

    #[tokio::test]
    async fn cancelled_batch_fails_remaining_items() {
        let processor = BatchProcessor::new(library(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_progress, handle) = processor.start(vec![task("a", b"zzz")], cancel);
        let report = handle.await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].error_code, "CANCELLED");
    }
}
