use crate::embedding::TextEmbedder;
use crate::parser::Parser;
use crate::synthesize::{synthesize, ProposedChunk};
use dashmap::DashMap;
use notemesh_core::config::IngestionConfig;
use notemesh_core::error::{ErrorKind, GatewayError, GatewayResult};
use notemesh_core::model::{sha256_hex, CascadeMode, Chunk, ChunkFlags, ChunkId, EmbeddingRef};
use notemesh_core::op::{OpBaseline, OpPayload, OpPriorities, SyncOp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use storage::{ChunkStore, VectorIndex, VectorMeta};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EMBED_QUEUE_CAPACITY: usize = 1024;

/// A pending embedding request. De-duplicated by chunk_id while queued, so at
/// most one embedding job is in flight per chunk.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub chunk_id: ChunkId,
    pub contents: String,
    pub contents_hash: String,
}

/// Producer handle for the embed queue. Bounded: a full queue surfaces a
/// retryable capacity error to the producer.
#[derive(Clone)]
pub struct EmbedService {
    tx: mpsc::Sender<EmbedJob>,
    inflight: Arc<DashMap<ChunkId, ()>>,
}

impl EmbedService {
    pub fn channel(
        store: Arc<ChunkStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn TextEmbedder>,
    ) -> (Self, EmbedWorker) {
        let (tx, rx) = mpsc::channel(EMBED_QUEUE_CAPACITY);
        let inflight = Arc::new(DashMap::new());
        (
            Self {
                tx,
                inflight: inflight.clone(),
            },
            EmbedWorker {
                rx,
                store,
                vectors,
                embedder,
                inflight,
            },
        )
    }

    pub fn enqueue(&self, job: EmbedJob) -> GatewayResult<bool> {
        if self.inflight.contains_key(&job.chunk_id) {
            return Ok(false);
        }
        self.inflight.insert(job.chunk_id, ());
        match self.tx.try_send(job) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.inflight.remove(&job.chunk_id);
                Err(GatewayError::new(
                    ErrorKind::RateLimit,
                    "EMBED_QUEUE_FULL",
                    "embed queue is at capacity",
                ))
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.inflight.remove(&job.chunk_id);
                Err(GatewayError::internal(
                    "EMBED_QUEUE_CLOSED",
                    "embed worker is gone",
                ))
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inflight.len()
    }
}

/// Consumer side: embeds queued chunks and writes vectors plus embedding
/// handles back. Failures are logged and dropped; the chunk simply stays
/// unembedded until the next content write re-queues it.
pub struct EmbedWorker {
    rx: mpsc::Receiver<EmbedJob>,
    store: Arc<ChunkStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn TextEmbedder>,
    inflight: Arc<DashMap<ChunkId, ()>>,
}

impl EmbedWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("embed worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.rx.recv() => {
                    match job {
                        Some(job) => self.process(job).await,
                        None => break,
                    }
                }
            }
        }
        info!("embed worker stopped");
    }

    /// Drain everything currently queued, then return. Test and flush support.
    pub async fn run_until_idle(&mut self) {
        while let Ok(job) = self.rx.try_recv() {
            self.process(job).await;
        }
    }

    async fn process(&mut self, job: EmbedJob) {
        let chunk_id = job.chunk_id;
        if let Err(err) = self.embed_one(&job).await {
            error!(chunk_id = %chunk_id, error = %err, "embedding failed");
        }
        self.inflight.remove(&chunk_id);
    }

    async fn embed_one(&self, job: &EmbedJob) -> GatewayResult<()> {
        let chunk = match self.store.get(job.chunk_id).await {
            Ok(chunk) => chunk,
            // Deleted while queued.
            Err(_) => return Ok(()),
        };
        if chunk.contents_hash() != job.contents_hash {
            debug!(chunk_id = %job.chunk_id, "contents changed while queued, skipping stale job");
            return Ok(());
        }

        let vectors = self
            .embedder
            .embed_text(std::slice::from_ref(&job.contents))
            .await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            GatewayError::external("EMPTY_EMBED_BATCH", "embedder returned no vectors")
        })?;

        self.vectors
            .upsert(
                job.chunk_id,
                vector,
                VectorMeta {
                    tags: chunk.tags.iter().copied().collect(),
                    document_id: chunk.document_id.clone(),
                    document_scope: chunk.document_scope,
                    last_updated: chunk.last_updated,
                },
            )
            .await?;

        let mut updated = chunk;
        updated.embedding_ref = Some(EmbeddingRef {
            model_id: self.embedder.model_id().to_string(),
            dimension: self.embedder.dimension(),
            contents_hash: job.contents_hash.clone(),
        });
        self.store.put(updated, None).await?;
        Ok(())
    }
}

/// Outcome of one ingest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub content_hash: String,
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub embeds_requested: usize,
    pub ops: Vec<SyncOp>,
    pub chunk_ids: Vec<ChunkId>,
}

/// C4: parse a document, diff against stored chunks by structural matching,
/// apply the delta, and queue embedding work. Idempotent per
/// (document_id, content_hash).
pub struct IngestionPipeline {
    store: Arc<ChunkStore>,
    vectors: Arc<dyn VectorIndex>,
    parser: Parser,
    embed: EmbedService,
    priorities: OpPriorities,
    config: IngestionConfig,
    last_ingested: DashMap<String, String>,
    idempotency: DashMap<String, IngestReport>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<ChunkStore>,
        vectors: Arc<dyn VectorIndex>,
        embed: EmbedService,
        parser: Parser,
        config: IngestionConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            parser,
            embed,
            priorities: OpPriorities::default(),
            config,
            last_ingested: DashMap::new(),
            idempotency: DashMap::new(),
        }
    }

    pub fn with_priorities(mut self, priorities: OpPriorities) -> Self {
        self.priorities = priorities;
        self
    }

    /// Ingest with an explicit idempotency key: a repeated key returns the
    /// prior outcome without re-running the pipeline.
    pub async fn ingest_keyed(
        &self,
        idempotency_key: &str,
        document_id: &str,
        text: &str,
    ) -> GatewayResult<IngestReport> {
        if let Some(report) = self.idempotency.get(idempotency_key) {
            return Ok(report.clone());
        }
        let report = self.ingest(document_id, text).await?;
        self.idempotency
            .insert(idempotency_key.to_string(), report.clone());
        Ok(report)
    }

    pub async fn ingest(&self, document_id: &str, text: &str) -> GatewayResult<IngestReport> {
        let content_hash = notemesh_core::model::sha256_hex(text.as_bytes());
        if let Some(prev) = self.last_ingested.get(document_id) {
            if *prev == content_hash {
                let existing = self
                    .store
                    .by_document(document_id, None, usize::MAX)
                    .await?;
                return Ok(IngestReport {
                    document_id: document_id.to_string(),
                    content_hash,
                    unchanged: existing.total,
                    chunk_ids: existing.chunks.iter().map(|c| c.chunk_id).collect(),
                    ..IngestReport::default()
                });
            }
        }

        let parsed = self.parser.parse(document_id, text);
        let proposals = synthesize(&parsed, &self.parser);
        let tag_ids = self.resolve_tags(&proposals).await?;

        let existing = self
            .store
            .by_document(document_id, None, usize::MAX)
            .await?
            .chunks;

        let mut report = IngestReport {
            document_id: document_id.to_string(),
            content_hash: content_hash.clone(),
            ..IngestReport::default()
        };

        let matches = match_proposals(&proposals, &existing);
        let mut final_ids: Vec<Option<ChunkId>> = vec![None; proposals.len()];
        let existing_by_id: HashMap<ChunkId, Chunk> = existing
            .iter()
            .map(|c| (c.chunk_id, c.clone()))
            .collect();

        for (idx, proposal) in proposals.iter().enumerate() {
            let resolved_tags = proposal
                .tag_names
                .iter()
                .filter_map(|name| tag_ids.get(name).copied())
                .collect();
            let parent_id = proposal.parent.map(|p| {
                final_ids[p].expect("parents are synthesized before their children")
            });

            match matches[idx] {
                Some(matched_id) => {
                    let stored = &existing_by_id[&matched_id];
                    let id = self
                        .apply_matched(&mut report, proposal, stored, parent_id, resolved_tags)
                        .await?;
                    final_ids[idx] = Some(id);
                }
                None => {
                    let id = self
                        .apply_create(&mut report, proposal, parent_id, resolved_tags, document_id)
                        .await?;
                    final_ids[idx] = Some(id);
                }
            }
        }

        // Unmatched stored chunks are gone from the document.
        let kept: Vec<ChunkId> = final_ids.iter().flatten().copied().collect();
        for stale in existing
            .iter()
            .filter(|c| !kept.contains(&c.chunk_id))
            .map(|c| c.chunk_id)
            .collect::<Vec<_>>()
        {
            if !self.store.contains(stale).await {
                continue; // already removed by an earlier cascade
            }
            self.store.delete(stale, CascadeMode::Reparent).await?;
            if let Err(err) = self.vectors.delete(stale).await {
                warn!(chunk_id = %stale, error = %err, "vector cleanup failed");
            }
            report.ops.push(SyncOp::new(
                stale,
                document_id,
                OpPayload::Delete {
                    cascade: CascadeMode::Reparent,
                },
                &self.priorities,
            ));
            report.deleted += 1;
        }

        report.chunk_ids = kept;
        sort_ops(&mut report.ops);
        self.last_ingested
            .insert(document_id.to_string(), content_hash);
        info!(
            document_id,
            created = report.created,
            updated = report.updated,
            moved = report.moved,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "ingest complete"
        );
        Ok(report)
    }

    async fn apply_create(
        &self,
        report: &mut IngestReport,
        proposal: &ProposedChunk,
        parent_id: Option<ChunkId>,
        tags: std::collections::BTreeSet<ChunkId>,
        document_id: &str,
    ) -> GatewayResult<ChunkId> {
        let mut chunk = Chunk::new(document_id, &proposal.contents);
        if proposal.is_page {
            chunk.flags = ChunkFlags::page();
            chunk.page = Some(chunk.chunk_id);
        }
        chunk.parent = parent_id;
        chunk.metadata = proposal.metadata.clone();
        chunk.position = proposal.position.clone();
        chunk.tags = tags;
        chunk.document_scope = proposal.document_scope;

        let stored = self.store.put(chunk, None).await?;
        report.ops.push(SyncOp::new(
            stored.chunk_id,
            &stored.document_id,
            OpPayload::Create {
                chunk: stored.clone(),
            },
            &self.priorities,
        ));
        report.created += 1;
        self.request_embed(report, &stored);
        Ok(stored.chunk_id)
    }

    async fn apply_matched(
        &self,
        report: &mut IngestReport,
        proposal: &ProposedChunk,
        stored: &Chunk,
        parent_id: Option<ChunkId>,
        tags: std::collections::BTreeSet<ChunkId>,
    ) -> GatewayResult<ChunkId> {
        let content_changed = stored.contents != proposal.contents;
        let meta_changed = stored.metadata != proposal.metadata || stored.tags != tags;
        let parent_changed = stored.parent != parent_id;
        let position_changed = stored.position != proposal.position;

        if !content_changed && !meta_changed && !parent_changed {
            if position_changed {
                // Position drift alone: the id stays, the span moves, no op.
                let mut repositioned = stored.clone();
                repositioned.position = proposal.position.clone();
                self.store.put(repositioned, None).await?;
            }
            report.unchanged += 1;
            return Ok(stored.chunk_id);
        }

        if parent_changed && !content_changed && !meta_changed {
            self.store.move_chunk(stored.chunk_id, parent_id).await?;
            if position_changed {
                let mut repositioned = self.store.get(stored.chunk_id).await?;
                repositioned.position = proposal.position.clone();
                self.store.put(repositioned, None).await?;
            }
            report.ops.push(SyncOp::new(
                stored.chunk_id,
                &stored.document_id,
                OpPayload::Move {
                    new_parent: parent_id,
                },
                &self.priorities,
            ));
            report.moved += 1;
            return Ok(stored.chunk_id);
        }

        // Content or metadata drift (possibly with a parent change): update.
        let baseline_version = self.store.version_of(stored.chunk_id).await;
        let baseline = OpBaseline::of(stored, baseline_version);

        if content_changed {
            // The old vector must be gone before a new one can land.
            if let Err(err) = self.vectors.delete(stored.chunk_id).await {
                warn!(chunk_id = %stored.chunk_id, error = %err, "vector invalidation failed");
            }
        }

        let mut updated = stored.clone();
        updated.contents = proposal.contents.clone();
        updated.metadata = proposal.metadata.clone();
        updated.tags = tags;
        updated.parent = parent_id;
        updated.position = proposal.position.clone();
        updated.touch();
        let updated = self.store.put(updated, None).await?;

        report.ops.push(SyncOp::new(
            updated.chunk_id,
            &updated.document_id,
            OpPayload::Update {
                chunk: updated.clone(),
                baseline: Some(baseline),
            },
            &self.priorities,
        ));
        report.updated += 1;
        if content_changed {
            self.request_embed(report, &updated);
        }
        Ok(updated.chunk_id)
    }

    fn request_embed(&self, report: &mut IngestReport, chunk: &Chunk) {
        if chunk.contents.trim().is_empty() || chunk.flags.is_tag {
            return;
        }
        match self.embed.enqueue(EmbedJob {
            chunk_id: chunk.chunk_id,
            contents: chunk.contents.clone(),
            contents_hash: chunk.contents_hash(),
        }) {
            Ok(true) => report.embeds_requested += 1,
            Ok(false) => {}
            Err(err) => warn!(chunk_id = %chunk.chunk_id, error = %err, "embed enqueue rejected"),
        }
    }

    async fn resolve_tags(
        &self,
        proposals: &[ProposedChunk],
    ) -> GatewayResult<HashMap<String, ChunkId>> {
        let mut out = HashMap::new();
        for proposal in proposals {
            for name in &proposal.tag_names {
                if out.contains_key(name) {
                    continue;
                }
                let tag_doc = format!("tag:{name}");
                let existing = self.store.by_document(&tag_doc, None, 1).await?;
                if let Some(tag) = existing.chunks.first() {
                    out.insert(name.clone(), tag.chunk_id);
                } else if self.config.auto_create_tags {
                    let tag = self.store.put(Chunk::new_tag(name.clone()), None).await?;
                    out.insert(name.clone(), tag.chunk_id);
                }
            }
        }
        Ok(out)
    }
}

/// Structural matching. Primary key (parent fingerprint, kind, normalized
/// contents hash); later passes relax the key one facet at a time, pairing in
/// position order so positional proximity breaks ties.
fn match_proposals(proposals: &[ProposedChunk], existing: &[Chunk]) -> Vec<Option<ChunkId>> {
    let mut matches: Vec<Option<ChunkId>> = vec![None; proposals.len()];
    let mut taken: Vec<bool> = vec![false; existing.len()];

    let existing_page = existing.iter().position(|c| c.flags.is_page);
    if let Some(page_idx) = existing_page {
        matches[0] = Some(existing[page_idx].chunk_id);
        taken[page_idx] = true;
    }

    let existing_by_id: HashMap<ChunkId, &Chunk> =
        existing.iter().map(|c| (c.chunk_id, c)).collect();
    let page_id = existing_page.map(|i| existing[i].chunk_id);

    let stored_keys: Vec<[String; 4]> = existing
        .iter()
        .map(|chunk| {
            let fp = match chunk.parent {
                None => "page".to_string(),
                Some(parent) if Some(parent) == page_id => "page".to_string(),
                Some(parent) => existing_by_id
                    .get(&parent)
                    .map(|p| p.normalized_contents_hash())
                    .unwrap_or_else(|| "page".to_string()),
            };
            let kind = format!("{:?}", chunk.block_kind());
            let hash = chunk.normalized_contents_hash();
            [
                format!("{fp}|{kind}|{hash}"),
                format!("{kind}|{hash}"),
                format!("{fp}|{kind}"),
                kind,
            ]
        })
        .collect();

    let proposal_keys: Vec<[String; 4]> = proposals
        .iter()
        .map(|proposal| {
            let fp = match proposal.parent {
                None | Some(0) => "page".to_string(),
                Some(idx) => sha256_hex(
                    notemesh_core::model::normalize_whitespace(&proposals[idx].contents)
                        .as_bytes(),
                ),
            };
            let kind = format!("{:?}", proposal.kind);
            let hash = sha256_hex(
                notemesh_core::model::normalize_whitespace(&proposal.contents).as_bytes(),
            );
            [
                format!("{fp}|{kind}|{hash}"),
                format!("{kind}|{hash}"),
                format!("{fp}|{kind}"),
                kind,
            ]
        })
        .collect();

    for pass in 0..4 {
        let mut pool: HashMap<&str, VecDeque<usize>> = HashMap::new();
        for (i, chunk) in existing.iter().enumerate() {
            if taken[i] || chunk.flags.is_page {
                continue;
            }
            pool.entry(stored_keys[i][pass].as_str())
                .or_default()
                .push_back(i);
        }
        for (idx, _) in proposals.iter().enumerate() {
            if idx == 0 || matches[idx].is_some() {
                continue;
            }
            if let Some(queue) = pool.get_mut(proposal_keys[idx][pass].as_str()) {
                if let Some(stored_idx) = queue.pop_front() {
                    matches[idx] = Some(existing[stored_idx].chunk_id);
                    taken[stored_idx] = true;
                }
            }
        }
    }

    matches
}

fn sort_ops(ops: &mut [SyncOp]) {
    ops.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
    });
}
