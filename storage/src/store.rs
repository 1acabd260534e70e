use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notemesh_core::error::{GatewayError, GatewayResult};
use notemesh_core::model::{BlockKind, CascadeMode, Chunk, ChunkId, DocumentScope};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Maximum ancestor hops before a parent chain is considered malformed.
pub const MAX_ANCESTOR_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagLogic {
    And,
    Or,
}

#[derive(Debug, Clone, Default)]
pub struct TagFilters {
    pub document_id: Option<String>,
    pub document_scope: Option<DocumentScope>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl TagFilters {
    fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(doc) = &self.document_id {
            if &chunk.document_id != doc {
                return false;
            }
        }
        if let Some(scope) = self.document_scope {
            if chunk.document_scope != scope {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if chunk.last_updated < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if chunk.last_updated > before {
                return false;
            }
        }
        true
    }
}

/// Result of a delete: what was tombstoned, what was re-parented, and which
/// surviving chunks now hold a dangling `ref` edge (reported, never auto-fixed).
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted: Vec<ChunkId>,
    pub reparented: Vec<ChunkId>,
    pub dangling_refs: Vec<ChunkId>,
}

#[derive(Debug, Clone)]
pub struct DocumentPage {
    pub chunks: Vec<Chunk>,
    pub next_cursor: Option<String>,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct Stored {
    chunk: Chunk,
    version: u64,
}

#[derive(Default)]
struct StoreState {
    chunks: HashMap<ChunkId, Stored>,
    tombstones: HashSet<ChunkId>,
    children: HashMap<ChunkId, HashSet<ChunkId>>,
    by_page: HashMap<ChunkId, HashSet<ChunkId>>,
    by_tag: HashMap<ChunkId, HashSet<ChunkId>>,
    by_document: HashMap<String, HashSet<ChunkId>>,
    incoming_refs: HashMap<ChunkId, HashSet<ChunkId>>,
}

/// The chunk store: one record type for pages, headings, paragraphs, bullets,
/// tags, templates, and images, plus the indices that keep the forest
/// queryable. All mutations for one `document_id` are serialized via a
/// per-document advisory lock; lock order is document-lock then state-lock.
pub struct ChunkStore {
    state: Arc<RwLock<StoreState>>,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
    tag_inheritance: bool,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::with_tag_inheritance(false)
    }

    pub fn with_tag_inheritance(tag_inheritance: bool) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            doc_locks: DashMap::new(),
            tag_inheritance,
        }
    }

    /// Advisory lock serializing all writes for one document.
    pub fn doc_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.doc_locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cheap liveness probe used by readiness checks.
    pub async fn ping(&self) -> GatewayResult<usize> {
        Ok(self.state.read().await.chunks.len())
    }

    /// Upsert by chunk_id. Fails with `conflict` when `expected_version` is
    /// supplied and stale. `chunk_id`, `created_time`, and `document_id` are
    /// immutable; `page` is re-derived from the parent chain.
    pub async fn put(&self, chunk: Chunk, expected_version: Option<u64>) -> GatewayResult<Chunk> {
        let lock = self.doc_lock(&chunk.document_id);
        let _doc_guard = lock.lock().await;
        let mut state = self.state.write().await;
        self.put_locked(&mut state, chunk, expected_version)
    }

    fn put_locked(
        &self,
        state: &mut StoreState,
        mut chunk: Chunk,
        expected_version: Option<u64>,
    ) -> GatewayResult<Chunk> {
        if state.tombstones.contains(&chunk.chunk_id) {
            return Err(GatewayError::conflict(
                "CHUNK_TOMBSTONED",
                format!("chunk {} was deleted and ids are never reused", chunk.chunk_id),
            ));
        }

        let prior = state
            .chunks
            .get(&chunk.chunk_id)
            .map(|s| (s.version, s.chunk.created_time, s.chunk.document_id.clone()));
        if let Some((version, created_time, document_id)) = &prior {
            if let Some(expected) = expected_version {
                if expected != *version {
                    return Err(GatewayError::conflict(
                        "STALE_VERSION",
                        format!(
                            "chunk {} is at version {}, caller expected {}",
                            chunk.chunk_id, version, expected
                        ),
                    ));
                }
            }
            if document_id != &chunk.document_id {
                return Err(GatewayError::validation(
                    "IMMUTABLE_FIELD",
                    "document_id cannot change after creation",
                ));
            }
            // Server-assigned, never client-writable.
            chunk.created_time = *created_time;
        }

        self.validate(state, &chunk)?;
        chunk.page = self.derive_page(state, &chunk)?;

        // Invariant: a stored embedding handle always matches current contents.
        if let Some(embedding) = &chunk.embedding_ref {
            if embedding.contents_hash != chunk.contents_hash() {
                chunk.embedding_ref = None;
            }
        }

        let version = prior.map(|(v, _, _)| v + 1).unwrap_or(1);
        let old = state.chunks.get(&chunk.chunk_id).map(|s| s.chunk.clone());
        if let Some(old) = old {
            unindex(state, &old);
        }
        index(state, &chunk);
        state.chunks.insert(
            chunk.chunk_id,
            Stored {
                chunk: chunk.clone(),
                version,
            },
        );

        if self.tag_inheritance {
            self.rematerialize_subtree_tags(state, chunk.chunk_id);
        }

        Ok(chunk)
    }

    pub async fn get(&self, id: ChunkId) -> GatewayResult<Chunk> {
        let state = self.state.read().await;
        state
            .chunks
            .get(&id)
            .map(|s| s.chunk.clone())
            .ok_or_else(|| chunk_not_found(id))
    }

    /// Dense read: every id must resolve or the whole call fails not_found.
    pub async fn get_many(&self, ids: &[ChunkId]) -> GatewayResult<Vec<Chunk>> {
        let state = self.state.read().await;
        ids.iter()
            .map(|id| {
                state
                    .chunks
                    .get(id)
                    .map(|s| s.chunk.clone())
                    .ok_or_else(|| chunk_not_found(*id))
            })
            .collect()
    }

    pub async fn version_of(&self, id: ChunkId) -> Option<u64> {
        self.state.read().await.chunks.get(&id).map(|s| s.version)
    }

    pub async fn contains(&self, id: ChunkId) -> bool {
        self.state.read().await.chunks.contains_key(&id)
    }

    /// Direct children, ordered by position then created_time.
    pub async fn children(&self, parent_id: ChunkId) -> GatewayResult<Vec<Chunk>> {
        let state = self.state.read().await;
        if !state.chunks.contains_key(&parent_id) {
            return Err(chunk_not_found(parent_id));
        }
        let mut out: Vec<Chunk> = state
            .children
            .get(&parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.chunks.get(id).map(|s| s.chunk.clone()))
            .collect();
        sort_by_position(&mut out);
        Ok(out)
    }

    /// Breadth-first subtree walk bounded by `max_depth`, each level ordered
    /// by position then created_time.
    pub async fn descendants(
        &self,
        parent_id: ChunkId,
        max_depth: usize,
    ) -> GatewayResult<Vec<Chunk>> {
        let state = self.state.read().await;
        if !state.chunks.contains_key(&parent_id) {
            return Err(chunk_not_found(parent_id));
        }
        let ids = collect_subtree(&state, parent_id, max_depth);
        let mut out: Vec<Chunk> = ids
            .into_iter()
            .filter(|id| *id != parent_id)
            .filter_map(|id| state.chunks.get(&id).map(|s| s.chunk.clone()))
            .collect();
        sort_by_position(&mut out);
        Ok(out)
    }

    /// Paginated, position-ordered read of a whole document.
    pub async fn by_document(
        &self,
        document_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> GatewayResult<DocumentPage> {
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = state
            .by_document
            .get(document_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.chunks.get(id).map(|s| s.chunk.clone()))
            .collect();
        sort_by_position(&mut chunks);
        let total = chunks.len();

        let start = match cursor {
            Some(raw) => {
                let after = parse_document_cursor(raw)?;
                chunks
                    .iter()
                    .position(|c| c.chunk_id == after)
                    .map(|i| i + 1)
                    .unwrap_or(0)
            }
            None => 0,
        };

        let page: Vec<Chunk> = chunks.into_iter().skip(start).take(limit.max(1)).collect();
        let next_cursor = if start + page.len() < total {
            page.last().map(|c| c.chunk_id.to_string())
        } else {
            None
        };

        Ok(DocumentPage {
            chunks: page,
            next_cursor,
            total,
        })
    }

    /// Ids matching the tag set expression, filtered, in stable
    /// (last_updated desc, chunk_id asc) order.
    pub async fn by_tags(
        &self,
        tag_ids: &[ChunkId],
        logic: TagLogic,
        filters: &TagFilters,
    ) -> GatewayResult<Vec<ChunkId>> {
        let state = self.state.read().await;
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sets = tag_ids
            .iter()
            .map(|tag| state.by_tag.get(tag).cloned().unwrap_or_default());

        let mut candidates: HashSet<ChunkId> = match logic {
            TagLogic::And => {
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, set| &acc & &set)
            }
            TagLogic::Or => sets.fold(HashSet::new(), |acc, set| &acc | &set),
        };
        candidates.retain(|id| {
            state
                .chunks
                .get(id)
                .map(|s| filters.matches(&s.chunk))
                .unwrap_or(false)
        });

        let mut out: Vec<ChunkId> = candidates.into_iter().collect();
        out.sort_by(|a, b| {
            let ta = state.chunks.get(a).map(|s| s.chunk.last_updated);
            let tb = state.chunks.get(b).map(|s| s.chunk.last_updated);
            tb.cmp(&ta).then_with(|| a.cmp(b))
        });
        Ok(out)
    }

    /// How many of the given tags each candidate carries; used for tag-match
    /// scoring in retrieval.
    pub async fn tag_match_counts(
        &self,
        candidates: &[ChunkId],
        tag_ids: &[ChunkId],
    ) -> HashMap<ChunkId, usize> {
        let state = self.state.read().await;
        candidates
            .iter()
            .map(|id| {
                let count = tag_ids
                    .iter()
                    .filter(|tag| {
                        state
                            .by_tag
                            .get(tag)
                            .map(|set| set.contains(id))
                            .unwrap_or(false)
                    })
                    .count();
                (*id, count)
            })
            .collect()
    }

    /// Filtered scan over all live chunks in position order. Backs the
    /// fulltext fallback path.
    pub async fn scan(&self, filters: &TagFilters) -> Vec<Chunk> {
        let state = self.state.read().await;
        let mut out: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|s| filters.matches(&s.chunk))
            .map(|s| s.chunk.clone())
            .collect();
        sort_by_position(&mut out);
        out
    }

    /// Re-parent a chunk. Rejects moves that would create a cycle (checked by
    /// walking the new parent's ancestors, O(depth)); re-derives `page` for
    /// the whole moved subtree, O(subtree size).
    pub async fn move_chunk(
        &self,
        id: ChunkId,
        new_parent: Option<ChunkId>,
    ) -> GatewayResult<Chunk> {
        let document_id = self.get(id).await?.document_id;
        let lock = self.doc_lock(&document_id);
        let _doc_guard = lock.lock().await;
        let mut state = self.state.write().await;

        let stored = state
            .chunks
            .get(&id)
            .ok_or_else(|| chunk_not_found(id))?
            .clone();
        if stored.chunk.flags.is_page {
            return Err(GatewayError::validation(
                "PAGE_MOVE",
                "a page chunk is a root and cannot be re-parented",
            ));
        }

        if let Some(parent_id) = new_parent {
            if parent_id == id {
                return Err(cyclic_move(id));
            }
            if !state.chunks.contains_key(&parent_id) {
                return Err(chunk_not_found(parent_id));
            }
            // Walk the prospective ancestor chain; finding ourselves means a cycle.
            let mut current = Some(parent_id);
            let mut hops = 0;
            while let Some(ancestor) = current {
                if ancestor == id {
                    return Err(cyclic_move(id));
                }
                hops += 1;
                if hops > MAX_ANCESTOR_DEPTH {
                    return Err(GatewayError::validation(
                        "ANCESTRY_TOO_DEEP",
                        format!("ancestor chain exceeds {} hops", MAX_ANCESTOR_DEPTH),
                    ));
                }
                current = state.chunks.get(&ancestor).and_then(|s| s.chunk.parent);
            }
        }

        let mut updated = stored.chunk.clone();
        unindex(&mut state, &updated);
        updated.parent = new_parent;
        updated.touch();
        updated.page = self.derive_page(&state, &updated)?;
        index(&mut state, &updated);
        let version = stored.version + 1;
        state.chunks.insert(
            id,
            Stored {
                chunk: updated.clone(),
                version,
            },
        );

        self.repage_subtree(&mut state, id);
        if self.tag_inheritance {
            self.rematerialize_subtree_tags(&mut state, id);
        }

        Ok(updated)
    }

    /// Tombstone a chunk. `Reparent` hands children to the deleted chunk's
    /// parent; `Subtree` deletes transitively. Incoming `ref` edges from
    /// survivors become dangling and are reported.
    pub async fn delete(&self, id: ChunkId, cascade: CascadeMode) -> GatewayResult<DeleteOutcome> {
        let document_id = self.get(id).await?.document_id;
        let lock = self.doc_lock(&document_id);
        let _doc_guard = lock.lock().await;
        let mut state = self.state.write().await;

        let stored = state
            .chunks
            .get(&id)
            .ok_or_else(|| chunk_not_found(id))?
            .clone();

        let doomed: Vec<ChunkId> = match cascade {
            CascadeMode::Reparent => vec![id],
            CascadeMode::Subtree => collect_subtree(&state, id, MAX_ANCESTOR_DEPTH),
        };
        let doomed_set: HashSet<ChunkId> = doomed.iter().copied().collect();

        let mut outcome = DeleteOutcome::default();

        if cascade == CascadeMode::Reparent {
            let children: Vec<ChunkId> = state
                .children
                .get(&id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for child_id in children {
                if let Some(child_stored) = state.chunks.get(&child_id).cloned() {
                    let mut child = child_stored.chunk;
                    unindex(&mut state, &child);
                    child.parent = stored.chunk.parent;
                    child.touch();
                    child.page = self.derive_page(&state, &child)?;
                    index(&mut state, &child);
                    state.chunks.insert(
                        child_id,
                        Stored {
                            chunk: child,
                            version: child_stored.version + 1,
                        },
                    );
                    self.repage_subtree(&mut state, child_id);
                    if self.tag_inheritance {
                        self.rematerialize_subtree_tags(&mut state, child_id);
                    }
                    outcome.reparented.push(child_id);
                }
            }
        }

        for doomed_id in &doomed {
            if let Some(stored) = state.chunks.remove(doomed_id) {
                unindex(&mut state, &stored.chunk);
                // Deleting a tag chunk detaches it from every referencing
                // chunk; nothing cascades onto them.
                if stored.chunk.flags.is_tag {
                    if let Some(referencing) = state.by_tag.remove(doomed_id) {
                        for chunk_id in referencing {
                            if let Some(entry) = state.chunks.get_mut(&chunk_id) {
                                entry.chunk.tags.remove(doomed_id);
                                entry.version += 1;
                            }
                        }
                    }
                }
                // The materialized tag closure may hold inherited entries
                // beyond the chunk's direct tags.
                for set in state.by_tag.values_mut() {
                    set.remove(doomed_id);
                }
                state.tombstones.insert(*doomed_id);
                outcome.deleted.push(*doomed_id);
            }
        }

        // Survivors whose ref now points into the tombstones.
        let mut dangling: HashSet<ChunkId> = HashSet::new();
        for doomed_id in &doomed {
            if let Some(sources) = state.incoming_refs.get(doomed_id) {
                dangling.extend(sources.iter().filter(|s| !doomed_set.contains(s)));
            }
        }
        outcome.dangling_refs = dangling.into_iter().collect();
        outcome.dangling_refs.sort();
        if !outcome.dangling_refs.is_empty() {
            warn!(
                deleted = %id,
                dangling = outcome.dangling_refs.len(),
                "delete left dangling ref edges"
            );
        }

        Ok(outcome)
    }

    /// Check the tag-integrity and hierarchy invariants for every stored
    /// chunk; returns violations as strings. Test support.
    pub async fn check_invariants(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut violations = Vec::new();

        for (id, stored) in &state.chunks {
            let chunk = &stored.chunk;
            // Roots reachable within the depth bound, no self-ancestry.
            let mut current = chunk.parent;
            let mut hops = 0;
            while let Some(ancestor) = current {
                if ancestor == *id {
                    violations.push(format!("chunk {id} is its own ancestor"));
                    break;
                }
                hops += 1;
                if hops > MAX_ANCESTOR_DEPTH {
                    violations.push(format!("chunk {id} exceeds the ancestor depth bound"));
                    break;
                }
                current = state.chunks.get(&ancestor).and_then(|s| s.chunk.parent);
            }

            if let Some(page_id) = chunk.page {
                match state.chunks.get(&page_id) {
                    Some(page) if page.chunk.flags.is_page => {}
                    _ => violations.push(format!("chunk {id} points at a non-page page {page_id}")),
                }
            }

            for tag in &chunk.tags {
                match state.chunks.get(tag) {
                    Some(t) if t.chunk.flags.is_tag => {}
                    _ => violations.push(format!("chunk {id} carries a non-tag tag {tag}")),
                }
            }

            if chunk.flags.is_page && (chunk.parent.is_some() || chunk.page != Some(*id)) {
                violations.push(format!("page chunk {id} violates flag exclusivity"));
            }
        }

        violations
    }

    fn validate(&self, state: &StoreState, chunk: &Chunk) -> GatewayResult<()> {
        if chunk.flags.is_page {
            if chunk.parent.is_some() {
                return Err(GatewayError::validation(
                    "PAGE_WITH_PARENT",
                    "is_page requires parent = nil",
                ));
            }
            if chunk.page.is_some() && chunk.page != Some(chunk.chunk_id) {
                return Err(GatewayError::validation(
                    "PAGE_SELF_REFERENCE",
                    "a page chunk's page must be itself",
                ));
            }
        }

        if let Some(parent_id) = chunk.parent {
            if parent_id == chunk.chunk_id {
                return Err(cyclic_move(chunk.chunk_id));
            }
            let parent = state
                .chunks
                .get(&parent_id)
                .ok_or_else(|| chunk_not_found(parent_id))?;
            if chunk.flags.is_slot && !parent.chunk.flags.is_template {
                return Err(GatewayError::validation(
                    "SLOT_OUTSIDE_TEMPLATE",
                    "is_slot requires a template parent",
                ));
            }
            // Cycle + depth check through the prospective chain.
            let mut current = Some(parent_id);
            let mut hops = 0;
            while let Some(ancestor) = current {
                if ancestor == chunk.chunk_id {
                    return Err(cyclic_move(chunk.chunk_id));
                }
                hops += 1;
                if hops > MAX_ANCESTOR_DEPTH {
                    return Err(GatewayError::validation(
                        "ANCESTRY_TOO_DEEP",
                        format!("ancestor chain exceeds {} hops", MAX_ANCESTOR_DEPTH),
                    ));
                }
                current = state.chunks.get(&ancestor).and_then(|s| s.chunk.parent);
            }
        } else if chunk.flags.is_slot {
            return Err(GatewayError::validation(
                "SLOT_OUTSIDE_TEMPLATE",
                "is_slot requires a template parent",
            ));
        }

        for tag in &chunk.tags {
            let tag_chunk = state
                .chunks
                .get(tag)
                .ok_or_else(|| GatewayError::validation(
                    "UNKNOWN_TAG",
                    format!("tag {tag} does not exist"),
                ))?;
            if !tag_chunk.chunk.flags.is_tag {
                return Err(GatewayError::validation(
                    "NOT_A_TAG",
                    format!("chunk {tag} is not a tag chunk"),
                ));
            }
        }

        Ok(())
    }

    fn derive_page(&self, state: &StoreState, chunk: &Chunk) -> GatewayResult<Option<ChunkId>> {
        if chunk.flags.is_page {
            return Ok(Some(chunk.chunk_id));
        }
        let mut current = chunk.parent;
        let mut hops = 0;
        while let Some(ancestor) = current {
            let stored = state
                .chunks
                .get(&ancestor)
                .ok_or_else(|| chunk_not_found(ancestor))?;
            if stored.chunk.flags.is_page {
                return Ok(Some(ancestor));
            }
            hops += 1;
            if hops > MAX_ANCESTOR_DEPTH {
                return Err(GatewayError::validation(
                    "ANCESTRY_TOO_DEEP",
                    format!("ancestor chain exceeds {} hops", MAX_ANCESTOR_DEPTH),
                ));
            }
            current = stored.chunk.parent;
        }
        Ok(None)
    }

    /// Recompute `page` for every descendant of `root`. O(subtree size).
    fn repage_subtree(&self, state: &mut StoreState, root: ChunkId) {
        let members = collect_subtree(state, root, MAX_ANCESTOR_DEPTH);
        for id in members {
            if id == root {
                continue;
            }
            let Some(stored) = state.chunks.get(&id).cloned() else {
                continue;
            };
            let derived = match self.derive_page(state, &stored.chunk) {
                Ok(page) => page,
                Err(_) => None,
            };
            if derived != stored.chunk.page {
                let mut chunk = stored.chunk;
                unindex(state, &chunk);
                chunk.page = derived;
                index(state, &chunk);
                state.chunks.insert(
                    id,
                    Stored {
                        chunk,
                        version: stored.version + 1,
                    },
                );
            }
        }
    }

    /// Rebuild the materialized tag closure for a subtree: each member is
    /// indexed under its own tags plus every ancestor's tags.
    fn rematerialize_subtree_tags(&self, state: &mut StoreState, root: ChunkId) {
        let members = collect_subtree(state, root, MAX_ANCESTOR_DEPTH);
        for id in &members {
            for set in state.by_tag.values_mut() {
                set.remove(id);
            }
        }
        for id in members {
            let effective = effective_tags(state, id);
            for tag in effective {
                state.by_tag.entry(tag).or_default().insert(id);
            }
        }
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

fn chunk_not_found(id: ChunkId) -> GatewayError {
    GatewayError::not_found("CHUNK_NOT_FOUND", format!("chunk {id} does not exist"))
}

fn cyclic_move(id: ChunkId) -> GatewayError {
    GatewayError::validation(
        "CYCLIC_MOVE",
        format!("re-parenting {id} would create an ownership cycle"),
    )
}

fn index(state: &mut StoreState, chunk: &Chunk) {
    if let Some(parent) = chunk.parent {
        state.children.entry(parent).or_default().insert(chunk.chunk_id);
    }
    if let Some(page) = chunk.page {
        state.by_page.entry(page).or_default().insert(chunk.chunk_id);
    }
    for tag in &chunk.tags {
        state.by_tag.entry(*tag).or_default().insert(chunk.chunk_id);
    }
    state
        .by_document
        .entry(chunk.document_id.clone())
        .or_default()
        .insert(chunk.chunk_id);
    if let Some(target) = chunk.ref_id {
        state
            .incoming_refs
            .entry(target)
            .or_default()
            .insert(chunk.chunk_id);
    }
}

fn unindex(state: &mut StoreState, chunk: &Chunk) {
    if let Some(parent) = chunk.parent {
        if let Some(set) = state.children.get_mut(&parent) {
            set.remove(&chunk.chunk_id);
        }
    }
    if let Some(page) = chunk.page {
        if let Some(set) = state.by_page.get_mut(&page) {
            set.remove(&chunk.chunk_id);
        }
    }
    for tag in &chunk.tags {
        if let Some(set) = state.by_tag.get_mut(tag) {
            set.remove(&chunk.chunk_id);
        }
    }
    if let Some(set) = state.by_document.get_mut(&chunk.document_id) {
        set.remove(&chunk.chunk_id);
    }
    if let Some(target) = chunk.ref_id {
        if let Some(set) = state.incoming_refs.get_mut(&target) {
            set.remove(&chunk.chunk_id);
        }
    }
}

/// Breadth-first id walk from `root` (inclusive), bounded by `max_depth`.
fn collect_subtree(state: &StoreState, root: ChunkId, max_depth: usize) -> Vec<ChunkId> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::new();
    frontier.push_back((root, 0usize));
    seen.insert(root);

    while let Some((id, depth)) = frontier.pop_front() {
        out.push(id);
        if depth >= max_depth {
            continue;
        }
        if let Some(children) = state.children.get(&id) {
            let mut ordered: Vec<ChunkId> = children.iter().copied().collect();
            ordered.sort();
            for child in ordered {
                if seen.insert(child) {
                    frontier.push_back((child, depth + 1));
                }
            }
        }
    }
    out
}

/// Own tags plus every ancestor's tags, bounded by the depth limit.
fn effective_tags(state: &StoreState, id: ChunkId) -> HashSet<ChunkId> {
    let mut tags = HashSet::new();
    let mut current = Some(id);
    let mut hops = 0;
    while let Some(chunk_id) = current {
        let Some(stored) = state.chunks.get(&chunk_id) else {
            break;
        };
        tags.extend(stored.chunk.tags.iter().copied());
        hops += 1;
        if hops > MAX_ANCESTOR_DEPTH {
            break;
        }
        current = stored.chunk.parent;
    }
    tags
}

fn sort_by_position(chunks: &mut [Chunk]) {
    chunks.sort_by(|a, b| {
        let ka = a.position.as_ref().map(|p| p.sort_key()).unwrap_or((0, 0));
        let kb = b.position.as_ref().map(|p| p.sort_key()).unwrap_or((0, 0));
        ka.cmp(&kb)
            .then_with(|| a.created_time.cmp(&b.created_time))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

fn parse_document_cursor(raw: &str) -> GatewayResult<ChunkId> {
    raw.parse::<ChunkId>().map_err(|_| {
        GatewayError::validation("BAD_CURSOR", format!("malformed page cursor '{raw}'"))
    })
}

/// Render a document back to its markup from position-ordered chunks.
/// Concatenation of contents plus inherited structure reconstructs the
/// original modulo whitespace normalization (invariant 8).
pub fn render_document(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        if chunk.flags.is_page {
            continue;
        }
        match chunk.block_kind() {
            Some(BlockKind::Heading) => {
                let level = chunk.metadata.heading_level.unwrap_or(1) as usize;
                out.push_str(&"#".repeat(level.clamp(1, 6)));
                out.push(' ');
                out.push_str(&chunk.contents);
            }
            Some(BlockKind::ListItem) => {
                let indent = chunk.metadata.list_indent.unwrap_or(0) as usize;
                out.push_str(&" ".repeat(indent));
                out.push_str("- ");
                out.push_str(&chunk.contents);
            }
            Some(BlockKind::CodeBlock) => {
                out.push_str("```");
                if let Some(lang) = &chunk.metadata.code_language {
                    out.push_str(lang);
                }
                out.push('\n');
                out.push_str(&chunk.contents);
                out.push_str("\n```");
            }
            Some(BlockKind::Blockquote) => {
                let mut first = true;
                for line in chunk.contents.lines() {
                    if !first {
                        out.push('\n');
                    }
                    out.push_str("> ");
                    out.push_str(line);
                    first = false;
                }
            }
            _ => out.push_str(&chunk.contents),
        }
        out.push('\n');
    }
    out
}
