use notemesh_core::op::SyncOp;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

/// Bounded priority queue of pending operations. FIFO within a priority
/// class; higher priority dequeues first; ties broken by enqueue timestamp.
/// On overflow the globally oldest op is dropped and a warning recorded.
#[derive(Debug)]
pub struct OpQueue {
    classes: BTreeMap<u8, VecDeque<SyncOp>>,
    max_size: usize,
    len: usize,
    dropped: u64,
}

impl OpQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            classes: BTreeMap::new(),
            max_size: max_size.max(1),
            len: 0,
            dropped: 0,
        }
    }

    /// Returns the op that was dropped to make room, if any.
    pub fn enqueue(&mut self, op: SyncOp) -> Option<SyncOp> {
        let mut dropped = None;
        if self.len >= self.max_size {
            dropped = self.drop_oldest();
        }
        self.classes.entry(op.priority).or_default().push_back(op);
        self.len += 1;
        if let Some(old) = &dropped {
            self.dropped += 1;
            warn!(
                op_id = %old.op_id,
                chunk_id = %old.chunk_id,
                "sync queue overflow, dropped oldest operation"
            );
        }
        dropped
    }

    pub fn dequeue(&mut self) -> Option<SyncOp> {
        let priority = *self.classes.keys().next_back()?;
        let queue = self.classes.get_mut(&priority)?;
        let op = queue.pop_front();
        if queue.is_empty() {
            self.classes.remove(&priority);
        }
        if op.is_some() {
            self.len -= 1;
        }
        op
    }

    pub fn dequeue_batch(&mut self, max: usize) -> Vec<SyncOp> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.dequeue() {
                Some(op) => out.push(op),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Pending ops in dequeue order, without consuming them.
    pub fn snapshot(&self) -> Vec<SyncOp> {
        self.classes
            .iter()
            .rev()
            .flat_map(|(_, queue)| queue.iter().cloned())
            .collect()
    }

    pub fn restore(&mut self, ops: Vec<SyncOp>) {
        for op in ops {
            self.classes.entry(op.priority).or_default().push_back(op);
            self.len += 1;
        }
    }

    fn drop_oldest(&mut self) -> Option<SyncOp> {
        let (&priority, _) = self
            .classes
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .min_by_key(|(priority, queue)| {
                (
                    queue.front().map(|op| op.enqueued_at),
                    // Prefer dropping lower priority on timestamp ties.
                    **priority,
                )
            })?;
        let queue = self.classes.get_mut(&priority)?;
        let op = queue.pop_front();
        if queue.is_empty() {
            self.classes.remove(&priority);
        }
        if op.is_some() {
            self.len -= 1;
        }
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notemesh_core::model::{CascadeMode, Chunk};
    use notemesh_core::op::{OpPayload, OpPriorities};

    fn op(payload: OpPayload) -> SyncOp {
        let chunk = Chunk::new("doc", "x");
        SyncOp::new(chunk.chunk_id, "doc", payload, &OpPriorities::default())
    }

    fn create_op() -> SyncOp {
        op(OpPayload::Create {
            chunk: Chunk::new("doc", "x"),
        })
    }

    fn delete_op() -> SyncOp {
        op(OpPayload::Delete {
            cascade: CascadeMode::Reparent,
        })
    }

    #[test]
    fn higher_priority_dequeues_first_fifo_within_class() {
        let mut queue = OpQueue::new(10);
        let d1 = delete_op();
        let c1 = create_op();
        let c2 = create_op();
        queue.enqueue(d1.clone());
        queue.enqueue(c1.clone());
        queue.enqueue(c2.clone());

        assert_eq!(queue.dequeue().unwrap().op_id, c1.op_id);
        assert_eq!(queue.dequeue().unwrap().op_id, c2.op_id);
        assert_eq!(queue.dequeue().unwrap().op_id, d1.op_id);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overflow_drops_the_oldest_and_counts_it() {
        let mut queue = OpQueue::new(2);
        let first = create_op();
        queue.enqueue(first.clone());
        queue.enqueue(create_op());
        let dropped = queue.enqueue(create_op());

        assert_eq!(dropped.unwrap().op_id, first.op_id);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let mut queue = OpQueue::new(10);
        queue.enqueue(create_op());
        queue.enqueue(delete_op());

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);

        let mut restored = OpQueue::new(10);
        restored.restore(snapshot.clone());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.dequeue().unwrap().op_id, snapshot[0].op_id);
    }
}
