use crate::coordinator::DeadLetter;
use crc32fast::Hasher;
use notemesh_core::error::{GatewayError, GatewayResult};
use notemesh_core::op::SyncOp;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::warn;
use uuid::Uuid;

/// One append-log record. Replay reconstructs the pending queue as
/// enqueued minus completed minus dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Enqueued(SyncOp),
    Completed { op_id: Uuid },
    DeadLettered(DeadLetter),
}

/// Append log with the record framing
/// `[lsn: 8][crc: 4][len: 4][json payload]`. A partial record at the tail is
/// truncated on replay.
pub struct OpLog {
    file: BufWriter<File>,
    lsn: u64,
}

impl OpLog {
    pub async fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .await
            .map_err(io_err)?;
        Ok(Self {
            file: BufWriter::new(file),
            lsn: 0,
        })
    }

    pub async fn append(&mut self, record: &LogRecord) -> GatewayResult<u64> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| GatewayError::internal("LOG_ENCODE", e.to_string()))?;
        self.lsn += 1;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.write_u64(self.lsn).await.map_err(io_err)?;
        self.file.write_u32(crc).await.map_err(io_err)?;
        self.file
            .write_u32(payload.len() as u32)
            .await
            .map_err(io_err)?;
        self.file.write_all(&payload).await.map_err(io_err)?;
        self.file.flush().await.map_err(io_err)?;
        Ok(self.lsn)
    }

    /// Replay from the start, invoking the callback per intact record.
    /// Returns the last valid LSN; a torn tail is cut off.
    pub async fn replay<F>(&mut self, mut callback: F) -> GatewayResult<u64>
    where
        F: FnMut(u64, LogRecord),
    {
        self.file.flush().await.map_err(io_err)?;
        let file = self.file.get_mut();
        file.seek(std::io::SeekFrom::Start(0)).await.map_err(io_err)?;

        let mut last_lsn = 0;
        let mut valid_end = 0;

        loop {
            let lsn = match file.read_u64().await {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err(e)),
            };
            let crc = match file.read_u32().await {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err(e)),
            };
            let len = match file.read_u32().await {
                Ok(v) => v as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err(e)),
            };

            let mut payload = vec![0u8; len];
            match file.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err(e)),
            }

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != crc {
                warn!(lsn, "corrupt log record, truncating from here");
                break;
            }

            match serde_json::from_slice::<LogRecord>(&payload) {
                Ok(record) => callback(lsn, record),
                Err(e) => {
                    warn!(lsn, error = %e, "undecodable log record, truncating from here");
                    break;
                }
            }
            last_lsn = lsn;
            valid_end = file.stream_position().await.map_err(io_err)?;
        }

        let file_len = file.metadata().await.map_err(io_err)?.len();
        if valid_end < file_len {
            file.set_len(valid_end).await.map_err(io_err)?;
        }
        file.seek(std::io::SeekFrom::End(0)).await.map_err(io_err)?;
        self.lsn = last_lsn;
        Ok(last_lsn)
    }

    /// Reset the log after a successful snapshot.
    pub async fn truncate(&mut self) -> GatewayResult<()> {
        self.file.flush().await.map_err(io_err)?;
        let file = self.file.get_mut();
        file.set_len(0).await.map_err(io_err)?;
        file.seek(std::io::SeekFrom::Start(0)).await.map_err(io_err)?;
        self.lsn = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub seq: u64,
    pub pending: Vec<SyncOp>,
    pub dead: Vec<DeadLetter>,
}

/// Snapshot files named by a monotonic sequence, rotated via
/// write-temp-rename so a crash never leaves a half-written snapshot.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub async fn create(&self, snapshot: &QueueSnapshot) -> GatewayResult<PathBuf> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        }
        let path = self.dir.join(format!("queue_{:020}.json", snapshot.seq));
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| GatewayError::internal("SNAPSHOT_ENCODE", e.to_string()))?;
        fs::write(&tmp, data).await.map_err(io_err)?;
        fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(path)
    }

    pub async fn latest(&self) -> GatewayResult<Option<QueueSnapshot>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut best: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(seq) = parse_snapshot_seq(name) else {
                continue;
            };
            if best.as_ref().map(|(s, _)| seq > *s).unwrap_or(true) {
                best = Some((seq, path));
            }
        }
        let Some((_, path)) = best else {
            return Ok(None);
        };
        let bytes = fs::read(&path).await.map_err(io_err)?;
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::internal("SNAPSHOT_DECODE", e.to_string()))?;
        Ok(Some(snapshot))
    }
}

fn parse_snapshot_seq(name: &str) -> Option<u64> {
    name.strip_prefix("queue_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Recovered durable state handed back to the coordinator on startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub pending: Vec<SyncOp>,
    pub dead: Vec<DeadLetter>,
}

/// The durable queue: one append log plus periodic snapshots. The log is
/// truncated after each successful snapshot.
pub struct QueuePersistence {
    log: OpLog,
    snapshots: SnapshotStore,
    seq: u64,
    records_since_snapshot: u64,
    snapshot_every: u64,
}

impl QueuePersistence {
    pub async fn open(
        dir: impl AsRef<Path>,
        snapshot_every: u64,
    ) -> GatewayResult<(Self, RecoveredState)> {
        let dir = dir.as_ref();
        let mut log = OpLog::open(dir.join("ops.log")).await?;
        let snapshots = SnapshotStore::new(dir.join("snapshots"));

        let base = snapshots.latest().await?.unwrap_or(QueueSnapshot {
            seq: 0,
            pending: Vec::new(),
            dead: Vec::new(),
        });
        let seq = base.seq;

        let mut pending: Vec<SyncOp> = base.pending;
        let mut dead: Vec<DeadLetter> = base.dead;
        log.replay(|_lsn, record| match record {
            LogRecord::Enqueued(op) => pending.push(op),
            LogRecord::Completed { op_id } => pending.retain(|op| op.op_id != op_id),
            LogRecord::DeadLettered(letter) => {
                pending.retain(|op| op.op_id != letter.op.op_id);
                dead.push(letter);
            }
        })
        .await?;

        Ok((
            Self {
                log,
                snapshots,
                seq,
                records_since_snapshot: 0,
                snapshot_every: snapshot_every.max(1),
            },
            RecoveredState { pending, dead },
        ))
    }

    pub async fn record(&mut self, record: &LogRecord) -> GatewayResult<()> {
        self.log.append(record).await?;
        self.records_since_snapshot += 1;
        Ok(())
    }

    pub fn snapshot_due(&self) -> bool {
        self.records_since_snapshot >= self.snapshot_every
    }

    /// Write a snapshot of the live state and truncate the log.
    pub async fn snapshot(
        &mut self,
        pending: Vec<SyncOp>,
        dead: Vec<DeadLetter>,
    ) -> GatewayResult<()> {
        self.seq += 1;
        self.snapshots
            .create(&QueueSnapshot {
                seq: self.seq,
                pending,
                dead,
            })
            .await?;
        self.log.truncate().await?;
        self.records_since_snapshot = 0;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> GatewayError {
    GatewayError::database("QUEUE_PERSIST_IO", "queue persistence io failure").with_cause(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notemesh_core::model::Chunk;
    use notemesh_core::op::{OpPayload, OpPriorities};
    use tempfile::tempdir;

    fn create_op() -> SyncOp {
        let chunk = Chunk::new("doc", "x");
        SyncOp::new(
            chunk.chunk_id,
            "doc",
            OpPayload::Create { chunk },
            &OpPriorities::default(),
        )
    }

    #[tokio::test]
    async fn replay_reconstructs_pending_minus_completed() {
        let dir = tempdir().unwrap();

        let kept = create_op();
        let done = create_op();
        {
            let (mut persist, recovered) = QueuePersistence::open(dir.path(), 100).await.unwrap();
            assert!(recovered.pending.is_empty());
            persist
                .record(&LogRecord::Enqueued(done.clone()))
                .await
                .unwrap();
            persist
                .record(&LogRecord::Enqueued(kept.clone()))
                .await
                .unwrap();
            persist
                .record(&LogRecord::Completed { op_id: done.op_id })
                .await
                .unwrap();
        }

        let (_, recovered) = QueuePersistence::open(dir.path(), 100).await.unwrap();
        assert_eq!(recovered.pending.len(), 1);
        assert_eq!(recovered.pending[0].op_id, kept.op_id);
    }

    #[tokio::test]
    async fn snapshot_truncates_log_and_survives_restart() {
        let dir = tempdir().unwrap();
        let op = create_op();
        {
            let (mut persist, _) = QueuePersistence::open(dir.path(), 100).await.unwrap();
            persist
                .record(&LogRecord::Enqueued(op.clone()))
                .await
                .unwrap();
            persist.snapshot(vec![op.clone()], Vec::new()).await.unwrap();
        }

        let log_len = std::fs::metadata(dir.path().join("ops.log")).unwrap().len();
        assert_eq!(log_len, 0, "log truncated after snapshot");

        let (_, recovered) = QueuePersistence::open(dir.path(), 100).await.unwrap();
        assert_eq!(recovered.pending.len(), 1);
        assert_eq!(recovered.pending[0].op_id, op.op_id);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ops.log");
        {
            let mut log = OpLog::open(&path).await.unwrap();
            log.append(&LogRecord::Enqueued(create_op())).await.unwrap();
        }
        // Simulate a torn write.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        }

        let mut log = OpLog::open(&path).await.unwrap();
        let mut records = 0;
        let last = log.replay(|_, _| records += 1).await.unwrap();
        assert_eq!(records, 1);
        assert_eq!(last, 1);
    }
}
