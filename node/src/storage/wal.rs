//! Append-only, checksummed log backing the on-disk pending store.

use super::{LevelIndex, PendingBlockStore, PendingQueues, StoreError};
use crate::types::Block;
use alloy_primitives::B256;
use crc32fast::Hasher;
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOG_FILE: &str = "pending.log";
const COMPACT_FILE: &str = "pending.log.compact";

#[derive(Debug, Serialize, Deserialize)]
enum PendingRecord {
    Put { blocks: Vec<Block> },
    Drop { keys: Vec<B256> },
}

#[derive(Debug)]
struct LogRecord {
    level: u64,
    payload: Vec<u8>,
}

/// Log file that can be cut back after a failed append.
trait LogFile: Write {
    fn end_offset(&mut self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn end_offset(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

fn write_record<W: Write>(file: &mut W, level: u64, record: &PendingRecord) -> Result<(), StoreError> {
    let payload = bincode::serialize(record)?;
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(&level.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(8 + 4 + payload.len() + 4);
    buf.extend_from_slice(&level.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_le_bytes());
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

/// Appends one record. A failed write is cut off so later records never
/// follow torn bytes.
fn append_record<F: LogFile>(file: &mut F, level: u64, record: &PendingRecord) -> Result<(), StoreError> {
    let start = file.end_offset()?;
    if let Err(err) = write_record(file, level, record) {
        if let Err(rollback) = file.truncate_to(start) {
            warn!(error = %rollback, offset = start, "failed to roll back torn pending record");
        }
        return Err(err);
    }
    Ok(())
}

/// Reads every intact record and truncates a torn or corrupt tail.
fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err("failed to open pending log")?;
    let mut records = Vec::new();
    let mut last_good_offset: u64 = 0;
    let mut level_buf = [0u8; 8];
    loop {
        if file.read_exact(&mut level_buf).is_err() {
            break;
        }
        let level = u64::from_le_bytes(level_buf);
        let mut len_buf = [0u8; 4];
        if file.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if file.read_exact(&mut crc_buf).is_err() {
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&level_buf);
        hasher.update(&len_buf);
        hasher.update(&payload);
        if hasher.finalize() != u32::from_le_bytes(crc_buf) {
            break;
        }
        records.push(LogRecord { level, payload });
        last_good_offset = file.stream_position()?;
    }

    let len = file.metadata()?.len();
    if last_good_offset < len {
        warn!(
            path = %path.display(),
            kept = last_good_offset,
            dropped = len - last_good_offset,
            "truncating damaged pending log tail"
        );
        file.set_len(last_good_offset)?;
        file.seek(SeekFrom::End(0))?;
    }
    Ok(records)
}

#[derive(Debug)]
struct DiskState {
    index: LevelIndex,
    file: File,
}

/// Pending store persisted as a replayable log under `dir`.
#[derive(Debug)]
pub struct DiskPendingStore {
    dir: PathBuf,
    state: Mutex<DiskState>,
}

impl DiskPendingStore {
    /// Opens the store, replaying and compacting any existing log.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).wrap_err("failed to create pending dir")?;
        let path = dir.join(LOG_FILE);
        let mut index = LevelIndex::default();
        let mut dropped = 0usize;
        for record in read_records(&path)? {
            match bincode::deserialize::<PendingRecord>(&record.payload) {
                Ok(PendingRecord::Put { blocks }) => {
                    index.insert(&blocks);
                }
                Ok(PendingRecord::Drop { keys }) => {
                    dropped += keys.len();
                    index.remove(record.level, &keys);
                }
                Err(err) => {
                    warn!(level = record.level, error = %err, "skipping undecodable pending record");
                }
            }
        }
        if dropped > 0 {
            compact(dir, &index)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .wrap_err("failed to open pending log for append")?;
        info!(
            dir = %dir.display(),
            queues = index.queue_count(),
            "pending block store opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(DiskState { index, file }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Rewrites the log so it holds only live queues.
fn compact(dir: &Path, index: &LevelIndex) -> Result<()> {
    let tmp = dir.join(COMPACT_FILE);
    let mut file = File::create(&tmp).wrap_err("failed to create compacted pending log")?;
    for (level, queues) in index.iter() {
        for blocks in queues.values() {
            write_record(
                &mut file,
                *level,
                &PendingRecord::Put {
                    blocks: blocks.clone(),
                },
            )?;
        }
    }
    file.sync_all()?;
    fs::rename(&tmp, dir.join(LOG_FILE)).wrap_err("failed to replace pending log")?;
    debug!(queues = index.queue_count(), "compacted pending log");
    Ok(())
}

impl PendingBlockStore for DiskPendingStore {
    fn store_pending_range(&self, blocks: &[Block]) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let Some((level, _)) = state.index.insert(blocks) else {
            return Ok(0);
        };
        let record = PendingRecord::Put {
            blocks: blocks.to_vec(),
        };
        if let Err(err) = append_record(&mut state.file, level, &record) {
            let key = blocks[0].hash();
            state.index.remove(level, &[key]);
            return Err(err);
        }
        Ok(blocks.len())
    }

    fn load_pending_at_level(&self, level: u64) -> Result<PendingQueues, StoreError> {
        Ok(self.state.lock().index.load(level))
    }

    fn drop_imported(
        &self,
        level: u64,
        queue_keys: &[B256],
        loaded: &PendingQueues,
    ) -> Result<(), StoreError> {
        let keys: Vec<B256> = queue_keys
            .iter()
            .filter(|key| loaded.contains_key(*key))
            .copied()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        append_record(&mut state.file, level, &PendingRecord::Drop { keys: keys.clone() })?;
        state.index.remove(level, &keys);
        Ok(())
    }

    fn queue_count(&self) -> usize {
        self.state.lock().index.queue_count()
    }
}
