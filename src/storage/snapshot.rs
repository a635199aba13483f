//! Snapshots: sequential dump of live records and bulk load
//!
//! ## File layout
//! ```text
//! [header: bincode SnapshotHeader, 32 bytes]
//! [record]*   record = [key_len u32 LE][value_len u32 LE][expire u64 LE][key][value]
//! [crc32 of the record section, u32 LE]
//! ```
//!
//! Files are written to `<path>.tmp` and renamed into place, so a reader
//! never sees a partial snapshot. Loading memory-maps the file and inserts
//! with memory statistics disabled, then recounts once.
//!
//! ## SnapshotManager
//! One named background thread fed through a capacity-1 channel. A request
//! arriving while another is in flight is rejected rather than queued.

use super::map::BigSortedMap;
use super::record;
use crate::{Result, StorageError};
use crossbeam::channel::{bounded, Receiver, Sender};
use memmap2::MmapOptions;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const SNAPSHOT_MAGIC: u32 = 0x5253_4E50; // "RSNP"
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_FILE_NAME: &str = "map.snapshot";

const HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub record_count: u64,
    /// Map sequence when the dump started
    pub sequence: u64,
    pub created_ms: u64,
}

fn encode_header(header: &SnapshotHeader) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(header)?;
    if bytes.len() != HEADER_LEN {
        return Err(StorageError::Serialization(format!(
            "snapshot header encoded to {} bytes, expected {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    Ok(bytes)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Dump every live record of `map` into `path`; returns the record count
pub fn write_snapshot(map: &BigSortedMap, path: &Path) -> Result<u64> {
    let tmp = temp_path(path);
    let mut header = SnapshotHeader {
        magic: SNAPSHOT_MAGIC,
        version: SNAPSHOT_VERSION,
        record_count: 0,
        sequence: map.current_sequence(),
        created_ms: record::now_millis(),
    };
    log::debug!("snapshot started: {:?} at sequence {}", path, header.sequence);

    let mut writer = BufWriter::new(File::create(&tmp)?);
    writer.write_all(&encode_header(&header)?)?;

    let mut hasher = crc32fast::Hasher::new();
    let mut frame = Vec::new();
    for entry in map.scanner(None, None, None) {
        let entry = entry?;
        frame.clear();
        frame.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
        frame.extend_from_slice(&entry.expire.to_le_bytes());
        frame.extend_from_slice(&entry.key);
        frame.extend_from_slice(&entry.value);
        hasher.update(&frame);
        writer.write_all(&frame)?;
        header.record_count += 1;
    }
    writer.write_all(&hasher.finalize().to_le_bytes())?;

    // the record count is only known now
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&encode_header(&header)?)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;

    log::debug!("snapshot finished: {} records -> {:?}", header.record_count, path);
    Ok(header.record_count)
}

/// Read and validate the header of a snapshot file
pub fn read_header(path: &Path) -> Result<SnapshotHeader> {
    let file = File::open(path)?;
    // SAFETY: the file is opened read-only and snapshots are replaced by rename, never rewritten
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    parse_header(&mmap)
}

fn parse_header(data: &[u8]) -> Result<SnapshotHeader> {
    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(StorageError::Corruption(format!(
            "snapshot too short: {} bytes",
            data.len()
        )));
    }
    let header: SnapshotHeader = bincode::deserialize(&data[..HEADER_LEN])?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(StorageError::Corruption(format!(
            "bad snapshot magic {:#x}",
            header.magic
        )));
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported snapshot version {}",
            header.version
        )));
    }
    Ok(header)
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| StorageError::Corruption(format!("truncated snapshot frame at {}", pos)))
}

fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    data.get(pos..pos + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| StorageError::Corruption(format!("truncated snapshot frame at {}", pos)))
}

/// Insert every non-expired record of the snapshot at `path` into `map`
pub fn load_snapshot(map: &BigSortedMap, path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    // SAFETY: see read_header
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let header = parse_header(&mmap)?;

    let body = &mmap[HEADER_LEN..mmap.len() - TRAILER_LEN];
    let stored_crc = read_u32(&mmap, mmap.len() - TRAILER_LEN)?;
    let actual_crc = crc32fast::hash(body);
    if stored_crc != actual_crc {
        return Err(StorageError::Corruption(format!(
            "snapshot checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, actual_crc
        )));
    }

    map.set_stats_updates_disabled(true);
    let result = load_records(map, body, header.record_count);
    map.set_stats_updates_disabled(false);
    let memory = map.recompute_memory();

    let loaded = result?;
    log::debug!(
        "loaded {} of {} records from {:?} ({} bytes in memory)",
        loaded,
        header.record_count,
        path,
        memory
    );
    Ok(loaded)
}

fn load_records(map: &BigSortedMap, body: &[u8], expected: u64) -> Result<u64> {
    let now_ms = record::now_millis();
    let mut pos = 0;
    let mut seen = 0u64;
    let mut loaded = 0u64;
    let mut rejected = 0u64;
    while pos < body.len() {
        let key_len = read_u32(body, pos)? as usize;
        let value_len = read_u32(body, pos + 4)? as usize;
        let expire = read_u64(body, pos + 8)?;
        let key_start = pos + FRAME_HEADER_LEN;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > body.len() {
            return Err(StorageError::Corruption(format!(
                "snapshot record at {} overruns the file",
                pos
            )));
        }
        seen += 1;
        pos = end;
        if record::is_expired(expire, now_ms) {
            continue;
        }
        if map.put(&body[key_start..value_start], &body[value_start..end], expire)? {
            loaded += 1;
        } else {
            rejected += 1;
        }
    }
    if rejected > 0 {
        log::warn!(
            "snapshot load dropped {} records refused by the memory limit {:?}",
            rejected,
            map.config().global_memory_limit
        );
    }
    if seen != expected {
        return Err(StorageError::Corruption(format!(
            "snapshot holds {} records, header says {}",
            seen, expected
        )));
    }
    Ok(loaded)
}

// ==================== Background manager ====================

/// Result of the most recent background snapshot
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub path: PathBuf,
    pub records: u64,
    pub error: Option<String>,
    pub finished_ms: u64,
}

struct SnapshotRequest {
    map: Arc<BigSortedMap>,
    path: PathBuf,
    done: Option<Sender<Result<u64>>>,
}

pub struct SnapshotManager {
    dir: PathBuf,
    requests: Option<Sender<SnapshotRequest>>,
    busy: Arc<AtomicBool>,
    last: Arc<Mutex<Option<SnapshotOutcome>>>,
    worker: Option<JoinHandle<()>>,
}

impl SnapshotManager {
    /// Start the worker thread writing into `dir`
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (tx, rx) = bounded::<SnapshotRequest>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let last = Arc::new(Mutex::new(None));

        let worker = {
            let busy = busy.clone();
            let last = last.clone();
            thread::Builder::new()
                .name("redsorted-snapshot".into())
                .spawn(move || run_worker(rx, busy, last))?
        };

        Ok(Self {
            dir,
            requests: Some(tx),
            busy,
            last,
            worker: Some(worker),
        })
    }

    /// Use the snapshot directory configured for `map`
    pub fn for_map(map: &BigSortedMap) -> Result<Self> {
        match &map.config().snapshot_dir {
            Some(dir) => Self::new(dir.clone()),
            None => Err(StorageError::Config("snapshot_dir is not set".into())),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE_NAME)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn last_result(&self) -> Option<SnapshotOutcome> {
        self.last.lock().clone()
    }

    /// Request a snapshot of `map`
    ///
    /// Returns `Ok(false)` when another snapshot is still running. With `sync`
    /// the call blocks until the snapshot finished and reports its error.
    pub fn take_snapshot(&self, map: &Arc<BigSortedMap>, sync: bool) -> Result<bool> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("snapshot request rejected: one is already in flight");
            return Ok(false);
        }

        let (done_tx, done_rx) = if sync {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let request = SnapshotRequest {
            map: map.clone(),
            path: self.snapshot_path(),
            done: done_tx,
        };
        let sent = self
            .requests
            .as_ref()
            .map(|tx| tx.try_send(request).is_ok())
            .unwrap_or(false);
        if !sent {
            self.busy.store(false, Ordering::Release);
            return Err(StorageError::SnapshotInProgress);
        }

        match done_rx {
            Some(rx) => match rx.recv() {
                Ok(result) => result.map(|_| true),
                Err(_) => Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "snapshot worker exited",
                ))),
            },
            None => Ok(true),
        }
    }
}

fn run_worker(
    requests: Receiver<SnapshotRequest>,
    busy: Arc<AtomicBool>,
    last: Arc<Mutex<Option<SnapshotOutcome>>>,
) {
    for request in requests.iter() {
        let result = write_snapshot(&request.map, &request.path);
        let outcome = SnapshotOutcome {
            path: request.path.clone(),
            records: *result.as_ref().unwrap_or(&0),
            error: result.as_ref().err().map(|e| e.to_string()),
            finished_ms: record::now_millis(),
        };
        if let Some(error) = &outcome.error {
            log::warn!("background snapshot to {:?} failed: {}", request.path, error);
        }
        *last.lock() = Some(outcome);
        // release the map before accepting the next request
        drop(request.map);
        busy.store(false, Ordering::Release);
        if let Some(done) = request.done {
            let _ = done.send(result);
        }
    }
}

impl Drop for SnapshotManager {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
