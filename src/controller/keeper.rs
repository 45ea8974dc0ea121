//! Durability: write-ahead log, snapshots, recovery, and compaction.
//!
//! The keeper owns the WAL file and its buffered writer behind a single
//! mutex, so sequence id stamping and record ordering agree by
//! construction. Two paths feed the log:
//!
//! - the reliable path writes, flushes, and fsyncs (per policy) on the
//!   caller's thread before the response returns;
//! - the unreliable path, for pipelined clients, publishes into a bounded
//!   queue drained by a dedicated worker thread that flushes lazily at
//!   least once per second.
//!
//! On start the keeper loads the snapshot, replays any WAL files in
//! sequence order, rewrites the merged snapshot, and deletes the consumed
//! WALs. A background thread periodically folds accumulated WALs into the
//! snapshot using a disposable core, so the serving path never pauses.

use crate::controller::processor::Processor;
use crate::core::{Core, CoreConfig};
use crate::message::{Request, Status};
use crate::storage::StorageError;
use bytes::{Buf, BufMut, Bytes};
use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const SNAPSHOT_FILE_NAME: &str = "snapshot.bin";
const WAL_FILE_PREFIX: &str = "wal_";
const WAL_FILE_SUFFIX: &str = ".bin";

/// Queue depth of the unreliable path. Publishers block when it fills, so
/// pipelined writers get backpressure instead of silent drops.
const WAL_QUEUE_SIZE: usize = 100_000;

/// WAL writer buffer. A large buffer keeps the unreliable path off the
/// disk between lazy flushes.
const WAL_BUFFER_SIZE: usize = 20 * 1024 * 1024;

/// Lazy flush and `Sometimes` fsync cadence.
const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single decoded WAL record, to keep a corrupt length
/// prefix from driving a giant allocation.
const MAX_RECORD_SIZE: usize = 1 << 30;

/// When the WAL file is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Never fsync; flushing is still bounded by the lazy timer.
    Never,
    /// Fsync at most once per second after a flush.
    Sometimes,
    /// Fsync after every record.
    Always,
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("corrupted WAL record: {0}")]
    Corrupted(String),

    #[error("WAL file already exists: {0}")]
    WalExists(PathBuf),

    #[error("recovery failed: {0}")]
    Recovery(String),

    #[error("keeper is not running")]
    Stopped,
}

/// Everything the WAL mutex guards: the sequence counter, the open file,
/// and the flush/sync clocks.
struct WalState {
    sequence_id: i64,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    last_flush: Instant,
    last_sync: Instant,
}

/// Durability manager for one data directory.
pub struct Keeper {
    core: Arc<Core>,
    processor: Processor,
    data_dir: PathBuf,
    sync_policy: SyncPolicy,
    merge_wal_interval: Duration,

    wal: Mutex<WalState>,
    stopped: AtomicBool,
    queue_tx: Mutex<Option<Sender<Request>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Keeper {
    pub fn new(
        core: Arc<Core>,
        data_dir: impl Into<PathBuf>,
        sync_policy: SyncPolicy,
        merge_wal_interval: Duration,
    ) -> Self {
        Self {
            processor: Processor::new(Arc::clone(&core)),
            core,
            data_dir: data_dir.into(),
            sync_policy,
            merge_wal_interval,
            wal: Mutex::new(WalState {
                sequence_id: 0,
                writer: None,
                path: None,
                last_flush: Instant::now(),
                last_sync: Instant::now(),
            }),
            stopped: AtomicBool::new(false),
            queue_tx: Mutex::new(None),
            stop_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Restores the storage from disk, opens a fresh WAL, and spawns the
    /// WAL worker and the snapshot updater.
    pub fn start(self: &Arc<Self>) -> Result<(), KeeperError> {
        fs::create_dir_all(&self.data_dir)?;
        self.restore()?;
        self.start_new_wal()?;

        let (queue_tx, queue_rx) = bounded(WAL_QUEUE_SIZE);
        *self.queue_tx.lock().unwrap() = Some(queue_tx);
        let (stop_tx, stop_rx) = bounded(1);
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let mut workers = self.workers.lock().unwrap();
        let keeper = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("radish-wal".to_string())
                .spawn(move || keeper.run_wal_worker(queue_rx))?,
        );
        if !self.merge_wal_interval.is_zero() {
            let keeper = Arc::clone(self);
            workers.push(
                thread::Builder::new()
                    .name("radish-snapshot".to_string())
                    .spawn(move || keeper.run_snapshot_updater(stop_rx))?,
            );
        }

        Ok(())
    }

    /// Stops accepting writes, drains the queue, persists a final
    /// snapshot, and removes the now redundant in-flight WAL.
    pub fn shutdown(&self) -> Result<(), KeeperError> {
        self.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender closes the queue; the worker drains whatever
        // is left and exits.
        self.queue_tx.lock().unwrap().take();
        self.stop_tx.lock().unwrap().take();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        info!("persisting storage");
        self.persist_snapshot()?;

        let wal_path = {
            let mut wal = self.wal.lock().unwrap();
            if let Some(mut writer) = wal.writer.take() {
                writer.flush()?;
            }
            wal.path.take()
        };
        if let Some(path) = wal_path {
            fs::remove_file(&path)?;
        }

        Ok(())
    }

    /// Appends a request to the WAL, stamping its sequence id.
    ///
    /// Pipelined requests ride the bounded queue unless the policy is
    /// `Always`, which demands a reliable error status for every record.
    pub fn write_to_wal(&self, request: Request) -> Result<(), KeeperError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(KeeperError::Stopped);
        }

        if request.unreliable && self.sync_policy != SyncPolicy::Always {
            let tx = self.queue_tx.lock().unwrap().clone();
            match tx {
                Some(tx) => tx.send(request).map_err(|_| KeeperError::Stopped),
                None => Err(KeeperError::Stopped),
            }
        } else {
            self.append_record(request, true)
        }
    }

    fn append_record(&self, mut request: Request, reliable: bool) -> Result<(), KeeperError> {
        let mut wal = self.wal.lock().unwrap();

        wal.sequence_id += 1;
        request.id = wal.sequence_id;
        let body = encode_request(&request);
        {
            let writer = wal.writer.as_mut().ok_or(KeeperError::Stopped)?;
            writer.write_all(&(body.len() as u64).to_le_bytes())?;
            writer.write_all(&body)?;
        }

        if reliable || wal.last_flush.elapsed() >= SYNC_INTERVAL {
            self.flush_and_sync(&mut wal)?;
        }

        Ok(())
    }

    fn flush_and_sync(&self, wal: &mut WalState) -> io::Result<()> {
        if let Some(writer) = wal.writer.as_mut() {
            writer.flush()?;
        }
        wal.last_flush = Instant::now();

        let want_sync = match self.sync_policy {
            SyncPolicy::Always => true,
            SyncPolicy::Sometimes => wal.last_sync.elapsed() >= SYNC_INTERVAL,
            SyncPolicy::Never => false,
        };
        if want_sync {
            if let Some(writer) = wal.writer.as_ref() {
                writer.get_ref().sync_data()?;
            }
            wal.last_sync = Instant::now();
        }

        Ok(())
    }

    /// Consumes the unreliable queue. Failures here are logged and
    /// swallowed; nobody is waiting on these records.
    fn run_wal_worker(&self, queue_rx: Receiver<Request>) {
        loop {
            match queue_rx.recv_timeout(SYNC_INTERVAL) {
                Ok(request) => {
                    if let Err(e) = self.append_record(request, false) {
                        error!(error = %e, "unable to append to WAL");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut wal = self.wal.lock().unwrap();
                    if wal.last_flush.elapsed() >= SYNC_INTERVAL {
                        if let Err(e) = self.flush_and_sync(&mut wal) {
                            error!(error = %e, "unable to flush WAL");
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run_snapshot_updater(&self, stop_rx: Receiver<()>) {
        let ticker = tick(self.merge_wal_interval);
        loop {
            select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    if let Err(e) = self.update_snapshot() {
                        error!(error = %e, "snapshot update failed");
                    }
                }
            }
        }
    }

    /// Folds every WAL except the freshly rotated one into the snapshot.
    ///
    /// The merge runs on a disposable core seeded from the on-disk
    /// snapshot, so the live storage and the WAL pipeline stay untouched.
    /// Copy-on-write tricks over the live map stall the serving path;
    /// spending extra I/O on a private replay does not.
    pub fn update_snapshot(&self) -> Result<(), KeeperError> {
        info!("updating snapshot");
        let new_wal = self.start_new_wal()?;

        let wals: Vec<(i64, PathBuf)> = self
            .wal_files()?
            .into_iter()
            .filter(|(_, path)| *path != new_wal)
            .collect();

        let merger = Keeper::new(
            Arc::new(Core::new(CoreConfig::default())),
            &self.data_dir,
            SyncPolicy::Never,
            Duration::ZERO,
        );
        merger.load_snapshot()?;
        for (_, path) in &wals {
            merger.replay_wal(path)?;
        }
        merger.persist_snapshot()?;

        for (_, path) in &wals {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "unable to remove merged WAL");
            }
        }

        Ok(())
    }

    /// Loads the snapshot, replays all WALs, rewrites the merged snapshot,
    /// and deletes the consumed WAL files.
    fn restore(&self) -> Result<(), KeeperError> {
        self.load_snapshot()?;

        let wals = self.wal_files()?;
        for (_, path) in &wals {
            self.replay_wal(path)?;
        }

        self.persist_snapshot()?;

        for (_, path) in &wals {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "unable to remove replayed WAL");
            }
        }

        Ok(())
    }

    fn load_snapshot(&self) -> Result<(), KeeperError> {
        let path = self.snapshot_path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), "loading snapshot");
        let mut reader = BufReader::new(file);
        let last_id = self.core.load_data(&mut reader)?;
        self.wal.lock().unwrap().sequence_id = last_id;

        Ok(())
    }

    /// WAL files in the data dir, ascending by the sequence id encoded in
    /// the name.
    fn wal_files(&self) -> Result<Vec<(i64, PathBuf)>, KeeperError> {
        let mut wals = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let id = name
                .strip_prefix(WAL_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(WAL_FILE_SUFFIX))
                .and_then(|id| id.parse::<i64>().ok());
            if let Some(id) = id {
                wals.push((id, entry.path()));
            }
        }
        wals.sort_by_key(|(id, _)| *id);
        Ok(wals)
    }

    /// Replays one WAL file. Records at or below the current sequence id
    /// are already in the storage and are skipped; every applied record
    /// must succeed, since it succeeded when it was first written.
    fn replay_wal(&self, path: &Path) -> Result<(), KeeperError> {
        info!(path = %path.display(), "processing WAL");

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut applied = 0u64;

        while let Some(mut request) = read_record(&mut reader)? {
            if request.id <= self.wal.lock().unwrap().sequence_id {
                continue;
            }

            self.processor.normalize_ttl(&mut request).map_err(|e| {
                KeeperError::Recovery(format!(
                    "{}: bad TTL argument in {}: {e}",
                    request.cmd,
                    path.display()
                ))
            })?;

            let response = self.processor.process(&request);
            if response.status() != Status::Ok {
                return Err(KeeperError::Recovery(format!(
                    "replaying {} id {} from {} failed: {:?}",
                    request.cmd,
                    request.id,
                    path.display(),
                    response
                )));
            }

            self.wal.lock().unwrap().sequence_id = request.id;
            applied += 1;
        }

        debug!(applied, path = %path.display(), "WAL processed");
        Ok(())
    }

    /// Writes the whole storage to a temp file and renames it over the
    /// snapshot, so a failed write leaves the previous snapshot intact.
    fn persist_snapshot(&self) -> Result<(), KeeperError> {
        // Expired items do not belong in the dump.
        self.core.collect_expired();

        let final_path = self.snapshot_path();
        let tmp_path = self.data_dir.join(format!("{SNAPSHOT_FILE_NAME}.tmp"));
        let sequence_id = self.wal.lock().unwrap().sequence_id;

        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        self.core.dump_data(&mut writer, sequence_id)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        Ok(())
    }

    /// Rotates to a new WAL file named after the next sequence id. The old
    /// writer is flushed and closed; its file stays on disk for the
    /// compactor.
    fn start_new_wal(&self) -> Result<PathBuf, KeeperError> {
        let mut wal = self.wal.lock().unwrap();

        wal.sequence_id += 1;
        let path = self.wal_path(wal.sequence_id);
        if path.exists() {
            return Err(KeeperError::WalExists(path));
        }
        let file = File::create(&path)?;

        if let Some(mut old) = wal.writer.take() {
            old.flush()?;
        }
        wal.writer = Some(BufWriter::with_capacity(WAL_BUFFER_SIZE, file));
        wal.path = Some(path.clone());
        wal.last_flush = Instant::now();
        wal.last_sync = Instant::now();

        Ok(path)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE_NAME)
    }

    fn wal_path(&self, sequence_id: i64) -> PathBuf {
        self.data_dir
            .join(format!("{WAL_FILE_PREFIX}{sequence_id}{WAL_FILE_SUFFIX}"))
    }

    #[cfg(test)]
    fn sequence_id(&self) -> i64 {
        self.wal.lock().unwrap().sequence_id
    }
}

// WAL record: u64 LE body length, then the body. Body layout, integers
// little-endian: i64 timestamp, i64 id, u32 + cmd bytes, u32 arg count,
// (u32 + bytes) per arg, u8 unreliable flag.

fn encode_request(request: &Request) -> Vec<u8> {
    let args_len: usize = request.args.iter().map(|a| 4 + a.len()).sum();
    let mut buf = Vec::with_capacity(8 + 8 + 4 + request.cmd.len() + 4 + args_len + 1);
    buf.put_i64_le(request.timestamp);
    buf.put_i64_le(request.id);
    buf.put_u32_le(request.cmd.len() as u32);
    buf.put_slice(request.cmd.as_bytes());
    buf.put_u32_le(request.args.len() as u32);
    for arg in &request.args {
        buf.put_u32_le(arg.len() as u32);
        buf.put_slice(arg);
    }
    buf.put_u8(request.unreliable as u8);
    buf
}

/// Reads one framed record. A tail cut short by a crash, whether inside
/// the length prefix or the body, ends the stream without an error; a
/// record that is fully present but does not decode is corruption.
fn read_record<R: Read>(r: &mut R) -> Result<Option<Request>, KeeperError> {
    let mut len_buf = [0u8; 8];
    if !read_exact_or_eof(r, &mut len_buf)? {
        return Ok(None);
    }
    let len = u64::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(KeeperError::Corrupted(format!(
            "record length {len} exceeds the {MAX_RECORD_SIZE} byte cap"
        )));
    }

    let mut body = vec![0u8; len];
    if !read_exact_or_eof(r, &mut body)? {
        return Ok(None);
    }

    decode_request(&body).map(Some)
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, KeeperError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn decode_request(body: &[u8]) -> Result<Request, KeeperError> {
    fn corrupt() -> KeeperError {
        KeeperError::Corrupted("record body ends early".to_string())
    }

    let mut buf = body;
    if buf.remaining() < 8 + 8 + 4 {
        return Err(corrupt());
    }
    let timestamp = buf.get_i64_le();
    let id = buf.get_i64_le();

    let cmd_len = buf.get_u32_le() as usize;
    if buf.remaining() < cmd_len {
        return Err(corrupt());
    }
    let cmd = String::from_utf8(buf[..cmd_len].to_vec())
        .map_err(|_| KeeperError::Corrupted("command name is not valid UTF-8".to_string()))?;
    buf.advance(cmd_len);

    if buf.remaining() < 4 {
        return Err(corrupt());
    }
    let count = buf.get_u32_le() as usize;
    let mut args = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(corrupt());
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(corrupt());
        }
        args.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }

    if buf.remaining() < 1 {
        return Err(corrupt());
    }
    let unreliable = buf.get_u8() != 0;

    Ok(Request {
        timestamp,
        id,
        cmd,
        args,
        unreliable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_core() -> Arc<Core> {
        Arc::new(Core::new(CoreConfig::default()))
    }

    fn keeper(core: &Arc<Core>, dir: &Path) -> Arc<Keeper> {
        Arc::new(Keeper::new(
            Arc::clone(core),
            dir,
            SyncPolicy::Always,
            Duration::from_secs(3600),
        ))
    }

    fn request(cmd: &str, args: &[&str]) -> Request {
        Request::new(
            cmd,
            args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect(),
        )
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    /// Applies a command to the core and appends it to the WAL, the way
    /// the controller does for successful modifying commands.
    fn apply(keeper: &Keeper, cmd: &str, args: &[&str]) {
        let r = request(cmd, args);
        let response = keeper.processor.process(&r);
        assert_eq!(response.status(), Status::Ok, "{cmd} failed: {response:?}");
        keeper.write_to_wal(r).unwrap();
    }

    #[test]
    fn request_codec_round_trips() {
        let mut original = request("SETEX", &["key", "100", "value"]);
        original.id = 7;
        original.unreliable = true;

        let body = encode_request(&original);
        let mut framed = (body.len() as u64).to_le_bytes().to_vec();
        framed.extend_from_slice(&body);

        let decoded = read_record(&mut framed.as_slice()).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncated_tail_ends_the_stream() {
        let mut original = request("SET", &["k", "v"]);
        original.id = 1;
        let body = encode_request(&original);
        let mut framed = (body.len() as u64).to_le_bytes().to_vec();
        framed.extend_from_slice(&body);

        // Cut inside the body.
        let cut = &framed[..framed.len() - 3];
        assert!(read_record(&mut &cut[..]).unwrap().is_none());

        // Cut inside the length prefix.
        let cut = &framed[..5];
        assert!(read_record(&mut &cut[..]).unwrap().is_none());
    }

    #[test]
    fn full_record_with_bad_body_is_corruption() {
        let mut framed = 4u64.to_le_bytes().to_vec();
        framed.extend_from_slice(&[1, 2, 3, 4]);
        assert!(matches!(
            read_record(&mut framed.as_slice()),
            Err(KeeperError::Corrupted(_))
        ));
    }

    #[test]
    fn shutdown_persists_snapshot_and_removes_wal() {
        let dir = tempdir().unwrap();

        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        apply(&keeper, "SET", &["a", "1"]);
        apply(&keeper, "LPUSH", &["l", "x", "y"]);
        keeper.shutdown().unwrap();

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(files.contains(&SNAPSHOT_FILE_NAME.to_string()));
        assert!(!files.iter().any(|f| f.starts_with(WAL_FILE_PREFIX)));

        let core = new_core();
        let restarted = self::keeper(&core, dir.path());
        restarted.start().unwrap();
        assert_eq!(core.get("a").unwrap(), b("1"));
        assert_eq!(
            core.list_range("l", 0, -1).unwrap(),
            vec![b("x"), b("y")]
        );
        restarted.shutdown().unwrap();
    }

    #[test]
    fn wal_survives_a_crash() {
        let dir = tempdir().unwrap();

        {
            let core = new_core();
            let keeper = keeper(&core, dir.path());
            keeper.start().unwrap();
            apply(&keeper, "SET", &["a", "1"]);
            apply(&keeper, "HSET", &["d", "f", "v"]);
            // No shutdown: simulate a crash with the WAL still on disk.
            // Under SyncPolicy::Always every record has been fsynced.
            keeper.stopped.store(true, Ordering::SeqCst);
            keeper.queue_tx.lock().unwrap().take();
            keeper.stop_tx.lock().unwrap().take();
            for worker in std::mem::take(&mut *keeper.workers.lock().unwrap()) {
                let _ = worker.join();
            }
            keeper.wal.lock().unwrap().writer.take().unwrap().flush().unwrap();
        }

        let core = new_core();
        let restarted = keeper(&core, dir.path());
        restarted.start().unwrap();
        assert_eq!(core.get("a").unwrap(), b("1"));
        assert_eq!(core.dict_get("d", "f").unwrap(), b("v"));
        restarted.shutdown().unwrap();
    }

    #[test]
    fn replay_tolerates_a_truncated_tail() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal_1.bin");

        let mut data = Vec::new();
        for (id, key) in [(2i64, "a"), (3, "b")] {
            let mut r = request("SET", &[key, "1"]);
            r.id = id;
            let body = encode_request(&r);
            data.extend_from_slice(&(body.len() as u64).to_le_bytes());
            data.extend_from_slice(&body);
        }
        // A record cut mid-write by a power failure.
        data.extend_from_slice(&999u64.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3]);
        fs::write(&wal_path, &data).unwrap();

        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        assert_eq!(core.get("a").unwrap(), b("1"));
        assert_eq!(core.get("b").unwrap(), b("1"));
        keeper.shutdown().unwrap();
    }

    #[test]
    fn replay_skips_records_already_in_the_snapshot() {
        let dir = tempdir().unwrap();

        // Snapshot at sequence id 5.
        let snapshot_core = new_core();
        snapshot_core.set("old", b("snapshot"));
        let file = File::create(dir.path().join(SNAPSHOT_FILE_NAME)).unwrap();
        let mut writer = BufWriter::new(file);
        snapshot_core.dump_data(&mut writer, 5).unwrap();
        writer.flush().unwrap();

        // One stale record (id 4) and one fresh record (id 6).
        let mut data = Vec::new();
        for (id, key, value) in [(4i64, "old", "stale"), (6, "new", "fresh")] {
            let mut r = request("SET", &[key, value]);
            r.id = id;
            let body = encode_request(&r);
            data.extend_from_slice(&(body.len() as u64).to_le_bytes());
            data.extend_from_slice(&body);
        }
        fs::write(dir.path().join("wal_4.bin"), &data).unwrap();

        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        assert_eq!(core.get("old").unwrap(), b("snapshot"));
        assert_eq!(core.get("new").unwrap(), b("fresh"));
        // New WAL ids continue past everything replayed.
        assert!(keeper.sequence_id() > 6);
        keeper.shutdown().unwrap();
    }

    #[test]
    fn replay_normalizes_ttl_arguments() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal_1.bin");

        // SETEX issued 1000 seconds ago with a 2000 second TTL: after
        // replay roughly 1000 seconds must remain.
        let mut r = request("SETEX", &["k", "2000", "v"]);
        r.id = 2;
        r.timestamp -= 1000;
        let body = encode_request(&r);
        let mut data = (body.len() as u64).to_le_bytes().to_vec();
        data.extend_from_slice(&body);
        fs::write(&wal_path, &data).unwrap();

        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        let ttl = core.ttl("k");
        assert!(
            (995..=1000).contains(&ttl),
            "residual TTL {ttl} out of range"
        );
        keeper.shutdown().unwrap();
    }

    #[test]
    fn sequence_ids_are_monotonic_across_restarts() {
        let dir = tempdir().unwrap();

        let core = new_core();
        let k1 = keeper(&core, dir.path());
        k1.start().unwrap();
        apply(&k1, "SET", &["a", "1"]);
        let id_after_first = k1.sequence_id();
        k1.shutdown().unwrap();

        let core = new_core();
        let k2 = keeper(&core, dir.path());
        k2.start().unwrap();
        assert!(k2.sequence_id() > id_after_first);
        apply(&k2, "SET", &["b", "2"]);
        assert!(k2.sequence_id() > id_after_first + 1);
        k2.shutdown().unwrap();
    }

    #[test]
    fn update_snapshot_merges_and_removes_old_wals() {
        let dir = tempdir().unwrap();

        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        apply(&keeper, "SET", &["a", "1"]);
        apply(&keeper, "SET", &["b", "2"]);
        // Flush the live WAL so the compactor sees complete records.
        {
            let mut wal = keeper.wal.lock().unwrap();
            keeper.flush_and_sync(&mut wal).unwrap();
        }

        keeper.update_snapshot().unwrap();

        // Only the freshly rotated WAL remains.
        let wals = keeper.wal_files().unwrap();
        assert_eq!(wals.len(), 1);

        // The merged snapshot alone restores the state.
        let merge_core = new_core();
        let file = File::open(dir.path().join(SNAPSHOT_FILE_NAME)).unwrap();
        let mut reader = BufReader::new(file);
        let last_id = merge_core.load_data(&mut reader).unwrap();
        assert_eq!(merge_core.get("a").unwrap(), b("1"));
        assert_eq!(merge_core.get("b").unwrap(), b("2"));
        assert!(last_id >= 3);

        // The live pipeline keeps going after compaction.
        apply(&keeper, "SET", &["c", "3"]);
        keeper.shutdown().unwrap();
    }

    #[test]
    fn unreliable_requests_ride_the_queue() {
        let dir = tempdir().unwrap();

        let core = new_core();
        let keeper = Arc::new(Keeper::new(
            Arc::clone(&core),
            dir.path(),
            SyncPolicy::Sometimes,
            Duration::from_secs(3600),
        ));
        keeper.start().unwrap();

        core.set("p", b("1"));
        let mut r = request("SET", &["p", "1"]);
        r.unreliable = true;
        keeper.write_to_wal(r).unwrap();

        // Shutdown drains the queue before persisting, so the record is
        // not lost.
        keeper.shutdown().unwrap();

        let core = new_core();
        let restarted = self::keeper(&core, dir.path());
        restarted.start().unwrap();
        assert_eq!(core.get("p").unwrap(), b("1"));
        restarted.shutdown().unwrap();
    }

    #[test]
    fn write_after_shutdown_is_rejected() {
        let dir = tempdir().unwrap();
        let core = new_core();
        let keeper = keeper(&core, dir.path());
        keeper.start().unwrap();
        keeper.shutdown().unwrap();
        assert!(matches!(
            keeper.write_to_wal(request("SET", &["a", "1"])),
            Err(KeeperError::Stopped)
        ));
    }
}
