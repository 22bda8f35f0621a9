use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

/// File signature; bump the trailing digits when the record layout changes.
const MAGIC: &[u8; 8] = b"FBJRNL01";

/// Upper bound on records written per fsync.
const MAX_GROUP_COMMIT: usize = 1024;

const CHANNEL_CAPACITY: usize = 4096;

/// The durable store behind the engine. One `append` is one committed
/// transaction: when it returns `Ok` the record is on disk.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, event: &Event) -> io::Result<()>;

    /// Replace the whole journal with `snapshot`, which must recreate the
    /// current state on replay.
    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()>;

    async fn appends_since_compact(&self) -> u64;
}

// ── On-disk format ───────────────────────────────────────

/// `[u32 len][u32 crc32(payload)][bincode payload]`, little endian.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Reads exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replay every intact record. A torn or corrupt tail ends the replay; a
/// foreign file (wrong signature) is an error.
pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
    scan(path).map(|(events, _)| events)
}

/// Replay plus the byte length of the intact prefix (0 when the file is
/// missing or shorter than its header).
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    if !read_full(&mut reader, &mut magic)? {
        return Ok((Vec::new(), 0));
    }
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a fleetbook journal", path.display()),
        ));
    }

    let mut events = Vec::new();
    let mut valid_len = MAGIC.len() as u64;
    loop {
        let mut header = [0u8; 8];
        if !read_full(&mut reader, &mut header)? {
            break;
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        if !read_full(&mut reader, &mut payload)? {
            tracing::warn!("journal {}: discarding torn tail record", path.display());
            break;
        }
        if crc32fast::hash(&payload) != crc {
            tracing::warn!("journal {}: checksum mismatch, stopping replay", path.display());
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("journal {}: undecodable record ({e}), stopping replay", path.display());
                break;
            }
        }
        valid_len += (header.len() + len) as u64;
    }
    Ok((events, valid_len))
}

/// Append handle on the journal file. Owned by the writer task.
///
/// The file never holds a partial batch past `durable_len`: a batch that
/// fails anywhere between the first byte and the fsync is cut off again
/// before the caller hears about it.
struct JournalFile {
    file: File,
    path: PathBuf,
    /// End of the last batch that was written and synced.
    durable_len: u64,
    /// Set when a failed batch could not be cut off. Every later batch is
    /// refused until the journal is reopened.
    broken: Option<String>,
    appends_since_compact: u64,
    #[cfg(test)]
    torn_batches: Arc<AtomicUsize>,
}

impl JournalFile {
    /// Open for appending, dropping anything past `valid_len` (the intact
    /// prefix found by `scan`) so new records never land behind garbage.
    fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let durable_len = if valid_len < MAGIC.len() as u64 {
            // New file, or a header torn during creation.
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            f.write_all(MAGIC)?;
            f.sync_all()?;
            MAGIC.len() as u64
        } else {
            valid_len
        };
        let file = OpenOptions::new().append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > durable_len {
            tracing::warn!(
                "journal {}: truncating {} bytes of torn tail",
                path.display(),
                on_disk - durable_len
            );
            file.set_len(durable_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            durable_len,
            broken: None,
            appends_since_compact: 0,
            #[cfg(test)]
            torn_batches: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Write `events` as one batch: a single write followed by one fsync.
    /// On failure the file is cut back to the previous batch boundary.
    fn write_batch<'a>(&mut self, events: impl Iterator<Item = &'a Event>) -> io::Result<()> {
        if let Some(reason) = &self.broken {
            return Err(io::Error::other(format!(
                "journal refuses appends after a failed rollback: {reason}"
            )));
        }
        let mut buf = Vec::new();
        let mut count = 0u64;
        for event in events {
            encode_record(&mut buf, event)?;
            count += 1;
        }
        match self.write_synced(&buf) {
            Ok(()) => {
                self.durable_len += buf.len() as u64;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                self.cut_back();
                Err(e)
            }
        }
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if self
            .torn_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Half the batch reaches the file, then the device gives up.
            self.file.write_all(&buf[..buf.len() / 2])?;
            return Err(io::Error::other("injected torn write"));
        }
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    /// Drop whatever a failed batch left behind the last durable record.
    fn cut_back(&mut self) {
        let durable_len = self.durable_len;
        if let Err(e) = self
            .file
            .set_len(durable_len)
            .and_then(|()| self.file.sync_all())
        {
            tracing::error!(
                "journal {}: cannot truncate failed batch ({e}), refusing further appends",
                self.path.display()
            );
            self.broken = Some(e.to_string());
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("journal.tmp")
    }

    /// Write the snapshot beside the journal, fsync it, then rename it over
    /// the live file and reopen.
    fn replace_with(&mut self, snapshot: &[Event]) -> io::Result<()> {
        let tmp = self.snapshot_path();
        let mut buf = MAGIC.to_vec();
        for event in snapshot {
            encode_record(&mut buf, event)?;
        }
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = buf.len() as u64;
        self.broken = None;
        self.appends_since_compact = 0;
        Ok(())
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WriterCommand {
    Append {
        event: Event,
        done: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        done: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        reply: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the file. Takes every queued append, writes them all, then does one
/// flush+fsync and answers each caller with the shared outcome. Control
/// commands flush whatever is pending first so ordering is preserved.
async fn writer_loop(mut file: JournalFile, mut rx: mpsc::Receiver<WriterCommand>) {
    let mut pending: Pending = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next {
            match cmd {
                WriterCommand::Append { event, done } => {
                    pending.push((event, done));
                    if pending.len() >= MAX_GROUP_COMMIT {
                        commit_pending(&mut file, &mut pending);
                    }
                }
                WriterCommand::Compact { snapshot, done } => {
                    commit_pending(&mut file, &mut pending);
                    let _ = done.send(file.replace_with(&snapshot));
                }
                WriterCommand::AppendsSinceCompact { reply } => {
                    commit_pending(&mut file, &mut pending);
                    let _ = reply.send(file.appends_since_compact);
                }
            }
            next = rx.try_recv().ok();
        }
        commit_pending(&mut file, &mut pending);
    }
}

fn commit_pending(file: &mut JournalFile, pending: &mut Pending) {
    if pending.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::JOURNAL_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();

    let outcome = file.write_batch(pending.iter().map(|(event, _)| event));

    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &outcome {
        tracing::error!("journal batch of {} records rolled back: {e}", pending.len());
    }

    for (_, done) in pending.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = done.send(reply);
    }
}

/// Journal file driven by a background group-commit task.
pub struct FileJournal {
    tx: mpsc::Sender<WriterCommand>,
    path: PathBuf,
    #[cfg(test)]
    torn_batches: Arc<AtomicUsize>,
}

impl FileJournal {
    /// Replay `path` and open it for appending. Must run inside a tokio
    /// runtime: the writer task is spawned here.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = scan(path)?;
        let file = JournalFile::open(path, valid_len)?;
        #[cfg(test)]
        let torn_batches = file.torn_batches.clone();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(file, rx));
        Ok((
            Self {
                tx,
                path: path.to_path_buf(),
                #[cfg(test)]
                torn_batches,
            },
            events,
        ))
    }

    /// The next `n` batches write half their bytes and then fail.
    #[cfg(test)]
    pub(crate) fn tear_next_batches(&self, n: usize) {
        self.torn_batches.store(n, Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer_gone() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "journal writer shut down")
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, event: &Event) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Append {
                event: event.clone(),
                done,
            })
            .await
            .map_err(|_| Self::writer_gone())?;
        rx.await.map_err(|_| Self::writer_gone())?
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Compact { snapshot, done })
            .await
            .map_err(|_| Self::writer_gone())?;
        rx.await.map_err(|_| Self::writer_gone())?
    }

    async fn appends_since_compact(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(WriterCommand::AppendsSinceCompact { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// In-memory journal for tests and ephemeral engines. Can be told to fail
/// appends to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<Event>>,
    appends_since_compact: AtomicU64,
    failures_left: AtomicUsize,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` appends fail with an I/O error and record nothing.
    pub fn fail_next_appends(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, event: &Event) -> io::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::other("injected journal failure"));
        }
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        self.appends_since_compact.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn compact(&self, snapshot: Vec<Event>) -> io::Result<()> {
        *self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
        self.appends_since_compact.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn registered(id: VehicleId) -> Event {
        Event::VehicleRegistered {
            vehicle: Vehicle {
                id,
                make: "Tesla".into(),
                model: "Model 3".into(),
                registration: format!("EV{id}"),
                is_available: true,
            },
            status: VehicleStatus::new(id, VehicleCondition::default(), 0),
        }
    }

    fn created(id: BookingId, vehicle_id: VehicleId) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id,
                user_id: 9,
                vehicle_id,
                span: Span::new(1_000, 2_000),
                status: BookingStatus::Confirmed,
                created_at: 500,
            },
            available: true,
        }
    }

    #[tokio::test]
    async fn append_and_replay() {
        let path = tmp_path("append_and_replay.journal");
        let events = vec![registered(1), created(1, 1)];
        {
            let (journal, replayed) = FileJournal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                journal.append(e).await.unwrap();
            }
            assert_eq!(journal.appends_since_compact().await, 2);
        }
        assert_eq!(replay(&path).unwrap(), events);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_durable() {
        let path = tmp_path("group_commit.journal");
        let (journal, _) = FileJournal::open(&path).unwrap();
        let journal = std::sync::Arc::new(journal);

        let mut handles = Vec::new();
        for id in 0..50 {
            let j = journal.clone();
            handles.push(tokio::spawn(async move { j.append(&registered(id)).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(replay(&path).unwrap().len(), 50);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.journal");
        assert!(replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn.journal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC).unwrap();
            encode_record(&mut f, &registered(3)).unwrap();
            // Header of a second record whose payload never made it.
            f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![registered(3)]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.journal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC).unwrap();
            encode_record(&mut f, &registered(1)).unwrap();
            let payload = bincode::serialize(&registered(2)).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            encode_record(&mut f, &registered(3)).unwrap();
        }
        assert_eq!(replay(&path).unwrap(), vec![registered(1)]);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.journal");
        fs::write(&path, b"PGDMP\x00\x01\x02 definitely not ours").unwrap();
        let err = replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn compaction_replaces_history() {
        let path = tmp_path("compact.journal");
        let (journal, _) = FileJournal::open(&path).unwrap();
        journal.append(&registered(1)).await.unwrap();
        for id in 0..20 {
            journal.append(&created(id, 1)).await.unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![registered(1), created(19, 1)];
        journal.compact(snapshot.clone()).await.unwrap();
        assert_eq!(journal.appends_since_compact().await, 0);

        journal.append(&created(20, 1)).await.unwrap();
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should shrink: {after} < {before}");

        let mut expected = snapshot;
        expected.push(created(20, 1));
        assert_eq!(replay(&path).unwrap(), expected);
    }

    #[tokio::test]
    async fn reopen_continues_after_existing_records() {
        let path = tmp_path("reopen.journal");
        {
            let (journal, _) = FileJournal::open(&path).unwrap();
            journal.append(&registered(1)).await.unwrap();
        }
        // Let the first writer task observe its closed channel.
        tokio::task::yield_now().await;
        let (journal, replayed) = FileJournal::open(&path).unwrap();
        assert_eq!(replayed, vec![registered(1)]);
        journal.append(&registered(2)).await.unwrap();
        assert_eq!(replay(&path).unwrap(), vec![registered(1), registered(2)]);
    }

    #[tokio::test]
    async fn torn_batch_is_cut_off() {
        let path = tmp_path("torn_batch.journal");
        let (journal, _) = FileJournal::open(&path).unwrap();
        journal.append(&registered(1)).await.unwrap();
        let durable = fs::metadata(&path).unwrap().len();

        journal.tear_next_batches(1);
        assert!(journal.append(&registered(2)).await.is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), durable);
        assert_eq!(journal.appends_since_compact().await, 1);

        journal.append(&registered(3)).await.unwrap();
        assert_eq!(replay(&path).unwrap(), vec![registered(1), registered(3)]);
    }

    #[tokio::test]
    async fn reopen_drops_torn_tail_before_appending() {
        let path = tmp_path("reopen_torn.journal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(MAGIC).unwrap();
            encode_record(&mut f, &registered(3)).unwrap();
            f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        }
        let (journal, replayed) = FileJournal::open(&path).unwrap();
        assert_eq!(replayed, vec![registered(3)]);
        journal.append(&registered(4)).await.unwrap();
        assert_eq!(replay(&path).unwrap(), vec![registered(3), registered(4)]);
    }

    #[tokio::test]
    async fn memory_journal_injected_failures() {
        let journal = MemoryJournal::new();
        journal.fail_next_appends(2);
        assert!(journal.append(&registered(1)).await.is_err());
        assert!(journal.append(&registered(2)).await.is_err());
        journal.append(&registered(3)).await.unwrap();
        assert_eq!(journal.events(), vec![registered(3)]);
        assert_eq!(journal.appends_since_compact().await, 1);
    }
}
