//! Time-sliced output chunks with a shared overlap window.
//!
//! The record stream is cut into chunks of `unique` ticks. The last `overlap` ticks
//! past each chunk's end are written both to that chunk and to the next one, so events
//! correlated across a boundary always land together in at least one file:
//!
//! ```text
//!   time0            time0+unique      time0+unique+overlap
//!     │   primary only    │   primary + overlap  │  rotate: close primary,
//!     ▼                   ▼                      ▼  promote overlap
//!     ├───────────────────┼──────────────────────┤
//! ```
//!
//! Closed chunks are handed to the [`Archiver`], which records them in the run log and
//! moves them into place.

use crate::config::{ArchiveSettings, RunSettings};
use crate::error::{AppResult, L2Error};
use crate::header::HeaderCache;
use crate::notify::{Severity, SharedNotifier};
use crate::zdab::{hexdump, BankIndex, BankSink, Record, SinkFactory};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunk geometry in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Unique interval per chunk.
    pub unique: u64,
    /// Trailing interval shared with the next chunk.
    pub overlap: u64,
    /// Stop after opening this many chunks.
    pub max_files: Option<u64>,
}

impl ChunkConfig {
    /// Geometry from run settings.
    pub fn from_settings(settings: &RunSettings) -> Self {
        Self {
            unique: settings.unique_ticks().max(1),
            overlap: settings.overlap_ticks(),
            max_files: settings.chunk.max_files,
        }
    }
}

/// Where a record went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Written to the primary chunk.
    Primary,
    /// Written to the primary and the overlap chunk.
    Both,
    /// Not written (unknown bank).
    Dropped,
    /// The file limit was reached; all streams are closed.
    Exhausted,
}

struct OpenChunk<S> {
    index: u64,
    stream: S,
    records: u64,
    extasy: bool,
}

/// Routes records into at most two open chunks and rotates them as time advances.
pub struct ChunkRouter<F: SinkFactory> {
    factory: F,
    base: PathBuf,
    config: ChunkConfig,
    archiver: Archiver,
    time0: Option<u64>,
    next_index: u64,
    primary: Option<OpenChunk<F::Sink>>,
    overlap: Option<OpenChunk<F::Sink>>,
    exhausted: bool,
    write_errors: u64,
}

impl<F: SinkFactory> ChunkRouter<F> {
    /// Router with nothing open. Chunk files are named after `base`.
    pub fn new(factory: F, base: impl Into<PathBuf>, config: ChunkConfig, archiver: Archiver) -> Self {
        Self {
            factory,
            base: base.into(),
            config,
            archiver,
            time0: None,
            next_index: 0,
            primary: None,
            overlap: None,
            exhausted: false,
            write_errors: 0,
        }
    }

    /// Route one record. Timed records may rotate chunks first; untimed ones go to
    /// whatever is open.
    pub fn route(&mut self, record: &Record, longtime: Option<u64>, headers: &HeaderCache) -> AppResult<Route> {
        let Some(index) = record.bank_index() else {
            warn!(bank = %record.name, len = record.payload.len(), "unrecognised bank, not written");
            debug!("{}", hexdump(&record.payload));
            return Ok(Route::Dropped);
        };
        let route = match longtime {
            Some(t) => self.advance(t, headers)?,
            None => self.ensure_open(headers)?,
        };
        if route == Route::Exhausted {
            return Ok(route);
        }
        self.write(&record.payload, index);
        Ok(route)
    }

    /// Move the window forward to `longtime`, rotating and fast-forwarding over empty
    /// chunks as needed. Returns where a record at `longtime` belongs.
    pub fn advance(&mut self, longtime: u64, headers: &HeaderCache) -> AppResult<Route> {
        if self.exhausted {
            return Ok(Route::Exhausted);
        }
        let mut time0 = match self.time0 {
            Some(t) => t,
            None => {
                self.time0 = Some(longtime);
                if self.primary.is_none() && !self.open_primary(headers)? {
                    return self.stop();
                }
                longtime
            }
        };

        let ChunkConfig { unique, overlap, .. } = self.config;
        let window_end = move |t0: u64| t0.saturating_add(unique).saturating_add(overlap);
        if longtime >= window_end(time0) {
            let mut skipped = 0u64;
            loop {
                if let Some(old) = self.primary.take() {
                    if old.records == 0 {
                        skipped += 1;
                    }
                    self.retire(old)?;
                }
                time0 = time0.saturating_add(unique);
                self.time0 = Some(time0);
                match self.overlap.take() {
                    Some(promoted) => self.primary = Some(promoted),
                    None => {
                        if !self.open_primary(headers)? {
                            return self.stop();
                        }
                    }
                }
                if longtime < window_end(time0) {
                    break;
                }
            }
            if skipped > 0 {
                debug!(skipped, time0, "fast-forwarded over empty chunks");
            }
        }

        if longtime < time0.saturating_add(unique) {
            return Ok(Route::Primary);
        }
        if self.overlap.is_none() {
            match self.open(headers)? {
                Some(chunk) => self.overlap = Some(chunk),
                None => return self.stop(),
            }
        }
        Ok(Route::Both)
    }

    /// Restart chunking at `longtime` after a clock discontinuity.
    pub fn resync(&mut self, longtime: u64, headers: &HeaderCache) -> AppResult<Route> {
        self.close_all()?;
        if self.exhausted {
            return Ok(Route::Exhausted);
        }
        info!(longtime, "restarting chunk sequence after clock reset");
        self.time0 = Some(longtime);
        if !self.open_primary(headers)? {
            return self.stop();
        }
        Ok(Route::Primary)
    }

    /// Flag the open chunks as containing an EXTASY trigger.
    pub fn mark_extasy(&mut self) {
        for chunk in [self.primary.as_mut(), self.overlap.as_mut()].into_iter().flatten() {
            chunk.extasy = true;
        }
    }

    /// Close and archive everything that is open.
    pub fn finish(&mut self) -> AppResult<()> {
        self.close_all()
    }

    /// Start of the current unique interval.
    pub fn time0(&self) -> Option<u64> {
        self.time0
    }

    /// Chunks opened so far.
    pub fn chunks_opened(&self) -> u64 {
        self.next_index
    }

    /// Number of streams currently open.
    pub fn open_streams(&self) -> usize {
        usize::from(self.primary.is_some()) + usize::from(self.overlap.is_some())
    }

    /// Whether the file limit stopped the router.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Banks that could not be written, counted once per stream.
    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// The archiver closed chunks are handed to.
    pub fn archiver(&self) -> &Archiver {
        &self.archiver
    }

    fn ensure_open(&mut self, headers: &HeaderCache) -> AppResult<Route> {
        if self.exhausted {
            return Ok(Route::Exhausted);
        }
        if self.primary.is_none() && !self.open_primary(headers)? {
            return self.stop();
        }
        Ok(if self.overlap.is_some() { Route::Both } else { Route::Primary })
    }

    /// A failed write loses the bank from that chunk only; the run carries on.
    fn write(&mut self, payload: &[u8], index: BankIndex) {
        for chunk in [self.primary.as_mut(), self.overlap.as_mut()].into_iter().flatten() {
            match chunk.stream.write_bank(payload, index) {
                Ok(()) => chunk.records += 1,
                Err(e) => {
                    self.write_errors += 1;
                    self.archiver.notifier.notify(
                        Severity::Error,
                        &format!("Could not write bank to chunk {}: {}", chunk.index, e),
                    );
                }
            }
        }
    }

    fn write_failed(&mut self, what: &str, index: u64, e: &L2Error) {
        self.write_errors += 1;
        self.archiver
            .notifier
            .notify(Severity::Error, &format!("Could not {} chunk {}: {}", what, index, e));
    }

    fn open_primary(&mut self, headers: &HeaderCache) -> AppResult<bool> {
        self.primary = self.open(headers)?;
        Ok(self.primary.is_some())
    }

    fn open(&mut self, headers: &HeaderCache) -> AppResult<Option<OpenChunk<F::Sink>>> {
        if matches!(self.config.max_files, Some(max) if self.next_index >= max) {
            return Ok(None);
        }
        let index = self.next_index;
        let path = chunk_path(&self.base, index);
        let mut stream = self.factory.create(&path)?;
        if let Err(e) = headers.replay(&mut stream) {
            self.write_failed("write headers to", index, &e);
        }
        self.next_index += 1;
        self.archiver.log_opened(index, &path)?;
        debug!(chunk = index, path = %path.display(), "opened chunk");
        Ok(Some(OpenChunk {
            index,
            stream,
            records: 0,
            extasy: false,
        }))
    }

    fn retire(&mut self, chunk: OpenChunk<F::Sink>) -> AppResult<PathBuf> {
        let fallback = chunk.stream.path().to_path_buf();
        let path = match chunk.stream.close() {
            Ok(path) => path,
            Err(e) => {
                self.write_failed("flush", chunk.index, &e);
                fallback
            }
        };
        self.archiver.archive(&ClosedChunk {
            index: chunk.index,
            path,
            records: chunk.records,
            extasy: chunk.extasy,
        })
    }

    fn close_all(&mut self) -> AppResult<()> {
        if let Some(primary) = self.primary.take() {
            self.retire(primary)?;
        }
        if let Some(overlap) = self.overlap.take() {
            self.retire(overlap)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> AppResult<Route> {
        if !self.exhausted {
            info!(opened = self.next_index, "chunk limit reached, stopping");
        }
        self.exhausted = true;
        self.close_all()?;
        Ok(Route::Exhausted)
    }
}

/// File name of chunk `index`.
pub fn chunk_path(base: &Path, index: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!("_{:06}.zdab", index));
    PathBuf::from(name)
}

/// Shared latch set by SIGUSR1 and cleared by SIGUSR2.
pub type PauseFlag = Arc<AtomicBool>;

/// A chunk whose stream has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedChunk {
    /// Chunk number.
    pub index: u64,
    /// Where the stream was written.
    pub path: PathBuf,
    /// Records written, excluding replayed headers.
    pub records: u64,
    /// Whether an EXTASY trigger was seen while it was open.
    pub extasy: bool,
}

#[derive(Serialize)]
struct JobTicket<'a> {
    chunk: u64,
    path: &'a Path,
    records: u64,
    closed_at: String,
}

/// Post-close handling of chunks: run log, completed directory, downstream job tickets
/// and PCA links.
pub struct Archiver {
    settings: ArchiveSettings,
    paused: PauseFlag,
    poll: Duration,
    notifier: SharedNotifier,
}

impl Archiver {
    /// Archiver with its own (cleared) pause flag.
    pub fn new(settings: ArchiveSettings, notifier: SharedNotifier) -> Self {
        Self {
            settings,
            paused: Arc::new(AtomicBool::new(false)),
            poll: Duration::from_millis(200),
            notifier,
        }
    }

    /// Share an externally driven pause flag.
    pub fn with_pause_flag(mut self, paused: PauseFlag) -> Self {
        self.paused = paused;
        self
    }

    /// Handle for toggling the pause state.
    pub fn pause_flag(&self) -> PauseFlag {
        self.paused.clone()
    }

    /// Append an open entry to the run log.
    pub fn log_opened(&self, index: u64, path: &Path) -> AppResult<()> {
        self.append_run_log(&format!("open {} {}", index, path.display()))
    }

    /// Archive a closed chunk and return its final location.
    pub fn archive(&self, chunk: &ClosedChunk) -> AppResult<PathBuf> {
        self.wait_while_paused();

        let mut path = chunk.path.clone();
        if let Some(dir) = &self.settings.completed_dir {
            match move_into(&chunk.path, dir) {
                Ok(moved) => path = moved,
                Err(e) => self.notifier.notify(
                    Severity::Error,
                    &format!("Could not move {} to {}: {}", chunk.path.display(), dir.display(), e),
                ),
            }
        }

        self.append_run_log(&format!("close {} {} {}", chunk.index, path.display(), chunk.records))?;
        info!(chunk = chunk.index, records = chunk.records, path = %path.display(), "chunk finished");

        if chunk.extasy {
            if let Some(dir) = &self.settings.pca_dir {
                if let Err(e) = link_into(&path, dir) {
                    self.notifier.notify(
                        Severity::Error,
                        &format!("Failed to link {} for PCA processing: {}", path.display(), e),
                    );
                }
            }
        }

        if let Some(dir) = &self.settings.job_dir {
            if let Err(e) = write_ticket(chunk, &path, dir) {
                self.notifier.notify(
                    Severity::Error,
                    &format!("Could not queue job for chunk {}: {}", chunk.index, e),
                );
            }
        }
        Ok(path)
    }

    fn wait_while_paused(&self) {
        if !self.paused.load(Ordering::SeqCst) {
            return;
        }
        info!("paused, holding closed chunk until resumed");
        while self.paused.load(Ordering::SeqCst) {
            std::thread::sleep(self.poll);
        }
        info!("resumed");
    }

    fn append_run_log(&self, line: &str) -> AppResult<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.run_log)?;
        writeln!(log, "{} {}", chrono::Utc::now().to_rfc3339(), line)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> AppResult<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| L2Error::InvalidSettings(format!("{} has no file name", path.display())))
}

fn move_into(path: &Path, dir: &Path) -> AppResult<PathBuf> {
    let target = dir.join(file_name(path)?);
    fs::rename(path, &target)?;
    Ok(target)
}

fn link_into(path: &Path, dir: &Path) -> AppResult<PathBuf> {
    let target = dir.join(file_name(path)?);
    fs::hard_link(path, &target)?;
    Ok(target)
}

fn write_ticket(chunk: &ClosedChunk, path: &Path, dir: &Path) -> AppResult<PathBuf> {
    let ticket = JobTicket {
        chunk: chunk.index,
        path,
        records: chunk.records,
        closed_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut name = file_name(path)?.to_owned();
    name.push(".job.json");
    let target = dir.join(name);
    fs::write(&target, serde_json::to_vec_pretty(&ticket)?)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryFactory, RecordingNotifier};
    use crate::zdab::{BankName, TriggerCard};

    struct Fixture {
        router: ChunkRouter<MemoryFactory>,
        factory: MemoryFactory,
        headers: HeaderCache,
        _dir: tempfile::TempDir,
    }

    fn fixture(unique: u64, overlap: u64, max_files: Option<u64>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = ArchiveSettings {
            run_log: dir.path().join("run.log"),
            ..ArchiveSettings::default()
        };
        let archiver = Archiver::new(settings, Arc::new(RecordingNotifier::default()));
        let factory = MemoryFactory::default();
        let config = ChunkConfig {
            unique,
            overlap,
            max_files,
        };
        Fixture {
            router: ChunkRouter::new(factory.clone(), "run", config, archiver),
            factory,
            headers: HeaderCache::new(),
            _dir: dir,
        }
    }

    fn event(t: u64) -> Record {
        Record::event(10, TriggerCard::from_parts(t, t / 5, 0), &[])
    }

    #[test]
    fn boundary_is_overlap_inclusive() {
        let mut f = fixture(1_000, 100, None);
        assert_eq!(f.router.route(&event(5_000), Some(5_000), &f.headers).unwrap(), Route::Primary);
        assert_eq!(f.router.route(&event(5_999), Some(5_999), &f.headers).unwrap(), Route::Primary);
        assert_eq!(f.router.open_streams(), 1);
        assert_eq!(f.router.route(&event(6_000), Some(6_000), &f.headers).unwrap(), Route::Both);
        assert_eq!(f.router.open_streams(), 2);
        assert_eq!(f.router.route(&event(6_099), Some(6_099), &f.headers).unwrap(), Route::Both);

        // First record past the overlap window rotates.
        assert_eq!(f.router.route(&event(6_100), Some(6_100), &f.headers).unwrap(), Route::Primary);
        assert_eq!(f.router.time0(), Some(6_000));
        assert_eq!(f.router.open_streams(), 1);

        let first = f.factory.banks(&chunk_path(Path::new("run"), 0));
        let second = f.factory.banks(&chunk_path(Path::new("run"), 1));
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn gap_fast_forwards_over_empty_chunks() {
        let mut f = fixture(1_000, 0, None);
        f.router.route(&event(100), Some(100), &f.headers).unwrap();
        f.router.route(&event(4_500), Some(4_500), &f.headers).unwrap();
        assert_eq!(f.router.time0(), Some(4_100));
        assert_eq!(f.router.chunks_opened(), 5);
        for i in 1..4 {
            assert!(f.factory.banks(&chunk_path(Path::new("run"), i)).is_empty());
        }
        assert_eq!(f.factory.banks(&chunk_path(Path::new("run"), 4)).len(), 1);
    }

    #[test]
    fn new_chunks_start_with_headers() {
        let mut f = fixture(1_000, 100, None);
        let rhdr = Record::new(BankName::RHDR, vec![1u8; 8]);
        f.router.route(&rhdr, None, &f.headers).unwrap();
        f.headers.observe(&rhdr);
        f.router.route(&event(10), Some(10), &f.headers).unwrap();
        f.router.route(&event(1_010), Some(1_010), &f.headers).unwrap();

        let first = f.factory.banks(&chunk_path(Path::new("run"), 0));
        assert_eq!(first[0].0, BankIndex(2));
        assert_eq!(first.len(), 3);
        let overlap = f.factory.banks(&chunk_path(Path::new("run"), 1));
        assert_eq!(overlap.len(), 2);
        assert_eq!(overlap[0], (BankIndex(2), bytes::Bytes::from(vec![1u8; 8])));
    }

    #[test]
    fn unknown_bank_is_dropped() {
        let mut f = fixture(1_000, 100, None);
        let odd = Record::new(BankName(*b"ZZZZ"), vec![0u8; 3]);
        assert_eq!(f.router.route(&odd, None, &f.headers).unwrap(), Route::Dropped);
        assert_eq!(f.router.open_streams(), 0);
    }

    #[test]
    fn file_limit_stops_cleanly() {
        let mut f = fixture(1_000, 0, Some(2));
        f.router.route(&event(10), Some(10), &f.headers).unwrap();
        f.router.route(&event(1_010), Some(1_010), &f.headers).unwrap();
        assert_eq!(f.router.route(&event(2_010), Some(2_010), &f.headers).unwrap(), Route::Exhausted);
        assert!(f.router.is_exhausted());
        assert_eq!(f.router.open_streams(), 0);
        assert_eq!(f.router.route(&event(2_020), Some(2_020), &f.headers).unwrap(), Route::Exhausted);
        assert_eq!(f.factory.created().len(), 2);
    }

    #[test]
    fn resync_starts_fresh_chunk() {
        let mut f = fixture(1_000, 100, None);
        f.router.route(&event(50_000), Some(50_000), &f.headers).unwrap();
        f.router.route(&event(51_050), Some(51_050), &f.headers).unwrap();
        assert_eq!(f.router.open_streams(), 2);

        assert_eq!(f.router.resync(300, &f.headers).unwrap(), Route::Primary);
        assert_eq!(f.router.time0(), Some(300));
        assert_eq!(f.router.open_streams(), 1);
        assert_eq!(f.router.route(&event(400), Some(400), &f.headers).unwrap(), Route::Primary);
        assert_eq!(f.factory.banks(&chunk_path(Path::new("run"), 2)).len(), 1);
    }

    #[test]
    fn failed_writes_are_counted_and_routing_continues() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = ArchiveSettings {
            run_log: dir.path().join("run.log"),
            ..ArchiveSettings::default()
        };
        let factory = MemoryFactory::default();
        let config = ChunkConfig {
            unique: 1_000,
            overlap: 100,
            max_files: None,
        };
        let mut router = ChunkRouter::new(factory.clone(), "run", config, Archiver::new(settings, notifier.clone()));
        let headers = HeaderCache::new();

        router.route(&event(10), Some(10), &headers).unwrap();
        factory.fail_writes(true);
        assert_eq!(router.route(&event(1_050), Some(1_050), &headers).unwrap(), Route::Both);
        assert_eq!(router.write_errors(), 2);
        assert!(notifier.contains(Severity::Error, "Could not write bank to chunk 0"));

        factory.fail_writes(false);
        assert_eq!(router.route(&event(1_500), Some(1_500), &headers).unwrap(), Route::Primary);
        assert_eq!(router.write_errors(), 2);
        assert_eq!(factory.banks(&chunk_path(Path::new("run"), 0)).len(), 1);
        assert_eq!(factory.banks(&chunk_path(Path::new("run"), 1)).len(), 1);
    }

    #[test]
    fn archiver_moves_links_and_queues() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("done");
        let pca = dir.path().join("pca");
        let jobs = dir.path().join("jobs");
        for d in [&done, &pca, &jobs] {
            fs::create_dir(d).unwrap();
        }
        let settings = ArchiveSettings {
            completed_dir: Some(done.clone()),
            run_log: dir.path().join("run.log"),
            job_dir: Some(jobs.clone()),
            pca_dir: Some(pca.clone()),
        };
        let archiver = Archiver::new(settings, Arc::new(RecordingNotifier::default()));

        let chunk_file = dir.path().join("run_000003.zdab");
        fs::write(&chunk_file, b"data").unwrap();
        let closed = ClosedChunk {
            index: 3,
            path: chunk_file.clone(),
            records: 12,
            extasy: true,
        };
        let final_path = archiver.archive(&closed).unwrap();

        assert_eq!(final_path, done.join("run_000003.zdab"));
        assert!(!chunk_file.exists());
        assert!(pca.join("run_000003.zdab").exists());

        let ticket: serde_json::Value =
            serde_json::from_slice(&fs::read(jobs.join("run_000003.zdab.job.json")).unwrap()).unwrap();
        assert_eq!(ticket["chunk"], 3);
        assert_eq!(ticket["records"], 12);

        let log = fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("close 3 "));
    }

    #[test]
    fn failed_pca_link_alerts_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = ArchiveSettings {
            run_log: dir.path().join("run.log"),
            pca_dir: Some(dir.path().join("missing")),
            ..ArchiveSettings::default()
        };
        let archiver = Archiver::new(settings, notifier.clone());
        let chunk_file = dir.path().join("run_000000.zdab");
        fs::write(&chunk_file, b"data").unwrap();
        let closed = ClosedChunk {
            index: 0,
            path: chunk_file.clone(),
            records: 1,
            extasy: true,
        };
        assert_eq!(archiver.archive(&closed).unwrap(), chunk_file);
        assert!(notifier.contains(Severity::Error, "PCA"));
    }

    #[test]
    fn pause_holds_archival_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ArchiveSettings {
            run_log: dir.path().join("run.log"),
            ..ArchiveSettings::default()
        };
        let mut archiver = Archiver::new(settings, Arc::new(RecordingNotifier::default()));
        archiver.poll = Duration::from_millis(5);
        let flag = archiver.pause_flag();
        flag.store(true, Ordering::SeqCst);

        let releaser = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                flag.store(false, Ordering::SeqCst);
            })
        };
        let chunk_file = dir.path().join("run_000000.zdab");
        fs::write(&chunk_file, b"x").unwrap();
        let closed = ClosedChunk {
            index: 0,
            path: chunk_file,
            records: 0,
            extasy: false,
        };
        archiver.archive(&closed).unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        releaser.join().unwrap();
    }
}
