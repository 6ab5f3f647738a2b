//! In-memory doubles shared by the unit tests.

use crate::error::AppResult;
use crate::notify::{Notifier, Severity};
use crate::zdab::{BankIndex, BankSink, SinkFactory};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FileMap = Arc<Mutex<BTreeMap<PathBuf, Vec<(BankIndex, Bytes)>>>>;

/// Stream that appends banks to a shared in-memory file table.
pub struct MemorySink {
    path: PathBuf,
    files: FileMap,
    failing: Arc<AtomicBool>,
}

impl MemorySink {
    /// Standalone stream with its own table.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let files: FileMap = Arc::default();
        files.lock().insert(path.clone(), Vec::new());
        Self {
            path,
            files,
            failing: Arc::default(),
        }
    }

    /// Banks written so far.
    pub fn banks(&self) -> Vec<(BankIndex, Bytes)> {
        self.files.lock().get(&self.path).cloned().unwrap_or_default()
    }
}

impl BankSink for MemorySink {
    fn write_bank(&mut self, payload: &[u8], index: BankIndex) -> AppResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(std::io::Error::other("No space left on device").into());
        }
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .push((index, Bytes::copy_from_slice(payload)));
        Ok(())
    }

    fn close(self) -> AppResult<PathBuf> {
        Ok(self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Factory whose streams all share one table, inspectable after the fact.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    files: FileMap,
    created: Arc<Mutex<Vec<PathBuf>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryFactory {
    /// Banks written to `path`.
    pub fn banks(&self, path: &Path) -> Vec<(BankIndex, Bytes)> {
        self.files.lock().get(path).cloned().unwrap_or_default()
    }

    /// Make every stream from this factory fail its writes, as a full disk would.
    pub fn fail_writes(&self, on: bool) {
        self.failing.store(on, Ordering::Relaxed);
    }

    /// Paths in creation order.
    pub fn created(&self) -> Vec<PathBuf> {
        self.created.lock().clone()
    }
}

impl SinkFactory for MemoryFactory {
    type Sink = MemorySink;

    fn create(&self, path: &Path) -> AppResult<MemorySink> {
        self.files.lock().insert(path.to_path_buf(), Vec::new());
        self.created.lock().push(path.to_path_buf());
        Ok(MemorySink {
            path: path.to_path_buf(),
            files: self.files.clone(),
            failing: self.failing.clone(),
        })
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    /// Whether a message of `severity` containing `needle` was seen.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(s, m)| *s == severity && m.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}
