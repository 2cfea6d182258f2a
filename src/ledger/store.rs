//! Durable backing stores for the selection ledger

use super::{LedgerError, LedgerState};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::debug;

/// Where ledger state lives between process runs
///
/// Several ledgers may share one store (two clients on one file, or a
/// `stats`/`reset` run next to a live connection), so mutations go through
/// [`update`](LedgerStore::update), which applies the change to the latest
/// persisted state rather than to a copy loaded earlier.
pub trait LedgerStore: Send + Sync {
    /// Load persisted state; `None` when nothing has been saved yet
    fn load(&self) -> Result<Option<LedgerState>, LedgerError>;

    /// Persist the full state, atomically
    fn save(&self, state: &LedgerState) -> Result<(), LedgerError>;

    /// Re-read, apply `apply`, persist, and return the persisted state
    ///
    /// No other writer of the same store runs in between.
    fn update(&self, apply: &dyn Fn(&mut LedgerState)) -> Result<LedgerState, LedgerError>;
}

/// In-memory store
///
/// Clones share the same slot, so dropping a ledger and reopening it on
/// a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<LedgerState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<Option<LedgerState>, LedgerError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, state: &LedgerState) -> Result<(), LedgerError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    fn update(&self, apply: &dyn Fn(&mut LedgerState)) -> Result<LedgerState, LedgerError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = slot.clone().unwrap_or_default();
        apply(&mut state);
        *slot = Some(state.clone());
        Ok(state)
    }
}

/// JSON file store
///
/// Writes go to a uniquely named temp file in the same directory that is
/// renamed over the target, so a crash mid-write leaves the previous state
/// intact. Writers serialize on an advisory lock held on a `.lock` sibling.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file the writer lock is held on
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("ledger"));
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Exclusive writer lock, released when the returned file is dropped
    fn lock(&self) -> Result<File, LedgerError> {
        std::fs::create_dir_all(self.dir())?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn write(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let mut temp = NamedTempFile::new_in(self.dir())?;
        serde_json::to_writer_pretty(&mut temp, state)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), "Selection ledger persisted");
        Ok(())
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> Result<Option<LedgerState>, LedgerError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: LedgerState = serde_json::from_str(&content)?;
        if state.version != LedgerState::VERSION {
            return Err(LedgerError::Version(state.version));
        }
        Ok(Some(state))
    }

    fn save(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let _lock = self.lock()?;
        self.write(state)
    }

    fn update(&self, apply: &dyn Fn(&mut LedgerState)) -> Result<LedgerState, LedgerError> {
        let _lock = self.lock()?;
        let mut state = self.load()?.unwrap_or_default();
        apply(&mut state);
        self.write(&state)?;
        Ok(state)
    }
}
