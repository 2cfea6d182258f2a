//! Selection ledger
//!
//! Remembers, per destination host, which disguise last worked and how
//! every disguise has fared. Every mutation is written through to the
//! backing store before it becomes visible, so a crash right after a
//! successful connect keeps the learned preference.
//!
//! Mutations are applied to the store's latest state under its writer
//! lock, so ledgers sharing one file never drop each other's records.
//! Reads are served from memory: the state as of `open` or this ledger's
//! last write, whichever is newer.
//!
//! Writes are blocking file I/O. Async callers run them on the blocking
//! pool, as [`FallbackDriver`](crate::fallback::FallbackDriver) does.

mod store;

pub use store::{JsonFileStore, LedgerStore, MemoryStore};

use crate::disguise::{Catalog, DisguiseProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Unsupported ledger version: {0}")]
    Version(u32),
}

/// Outcome history of one (host, disguise) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Everything learned about one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Id of the disguise that last registered successfully
    pub last_successful: Option<String>,
    /// Per-disguise records, keyed by disguise id
    #[serde(default)]
    pub disguises: BTreeMap<String, SelectionRecord>,
}

/// Persisted ledger contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub version: u32,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostRecord>,
}

impl LedgerState {
    /// Current on-disk format version
    pub const VERSION: u32 = 1;
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            hosts: BTreeMap::new(),
        }
    }
}

/// Adaptive disguise ordering backed by a durable store
pub struct SelectionLedger {
    catalog: Catalog,
    store: Box<dyn LedgerStore>,
    state: Mutex<LedgerState>,
}

impl SelectionLedger {
    /// Open a ledger, loading whatever the store holds
    pub fn open(catalog: Catalog, store: Box<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let state = store.load()?.unwrap_or_default();
        debug!("Selection ledger opened with {} host(s)", state.hosts.len());

        Ok(Self {
            catalog,
            store,
            state: Mutex::new(state),
        })
    }

    /// Open a ledger persisted as a JSON file
    pub fn open_file(catalog: Catalog, path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open(catalog, Box::new(JsonFileStore::new(path)))
    }

    /// Fresh ledger that forgets everything on drop
    pub fn in_memory(catalog: Catalog) -> Self {
        Self {
            catalog,
            store: Box::new(MemoryStore::new()),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Catalog this ledger orders
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Candidates for `host`: last success first, then catalog order
    pub fn best_first_order(&self, host: &str) -> Vec<&'static DisguiseProfile> {
        let last = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .hosts
                .get(host)
                .and_then(|h| h.last_successful.clone())
        };

        let mut order = Vec::with_capacity(self.catalog.len());
        if let Some(preferred) = last.and_then(|id| self.catalog.by_id(&id).ok()) {
            order.push(preferred);
        }
        for profile in self.catalog.list_all() {
            if !order.iter().any(|p| p.id == profile.id) {
                order.push(*profile);
            }
        }
        order
    }

    /// Record a successful registration
    pub fn record_success(&self, host: &str, disguise_id: &str) -> Result<(), LedgerError> {
        self.update(|state| {
            let host_record = state.hosts.entry(host.to_string()).or_default();
            let record = host_record
                .disguises
                .entry(disguise_id.to_string())
                .or_default();
            record.success_count = record.success_count.saturating_add(1);
            record.last_success_time = Some(Utc::now());
            host_record.last_successful = Some(disguise_id.to_string());
        })
    }

    /// Record a failed registration
    pub fn record_failure(&self, host: &str, disguise_id: &str) -> Result<(), LedgerError> {
        self.update(|state| {
            let record = state
                .hosts
                .entry(host.to_string())
                .or_default()
                .disguises
                .entry(disguise_id.to_string())
                .or_default();
            record.failure_count = record.failure_count.saturating_add(1);
            record.last_failure_time = Some(Utc::now());
        })
    }

    /// History of one pair; all zeros when nothing was recorded
    pub fn stats(&self, host: &str, disguise_id: &str) -> SelectionRecord {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .hosts
            .get(host)
            .and_then(|h| h.disguises.get(disguise_id))
            .copied()
            .unwrap_or_default()
    }

    /// Forget everything about `host`
    pub fn reset(&self, host: &str) -> Result<(), LedgerError> {
        self.update(|state| {
            state.hosts.remove(host);
        })?;
        info!(host = %host, "Selection ledger reset");
        Ok(())
    }

    /// Hosts with recorded history
    pub fn hosts(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hosts.keys().cloned().collect()
    }

    /// Full record for `host`, if any
    pub fn snapshot(&self, host: &str) -> Option<HostRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hosts.get(host).cloned()
    }

    /// Apply `f` on top of the store's latest state, then publish the result
    fn update<F>(&self, f: F) -> Result<(), LedgerError>
    where
        F: Fn(&mut LedgerState),
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = self.store.update(&f)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "vpn.example.com";

    fn catalog_ids(ledger: &SelectionLedger, host: &str) -> Vec<&'static str> {
        ledger.best_first_order(host).iter().map(|p| p.id).collect()
    }

    #[test]
    fn test_default_order_is_catalog_order() {
        let ledger = SelectionLedger::in_memory(Catalog::builtin());
        let expected: Vec<&str> = Catalog::builtin().list_all().iter().map(|p| p.id).collect();
        assert_eq!(catalog_ids(&ledger, HOST), expected);
    }

    #[test]
    fn test_last_success_first_without_duplicates() {
        let ledger = SelectionLedger::in_memory(Catalog::builtin());
        ledger.record_success(HOST, "vk").unwrap();

        let order = catalog_ids(&ledger, HOST);
        assert_eq!(order[0], "vk");
        assert_eq!(order.len(), Catalog::builtin().len());
        assert_eq!(order.iter().filter(|id| **id == "vk").count(), 1);

        // Remaining entries keep descending priority
        let rest: Vec<u8> = ledger.best_first_order(HOST)[1..]
            .iter()
            .map(|p| p.priority)
            .collect();
        assert!(rest.windows(2).all(|w| w[0] >= w[1]));

        // Other hosts are unaffected
        assert_eq!(catalog_ids(&ledger, "other.example.com")[0], "https");
    }

    #[test]
    fn test_latest_success_wins() {
        let ledger = SelectionLedger::in_memory(Catalog::builtin());
        ledger.record_success(HOST, "vk").unwrap();
        ledger.record_success(HOST, "doh").unwrap();
        ledger.record_failure(HOST, "doh").unwrap();
        assert_eq!(catalog_ids(&ledger, HOST)[0], "doh");
    }

    #[test]
    fn test_unknown_last_success_is_ignored() {
        let store = MemoryStore::new();
        {
            let full = SelectionLedger::open(Catalog::builtin(), Box::new(store.clone())).unwrap();
            full.record_success(HOST, "wechat").unwrap();
        }

        let restricted = Catalog::with_enabled(&["https", "zoom"]).unwrap();
        let ledger = SelectionLedger::open(restricted, Box::new(store)).unwrap();
        assert_eq!(catalog_ids(&ledger, HOST), vec!["https", "zoom"]);
    }

    #[test]
    fn test_counters() {
        let ledger = SelectionLedger::in_memory(Catalog::builtin());
        ledger.record_failure(HOST, "teams").unwrap();
        ledger.record_failure(HOST, "teams").unwrap();
        ledger.record_success(HOST, "teams").unwrap();

        let stats = ledger.stats(HOST, "teams");
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 2);
        assert!(stats.last_success_time.is_some());
        assert!(stats.last_failure_time.is_some());

        assert_eq!(ledger.stats(HOST, "zoom"), SelectionRecord::default());
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");

        let (stats, order) = {
            let ledger = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
            ledger.record_failure(HOST, "https").unwrap();
            ledger.record_success(HOST, "google").unwrap();
            (ledger.stats(HOST, "https"), catalog_ids(&ledger, HOST))
        };

        let reopened = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        assert_eq!(reopened.stats(HOST, "https"), stats);
        assert_eq!(catalog_ids(&reopened, HOST), order);
        assert_eq!(order[0], "google");
        assert_eq!(reopened.hosts(), vec![HOST.to_string()]);
    }

    #[test]
    fn test_ledgers_sharing_a_file_keep_each_others_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");

        let a = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        let b = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();

        a.record_success("a.example.com", "zoom").unwrap();
        b.record_success("b.example.com", "vk").unwrap();
        b.record_failure("a.example.com", "https").unwrap();

        // The later writer sees the earlier one's record
        assert_eq!(b.hosts(), vec!["a.example.com".to_string(), "b.example.com".to_string()]);

        let reopened = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        assert_eq!(reopened.hosts().len(), 2);
        assert_eq!(catalog_ids(&reopened, "a.example.com")[0], "zoom");
        assert_eq!(catalog_ids(&reopened, "b.example.com")[0], "vk");
        assert_eq!(reopened.stats("a.example.com", "zoom").success_count, 1);
        assert_eq!(reopened.stats("a.example.com", "https").failure_count, 1);

        // A reset from a second process only removes its host
        let cli = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        cli.reset("b.example.com").unwrap();
        a.record_failure("a.example.com", "teams").unwrap();
        assert_eq!(a.hosts(), vec!["a.example.com".to_string()]);
        assert_eq!(a.stats("a.example.com", "zoom").success_count, 1);
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.json");

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let ledger = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
                    for _ in 0..25 {
                        ledger.record_failure(HOST, "doh").unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let reopened = SelectionLedger::open_file(Catalog::builtin(), &path).unwrap();
        assert_eq!(reopened.stats(HOST, "doh").failure_count, 100);
    }

    #[test]
    fn test_reset_restores_catalog_order() {
        let ledger = SelectionLedger::in_memory(Catalog::builtin());
        ledger.record_success(HOST, "yandex").unwrap();
        ledger.record_success("keep.example.com", "zoom").unwrap();

        ledger.reset(HOST).unwrap();

        let expected: Vec<&str> = Catalog::builtin().list_all().iter().map(|p| p.id).collect();
        assert_eq!(catalog_ids(&ledger, HOST), expected);
        assert_eq!(ledger.stats(HOST, "yandex"), SelectionRecord::default());
        assert!(ledger.snapshot(HOST).is_none());
        assert_eq!(catalog_ids(&ledger, "keep.example.com")[0], "zoom");
    }

    struct FailingStore;

    impl LedgerStore for FailingStore {
        fn load(&self) -> Result<Option<LedgerState>, LedgerError> {
            Ok(None)
        }

        fn save(&self, _state: &LedgerState) -> Result<(), LedgerError> {
            Err(LedgerError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }

        fn update(&self, _apply: &dyn Fn(&mut LedgerState)) -> Result<LedgerState, LedgerError> {
            self.save(&LedgerState::default())?;
            Ok(LedgerState::default())
        }
    }

    #[test]
    fn test_failed_write_is_not_published() {
        let ledger = SelectionLedger::open(Catalog::builtin(), Box::new(FailingStore)).unwrap();
        assert!(ledger.record_success(HOST, "zoom").is_err());
        assert_eq!(ledger.stats(HOST, "zoom"), SelectionRecord::default());
        assert_eq!(catalog_ids(&ledger, HOST)[0], "https");
    }
}
