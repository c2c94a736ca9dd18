//! Two-tier key/value storage for attribution state.
//!
//! The session tier holds last-touch data for the current browser session; the
//! durable tier holds first-touch data, the client id and re-engagement
//! bookkeeping across sessions. Backend failures never reach callers of the
//! plain accessors: reads become `None` and writes become no-ops.

use crate::error::{AttributionError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Which storage tier a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    Session,
    Durable,
}

/// Every named field the attribution subsystem persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StoreKey {
    UtmSource,
    UtmMedium,
    UtmCampaign,
    UtmTerm,
    UtmContent,
    LandingPage,
    Referrer,
    FirstVisit,
    FirstTouchSource,
    FirstTouchMedium,
    FirstTouchCampaign,
    FirstTouchTerm,
    FirstTouchContent,
    FirstTouchTimestamp,
    FirstTouchReferrer,
    GaClientId,
    UserEmail,
    ReengagementTracked,
    LastReengagement,
}

impl StoreKey {
    pub(crate) const SESSION_KEYS: [StoreKey; 8] = [
        StoreKey::UtmSource,
        StoreKey::UtmMedium,
        StoreKey::UtmCampaign,
        StoreKey::UtmTerm,
        StoreKey::UtmContent,
        StoreKey::LandingPage,
        StoreKey::Referrer,
        StoreKey::FirstVisit,
    ];

    pub(crate) const DURABLE_KEYS: [StoreKey; 11] = [
        StoreKey::FirstTouchSource,
        StoreKey::FirstTouchMedium,
        StoreKey::FirstTouchCampaign,
        StoreKey::FirstTouchTerm,
        StoreKey::FirstTouchContent,
        StoreKey::FirstTouchTimestamp,
        StoreKey::FirstTouchReferrer,
        StoreKey::GaClientId,
        StoreKey::UserEmail,
        StoreKey::ReengagementTracked,
        StoreKey::LastReengagement,
    ];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            StoreKey::UtmSource => "utm_source",
            StoreKey::UtmMedium => "utm_medium",
            StoreKey::UtmCampaign => "utm_campaign",
            StoreKey::UtmTerm => "utm_term",
            StoreKey::UtmContent => "utm_content",
            StoreKey::LandingPage => "attr_landing_page",
            StoreKey::Referrer => "attr_referrer",
            StoreKey::FirstVisit => "attr_first_visit",
            StoreKey::FirstTouchSource => "attr_first_touch_source",
            StoreKey::FirstTouchMedium => "attr_first_touch_medium",
            StoreKey::FirstTouchCampaign => "attr_first_touch_campaign",
            StoreKey::FirstTouchTerm => "attr_first_touch_term",
            StoreKey::FirstTouchContent => "attr_first_touch_content",
            StoreKey::FirstTouchTimestamp => "attr_first_touch_timestamp",
            StoreKey::FirstTouchReferrer => "attr_first_touch_referrer",
            StoreKey::GaClientId => "attr_ga_client_id",
            StoreKey::UserEmail => "attr_user_email",
            StoreKey::ReengagementTracked => "attr_reengagement_tracked",
            StoreKey::LastReengagement => "attr_last_reengagement",
        }
    }

    pub(crate) fn tier(&self) -> Tier {
        if Self::SESSION_KEYS.contains(self) {
            Tier::Session
        } else {
            Tier::Durable
        }
    }
}

/// A string key/value store such as `sessionStorage` or `localStorage`.
pub(crate) trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Writes `value` unless the key holds a non-empty value, as one atomic
    /// step. Returns whether the write happened.
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;
}

/// Process-local backend.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryBackend {
    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| AttributionError::StorageUnavailable("memory store lock poisoned".to_string()))
    }
}

#[cfg(test)]
impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|v| !v.is_empty()) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

/// Backend persisted as a JSON object in a single file.
#[derive(Debug)]
pub(crate) struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn unavailable(&self, what: &str, err: impl std::fmt::Display) -> AttributionError {
        AttributionError::StorageUnavailable(format!(
            "Failed to {} {}: {}",
            what,
            self.path.display(),
            err
        ))
    }

    /// Raw file content; `None` when the file is missing or blank.
    fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.unavailable("read", e))?;
        Ok(Some(content).filter(|c| !c.trim().is_empty()))
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        match self.read()? {
            Some(content) => serde_json::from_str(&content).map_err(|e| self.unavailable("parse", e)),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Like `load`, but an unparseable file is dropped so the tier can be
    /// written again.
    fn load_for_update(&self) -> Result<BTreeMap<String, String>> {
        let Some(content) = self.read()? else {
            return Ok(BTreeMap::new());
        };
        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Resetting unreadable attribution state in {}: {}", self.path.display(), e);
            BTreeMap::new()
        }))
    }

    /// Writes to a sibling temp file and renames it over the target, so
    /// readers never see a partly written file.
    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(|e| self.unavailable("create directory for", e))?;
                parent
            }
            None => Path::new("."),
        };
        let content = serde_json::to_string_pretty(entries)?;
        let mut file =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| self.unavailable("create temp file for", e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| self.unavailable("write", e))?;
        file.persist(&self.path)
            .map_err(|e| self.unavailable("replace", e.error))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| self.unavailable("lock", "poisoned"))
    }

    fn modify(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let _guard = self.lock()?;
        let mut entries = self.load_for_update()?;
        apply(&mut entries);
        self.save(&entries)
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock()?;
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let mut entries = self.load_for_update()?;
        if entries.get(key).is_some_and(|v| !v.is_empty()) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)?;
        Ok(true)
    }
}

/// Backend for contexts with no storage at all, such as server-side rendering.
#[derive(Debug, Default)]
pub(crate) struct UnavailableBackend;

impl KeyValueBackend for UnavailableBackend {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(AttributionError::StorageUnavailable("no storage in this context".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(AttributionError::StorageUnavailable("no storage in this context".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(AttributionError::StorageUnavailable("no storage in this context".to_string()))
    }

    fn set_if_absent(&self, _key: &str, _value: &str) -> Result<bool> {
        Err(AttributionError::StorageUnavailable("no storage in this context".to_string()))
    }
}

/// The attribution store shared by capture, resolution and re-engagement.
#[derive(Clone)]
pub(crate) struct AttributionStore {
    session: Arc<dyn KeyValueBackend>,
    durable: Arc<dyn KeyValueBackend>,
}

impl AttributionStore {
    pub(crate) fn new(session: Arc<dyn KeyValueBackend>, durable: Arc<dyn KeyValueBackend>) -> Self {
        Self { session, durable }
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()), Arc::new(MemoryBackend::default()))
    }

    /// Stores each tier in its own JSON file under `dir`.
    pub(crate) fn file_backed(dir: &Path) -> Self {
        Self::new(
            Arc::new(FileBackend::new(dir.join("session.json"))),
            Arc::new(FileBackend::new(dir.join("durable.json"))),
        )
    }

    /// File-backed store under `dir`, or a store that persists nothing when
    /// the directory cannot be created.
    pub(crate) fn open(dir: &Path) -> Self {
        match fs::create_dir_all(dir) {
            Ok(()) => Self::file_backed(dir),
            Err(e) => {
                tracing::warn!("Attribution state directory {} unavailable, nothing will be persisted: {}", dir.display(), e);
                Self::unavailable()
            }
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self::new(Arc::new(UnavailableBackend), Arc::new(UnavailableBackend))
    }

    fn backend(&self, tier: Tier) -> &dyn KeyValueBackend {
        match tier {
            Tier::Session => self.session.as_ref(),
            Tier::Durable => self.durable.as_ref(),
        }
    }

    /// Reads a key, treating an empty value as absent.
    pub(crate) fn try_get(&self, key: StoreKey) -> Result<Option<String>> {
        let value = self.backend(key.tier()).get(key.as_str())?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub(crate) fn try_set(&self, key: StoreKey, value: &str) -> Result<()> {
        self.backend(key.tier()).set(key.as_str(), value)
    }

    pub(crate) fn get(&self, key: StoreKey) -> Option<String> {
        self.try_get(key).unwrap_or_else(|e| {
            tracing::debug!("Read of {} skipped: {}", key.as_str(), e);
            None
        })
    }

    /// Writes a key; returns whether the write landed.
    pub(crate) fn set(&self, key: StoreKey, value: &str) -> bool {
        match self.try_set(key, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Write of {} skipped: {}", key.as_str(), e);
                false
            }
        }
    }

    /// Writes only when the key is currently unset. This is what keeps
    /// first-touch data write-once: the earliest writer wins.
    pub(crate) fn set_if_absent(&self, key: StoreKey, value: &str) -> bool {
        match self.backend(key.tier()).set_if_absent(key.as_str(), value) {
            Ok(written) => written,
            Err(e) => {
                tracing::debug!("Conditional write of {} skipped: {}", key.as_str(), e);
                false
            }
        }
    }

    pub(crate) fn remove(&self, key: StoreKey) {
        if let Err(e) = self.backend(key.tier()).remove(key.as_str()) {
            tracing::debug!("Removal of {} skipped: {}", key.as_str(), e);
        }
    }

    /// Forgets everything about the current session (last touch, landing page, referrer).
    pub(crate) fn clear_session(&self) {
        for key in StoreKey::SESSION_KEYS {
            self.remove(key);
        }
    }

    /// Explicit durable-tier reset; the only way first-touch data or the client id go away.
    pub(crate) fn clear_durable(&self) {
        for key in StoreKey::DURABLE_KEYS {
            self.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_map_to_expected_tiers() {
        assert_eq!(StoreKey::UtmSource.tier(), Tier::Session);
        assert_eq!(StoreKey::FirstVisit.tier(), Tier::Session);
        assert_eq!(StoreKey::FirstTouchSource.tier(), Tier::Durable);
        assert_eq!(StoreKey::GaClientId.tier(), Tier::Durable);
        assert_eq!(StoreKey::ReengagementTracked.tier(), Tier::Durable);
    }

    #[test]
    fn test_set_if_absent_keeps_first_value() {
        let store = AttributionStore::in_memory();
        assert!(store.set_if_absent(StoreKey::FirstTouchSource, "google"));
        assert!(!store.set_if_absent(StoreKey::FirstTouchSource, "facebook"));
        assert_eq!(store.get(StoreKey::FirstTouchSource).as_deref(), Some("google"));
    }

    #[test]
    fn test_empty_value_reads_as_absent() {
        let store = AttributionStore::in_memory();
        store.set(StoreKey::UtmTerm, "");
        assert_eq!(store.get(StoreKey::UtmTerm), None);
        assert!(store.set_if_absent(StoreKey::UtmTerm, "film"));
    }

    #[test]
    fn test_clear_session_keeps_durable_tier() {
        let store = AttributionStore::in_memory();
        store.set(StoreKey::UtmSource, "facebook");
        store.set(StoreKey::LandingPage, "https://example.com/");
        store.set(StoreKey::FirstTouchSource, "google");
        store.set(StoreKey::GaClientId, "1.2");

        store.clear_session();

        assert_eq!(store.get(StoreKey::UtmSource), None);
        assert_eq!(store.get(StoreKey::LandingPage), None);
        assert_eq!(store.get(StoreKey::FirstTouchSource).as_deref(), Some("google"));
        assert_eq!(store.get(StoreKey::GaClientId).as_deref(), Some("1.2"));

        store.clear_durable();
        assert_eq!(store.get(StoreKey::GaClientId), None);
    }

    #[test]
    fn test_unavailable_store_degrades_to_noops() {
        let store = AttributionStore::unavailable();
        assert!(!store.set(StoreKey::UtmSource, "google"));
        assert!(!store.set_if_absent(StoreKey::FirstTouchSource, "google"));
        assert_eq!(store.get(StoreKey::UtmSource), None);
        store.remove(StoreKey::UtmSource);
        store.clear_session();
        assert!(matches!(
            store.try_get(StoreKey::UtmSource),
            Err(AttributionError::StorageUnavailable(_))
        ));
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttributionStore::file_backed(dir.path());
        store.set(StoreKey::FirstTouchSource, "google");
        store.set(StoreKey::UtmSource, "facebook");

        let reopened = AttributionStore::file_backed(dir.path());
        assert_eq!(reopened.get(StoreKey::FirstTouchSource).as_deref(), Some("google"));
        assert_eq!(reopened.get(StoreKey::UtmSource).as_deref(), Some("facebook"));
        assert!(dir.path().join("session.json").exists());
        assert!(dir.path().join("durable.json").exists());
    }

    #[test]
    fn test_corrupt_file_is_reset_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("durable.json"), "{not json").unwrap();
        let store = AttributionStore::file_backed(dir.path());
        assert_eq!(store.get(StoreKey::FirstTouchSource), None);
        assert!(matches!(
            store.try_get(StoreKey::FirstTouchSource),
            Err(AttributionError::StorageUnavailable(_))
        ));

        assert!(store.set_if_absent(StoreKey::FirstTouchSource, "google"));
        assert_eq!(store.get(StoreKey::FirstTouchSource).as_deref(), Some("google"));
        assert!(store.set(StoreKey::GaClientId, "1.2"));
        assert!(store.set(StoreKey::UtmSource, "google"));
    }

    #[test]
    fn test_save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttributionStore::file_backed(dir.path());
        for source in ["google", "facebook", "tiktok"] {
            store.set(StoreKey::UtmSource, source);
        }
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["session.json".to_string()]);
        let content = std::fs::read_to_string(dir.path().join("session.json")).unwrap();
        let entries: BTreeMap<String, String> = serde_json::from_str(&content).unwrap();
        assert_eq!(entries["utm_source"], "tiktok");
    }

    #[test]
    fn test_concurrent_set_if_absent_has_one_winner() {
        use std::sync::Barrier;
        use std::thread;

        const WRITERS: usize = 4;
        let dir = tempfile::tempdir().unwrap();
        let store = AttributionStore::file_backed(dir.path());

        for round in 0..200 {
            store.clear_durable();
            let barrier = Arc::new(Barrier::new(WRITERS));
            let handles: Vec<_> = (0..WRITERS)
                .map(|writer| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        store.set_if_absent(StoreKey::FirstTouchSource, &format!("writer-{}", writer))
                    })
                })
                .collect();
            let winners: Vec<usize> = handles
                .into_iter()
                .enumerate()
                .filter_map(|(writer, h)| h.join().unwrap().then_some(writer))
                .collect();

            assert_eq!(winners.len(), 1, "round {}: winners {:?}", round, winners);
            assert_eq!(
                store.get(StoreKey::FirstTouchSource),
                Some(format!("writer-{}", winners[0])),
                "round {}",
                round
            );
        }
    }

    #[test]
    fn test_memory_backend_set_if_absent_treats_empty_as_absent() {
        let backend = MemoryBackend::default();
        assert!(backend.set_if_absent("k", "").unwrap());
        assert!(backend.set_if_absent("k", "first").unwrap());
        assert!(!backend.set_if_absent("k", "second").unwrap());
        assert_eq!(backend.get("k").unwrap().as_deref(), Some("first"));
    }
}
