//! Per-model failover cooldowns.
//!
//! A process-wide map of model id → typed cooldown, persisted to
//! `data/cooldowns.json` so a host restart does not stampede a model that
//! was failing moments earlier. Entries past their `until_ms` are simply
//! ignored. Persistence is fire-and-forget behind a short debounce.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use dotclaw_platform::fs::{read_json_opt, write_json_atomic};
use dotclaw_types::ErrorCategory;
use dotclaw_types::routing::{CooldownEntry, CooldownMap};

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);

/// Process-wide cooldown registry.
pub struct CooldownRegistry {
    path: PathBuf,
    entries: Mutex<HashMap<String, CooldownEntry>>,
    persist_pending: AtomicBool,
    me: Weak<Self>,
}

impl CooldownRegistry {
    /// Load persisted cooldowns; missing or unreadable files start empty.
    pub async fn load(path: PathBuf) -> Arc<Self> {
        let entries = match read_json_opt::<CooldownMap>(&path).await {
            Ok(Some(map)) => map.entries,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "unreadable cooldown file, starting empty");
                HashMap::new()
            }
        };
        Self::with_entries(path, entries)
    }

    /// Registry that persists into `path` without loading (tests).
    pub fn empty(path: PathBuf) -> Arc<Self> {
        Self::with_entries(path, HashMap::new())
    }

    fn with_entries(path: PathBuf, entries: HashMap<String, CooldownEntry>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            path,
            entries: Mutex::new(entries),
            persist_pending: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Put `model` into cooldown for its category's duration.
    pub fn register_failure(&self, model: &str, category: ErrorCategory, now_ms: i64) {
        let until_ms = now_ms + category.cooldown_ms();
        debug!(model, %category, until_ms, "model cooldown");
        self.entries.lock().insert(
            model.to_string(),
            CooldownEntry {
                until_ms,
                reason: category,
            },
        );
        self.persist_soon();
    }

    /// Whether `model` is excluded from selection at `now_ms`.
    ///
    /// Expired entries do not exclude (and are dropped lazily).
    pub fn is_in_cooldown(&self, model: &str, now_ms: i64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(model) {
            Some(entry) if entry.until_ms > now_ms => true,
            Some(_) => {
                entries.remove(model);
                false
            }
            None => false,
        }
    }

    /// Active entries at `now_ms`.
    pub fn snapshot(&self, now_ms: i64) -> CooldownMap {
        let entries = self.entries.lock();
        CooldownMap {
            entries: entries
                .iter()
                .filter(|(_, e)| e.until_ms > now_ms)
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Schedule a debounced persist; concurrent calls coalesce.
    fn persist_soon(&self) {
        if self.persist_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            registry.persist_pending.store(false, Ordering::Release);
            let map = CooldownMap {
                entries: registry.entries.lock().clone(),
            };
            if let Err(e) = write_json_atomic(&registry.path, &map).await {
                warn!(error = %e, "failed to persist cooldowns");
            }
        });
    }

    /// Persist immediately (shutdown path).
    pub async fn flush(&self) {
        let map = CooldownMap {
            entries: self.entries.lock().clone(),
        };
        if let Err(e) = write_json_atomic(&self.path, &map).await {
            warn!(error = %e, "failed to flush cooldowns");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_do_not_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let reg = CooldownRegistry::empty(dir.path().join("cooldowns.json"));

        // rate_limit cooldown registered at t=1000 lasts 60s.
        reg.register_failure("model-b", ErrorCategory::RateLimit, 1000);
        assert!(reg.is_in_cooldown("model-b", 1001));
        assert!(reg.is_in_cooldown("model-b", 60_999));
        assert!(!reg.is_in_cooldown("model-b", 62_050));
        // Lazy pruning removed the entry.
        assert!(reg.snapshot(62_050).entries.is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_selectable() {
        let dir = tempfile::tempdir().unwrap();
        let reg = CooldownRegistry::empty(dir.path().join("c.json"));
        assert!(!reg.is_in_cooldown("anything", 0));
    }

    #[tokio::test]
    async fn survives_restart_via_flush_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let reg = CooldownRegistry::empty(path.clone());
        reg.register_failure("model-a", ErrorCategory::Auth, 1000);
        reg.flush().await;

        let reloaded = CooldownRegistry::load(path).await;
        assert!(reloaded.is_in_cooldown("model-a", 2000));
        let snap = reloaded.snapshot(2000);
        assert_eq!(snap.entries["model-a"].reason, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn debounced_persist_writes_eventually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let reg = CooldownRegistry::empty(path.clone());
        reg.register_failure("m1", ErrorCategory::Transient, 1000);
        reg.register_failure("m2", ErrorCategory::Timeout, 1000);

        tokio::time::sleep(PERSIST_DEBOUNCE + Duration::from_millis(200)).await;
        let map: CooldownMap = read_json_opt(&path).await.unwrap().unwrap();
        assert_eq!(map.entries.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let reg = CooldownRegistry::load(path).await;
        assert!(!reg.is_in_cooldown("m", 0));
    }
}
