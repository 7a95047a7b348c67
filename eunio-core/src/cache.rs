use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

use crate::models::UserSettings;

struct CacheEntry {
    snapshot: watch::Receiver<Option<UserSettings>>,
    access_count: u64,
}

/// Bounded cache of live settings snapshots.
///
/// Entries hold the repository's change receiver rather than a copy, so a
/// cached value is never older than the last local write. When full, the
/// least-accessed entry is evicted.
pub struct SettingsCache {
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SettingsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Latest snapshot for the user. An entry whose entity was deleted is
    /// dropped and reported as a miss.
    pub fn get(&self, user_id: &str) -> Option<UserSettings> {
        let mut entries = self.entries();
        let entry = entries.get_mut(user_id)?;

        let current = entry.snapshot.borrow().clone();
        match current {
            Some(settings) => {
                entry.access_count += 1;
                Some(settings)
            }
            None => {
                entries.remove(user_id);
                None
            }
        }
    }

    pub fn insert(&self, user_id: &str, snapshot: watch::Receiver<Option<UserSettings>>) {
        let mut entries = self.entries();

        if !entries.contains_key(user_id) && entries.len() >= self.capacity {
            let coldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(key, _)| key.clone());
            if let Some(key) = coldest {
                entries.remove(&key);
            }
        }

        entries.insert(
            user_id.to_string(),
            CacheEntry {
                snapshot,
                access_count: 0,
            },
        );
    }

    pub fn invalidate(&self, user_id: &str) {
        self.entries().remove(user_id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
