use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{CoordinationError, CoordinationResult, CoordinationStore};

enum Stored {
    Text(String),
    List(Vec<String>),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store for single-node runs and tests. Expired keys are
/// dropped lazily when touched.
#[derive(Clone, Default)]
pub struct MemoryCoordinationStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CoordinationResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| CoordinationError::Poisoned)
    }
}

fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if entries
        .get(key)
        .is_some_and(|entry| entry.is_expired(Instant::now()))
    {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn container<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    empty: fn() -> Stored,
) -> &'a mut Entry {
    if entries
        .get(key)
        .is_some_and(|entry| entry.is_expired(Instant::now()))
    {
        entries.remove(key);
    }
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: empty(),
        expires_at: None,
    })
}

fn wrong_type(key: &str) -> CoordinationError {
    CoordinationError::WrongType(key.to_string())
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> CoordinationResult<Option<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Stored::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoordinationResult<()> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<bool> {
        let mut entries = self.lock()?;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CoordinationResult<i64> {
        let mut entries = self.lock()?;
        let entry = container(&mut entries, key, || Stored::Text("0".to_string()));
        match &mut entry.value {
            Stored::Text(text) => {
                let current: i64 = text
                    .parse()
                    .map_err(|_| CoordinationError::NotAnInteger(key.to_string()))?;
                let next = current + delta;
                *text = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoordinationResult<()> {
        let mut entries = self.lock()?;
        if let Some(entry) = live(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, values: &[String]) -> CoordinationResult<u64> {
        let mut entries = self.lock()?;
        let entry = container(&mut entries, key, || Stored::List(Vec::new()));
        match &mut entry.value {
            Stored::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len() as u64)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: usize,
        count: usize,
    ) -> CoordinationResult<Vec<String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Stored::List(list),
                ..
            }) => Ok(list.iter().skip(start).take(count).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_len(&self, key: &str) -> CoordinationResult<u64> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            None => Ok(0),
            Some(Entry {
                value: Stored::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> CoordinationResult<bool> {
        let mut entries = self.lock()?;
        let entry = container(&mut entries, key, || Stored::Set(HashSet::new()));
        match &mut entry.value {
            Stored::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> CoordinationResult<()> {
        let mut entries = self.lock()?;
        let entry = container(&mut entries, key, || Stored::Hash(HashMap::new()));
        match &mut entry.value {
            Stored::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> CoordinationResult<HashMap<String, String>> {
        let mut entries = self.lock()?;
        match live(&mut entries, key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Stored::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sweep_expired(&self) -> CoordinationResult<u64> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = (before - entries.len()) as u64;
        if removed > 0 {
            debug!("Swept {} expired coordination keys", removed);
        }
        Ok(removed)
    }
}
