use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::KeyValueStore;
use crate::errors::StoreError;

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    sorted: HashMap<String, Vec<Member>>,
    seq: u64,
}

struct Member {
    name: String,
    score: f64,
    seq: u64,
}

/// In-process store. State is lost when the value is dropped.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.values.extend(entries);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.values.remove(key);
        inner.sorted.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let current = match inner.values.get(key) {
            Some(v) => v.parse::<i64>().map_err(|_| StoreError::WrongType {
                key: key.to_string(),
                expected: "an integer".to_string(),
            })?,
            None => 0,
        };
        let next = current + 1;
        inner.values.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        entries: Vec<(String, f64)>,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let set = inner.sorted.entry(key.to_string()).or_default();
        for (name, score) in entries {
            if let Some(existing) = set.iter_mut().find(|m| m.name == name) {
                existing.score = score;
            } else {
                inner.seq += 1;
                set.push(Member {
                    name,
                    score,
                    seq: inner.seq,
                });
            }
        }
        Ok(())
    }

    async fn sorted_set_top_n(
        &self,
        key: &str,
        n: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock()?;
        let Some(set) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<&Member> = set.iter().collect();
        members.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));
        Ok(members
            .into_iter()
            .take(n)
            .map(|m| (m.name.clone(), m.score))
            .collect())
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.sorted.get(key).map_or(0, Vec::len))
    }
}
