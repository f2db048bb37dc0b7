use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use super::{keys, SharedStore};

/// In-process shared store with the same semantics as the Redis backend.
///
/// Backs the test suites and makes it possible to exercise the coordinator
/// and worker loops end to end without a running Redis. Sorted-set iteration
/// is ascending by score with ties broken by member, matching Redis.
#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, String>,
    hashes: DashMap<String, HashMap<String, String>>,
    sets: DashMap<String, HashMap<String, ()>>,
    zsets: DashMap<String, Mutex<HashMap<String, f64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    // The key space only needs single-`*` patterns such as `worker:*:tasks`.
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            candidate.len() >= prefix.len() + suffix.len()
                && candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
        }
        None => pattern == candidate,
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let entry = self
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        entry.lock().unwrap().insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(String, f64)> = entry
            .lock()
            .unwrap()
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(false);
        };
        let removed = entry.lock().unwrap().remove(member).is_some();
        Ok(removed)
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(0);
        };
        let len = entry.lock().unwrap().len();
        Ok(len as u64)
    }

    async fn zset_trim_below(&self, key: &str, max_score: f64) -> Result<()> {
        if let Some(entry) = self.zsets.get(key) {
            entry.lock().unwrap().retain(|_, score| *score > max_score);
        }
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        if entry.contains_key(field) {
            return Ok(false);
        }
        entry.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|entry| entry.get(field).cloned()))
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.remove(field);
        }
        Ok(())
    }

    async fn hash_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        Ok(self.hashes.get(key).map(|entry| entry.len()).unwrap_or(0) as u64)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self
            .hashes
            .get(key)
            .map(|entry| entry.contains_key(field))
            .unwrap_or(false))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), ());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|entry| entry.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.strings.get(key).map(|value| value.value().clone()))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.strings.remove(key);
            self.hashes.remove(key);
            self.sets.remove(key);
            self.zsets.remove(key);
        }
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut matched = Vec::new();
        for entry in self.strings.iter() {
            if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        for entry in self.hashes.iter() {
            if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        for entry in self.sets.iter() {
            if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        for entry in self.zsets.iter() {
            if glob_match(pattern, entry.key()) {
                matched.push(entry.key().clone());
            }
        }
        Ok(matched)
    }

    async fn register_worker(&self, worker_id: &str, now_secs: i64) -> Result<()> {
        self.hash_set(keys::WORKERS, worker_id, &now_secs.to_string())
            .await?;
        self.delete(&[
            keys::worker_inbox(worker_id),
            keys::worker_processing(worker_id),
            keys::worker_outbox(worker_id),
        ])
        .await
    }
}
