//! In-process cache with TTL semantics, for tests and single-node runs

use super::Cache;
use async_trait::async_trait;
use mailsift_common::{Error, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
    SortedSet(HashMap<String, f64>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    published: Vec<(String, String)>,
    failing: bool,
}

impl State {
    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(Error::Cache("cache unavailable".to_string()));
        }
        Ok(())
    }

    /// Live entry for a key, dropping it first if expired
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn entry_or(&mut self, key: &str, value: Value) -> &mut Entry {
        self.live(key);
        self.entries.entry(key.to_string()).or_insert(Entry {
            value,
            expires_at: None,
        })
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Cache(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Cache kept in process memory
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<State>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following operation fail
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Add members to a set
    pub async fn set_add(&self, key: &str, members: &[&str]) {
        let mut state = self.state.lock().await;
        let entry = state.entry_or(key, Value::Set(BTreeSet::new()));
        if let Value::Set(set) = &mut entry.value {
            set.extend(members.iter().map(|m| m.to_string()));
        }
    }

    /// Set the score of a sorted set member
    pub async fn sorted_set_add(&self, key: &str, member: &str, score: f64) {
        let mut state = self.state.lock().await;
        let entry = state.entry_or(key, Value::SortedSet(HashMap::new()));
        if let Value::SortedSet(scores) = &mut entry.value {
            scores.insert(member.to_string(), score);
        }
    }

    /// Contents of a list, head first
    pub async fn list(&self, key: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        match state.live(key).map(|e| &e.value) {
            Some(Value::List(items)) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Members of a set
    pub async fn members(&self, key: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        match state.live(key).map(|e| &e.value) {
            Some(Value::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether a live key exists
    pub async fn exists(&self, key: &str) -> bool {
        self.state.lock().await.live(key).is_some()
    }

    /// Messages published so far, as (channel, message)
    pub async fn published(&self) -> Vec<(String, String)> {
        self.state.lock().await.published.clone()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        state.check()?;
        match state.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Counter(n)) => Ok(Some(*n)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.check()?;
        let created = state.live(key).is_none();
        let entry = state.entry_or(key, Value::Counter(0));
        if created {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_union(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        let mut union = BTreeSet::new();
        for key in keys {
            match state.live(key).map(|e| &e.value) {
                None => {}
                Some(Value::Set(set)) => union.extend(set.iter().cloned()),
                Some(_) => return Err(wrong_type(key)),
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        match &mut state.entry_or(key, Value::List(VecDeque::new())).value {
            Value::List(items) => {
                items.push_back(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        state
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut state = self.state.lock().await;
        state.check()?;
        match state.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::SortedSet(scores)) => Ok(scores.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        state.entries.remove(key);
        Ok(())
    }

    async fn set_add_and_push(
        &self,
        set_key: &str,
        member: &str,
        list_key: &str,
        value: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;

        // validate both before touching either
        let set_ok = matches!(
            state.live(set_key).map(|e| &e.value),
            None | Some(Value::Set(_))
        );
        let list_ok = matches!(
            state.live(list_key).map(|e| &e.value),
            None | Some(Value::List(_))
        );
        if !set_ok {
            return Err(wrong_type(set_key));
        }
        if !list_ok {
            return Err(wrong_type(list_key));
        }

        if let Value::Set(set) = &mut state.entry_or(set_key, Value::Set(BTreeSet::new())).value {
            set.insert(member.to_string());
        }
        if let Value::List(items) = &mut state
            .entry_or(list_key, Value::List(VecDeque::new()))
            .value
        {
            items.push_front(value.to_string());
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock().await;
        state.check()?;
        match state.live(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set_with_expiry(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check()?;
        let entry = state.entry_or(key, Value::Hash(HashMap::new()));
        match &mut entry.value {
            Value::Hash(hash) => {
                hash.extend(fields.iter().cloned());
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(1);

        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_millis(600)).await;
        // expiry is only set on creation
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get_counter("c").await.unwrap(), None);
        assert_eq!(cache.incr_with_expiry("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lists_and_sets() {
        let cache = MemoryCache::new();
        cache.set_add("s1", &["a", "b"]).await;
        cache.set_add("s2", &["b", "c"]).await;
        let union = cache
            .set_union(&["s1".to_string(), "s2".to_string(), "none".to_string()])
            .await
            .unwrap();
        assert_eq!(union, vec!["a", "b", "c"]);

        cache.list_push("l", "1").await.unwrap();
        cache.list_push("l", "2").await.unwrap();
        cache.set_add_and_push("q", "mail", "l", "0").await.unwrap();
        assert_eq!(cache.list("l").await, vec!["0", "1", "2"]);
        assert_eq!(cache.members("q").await, vec!["mail"]);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let cache = MemoryCache::new();
        cache.list_push("l", "1").await.unwrap();
        assert!(cache.get_counter("l").await.is_err());
        assert!(cache.set_add_and_push("l", "x", "other", "y").await.is_err());
        assert!(!cache.exists("other").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_expiry() {
        let cache = MemoryCache::new();
        let fields = vec![("max_messages".to_string(), "5".to_string())];
        cache
            .hash_set_with_expiry("h", &fields, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.hash_get_all("h").await.unwrap().len(), 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_cache() {
        let cache = MemoryCache::new();
        cache.set_failing(true).await;
        assert!(cache.get_counter("c").await.is_err());
        assert!(cache.publish("ch", "m").await.is_err());
    }
}
