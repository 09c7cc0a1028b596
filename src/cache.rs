//! Type-tagged TTL cache for read-only upstream responses.
//!
//! Keys embed the response type and the repository they belong to, so a
//! mutation can purge exactly the entries it invalidates: creating a branch
//! drops the branch list, closing an issue drops that issue, and so on.

use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Response classes with their own TTL and invalidation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    BranchList,
    Branch,
    BranchProtection,
    IssueList,
    Issue,
    RepoInfo,
}

impl CacheType {
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::BranchList => Duration::from_secs(60),
            Self::Branch => Duration::from_secs(60),
            Self::BranchProtection => Duration::from_secs(300),
            Self::IssueList => Duration::from_secs(30),
            Self::Issue => Duration::from_secs(120),
            Self::RepoInfo => Duration::from_secs(600),
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::BranchList => "branch-list",
            Self::Branch => "branch",
            Self::BranchProtection => "branch-protection",
            Self::IssueList => "issue-list",
            Self::Issue => "issue",
            Self::RepoInfo => "repo-info",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    cache_type: CacheType,
    value: Value,
    inserted_at: u64,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.inserted_at) >= self.ttl.as_millis() as u64
    }
}

/// Process-wide response cache for one upstream service.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock: Arc::new(SystemClock) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Compose the canonical key: `{type}:{owner}/{repo}:{user-key}`.
    pub fn key_for(cache_type: CacheType, owner: &str, repo: &str, user_key: &str) -> String {
        format!("{}:{}/{}:{}", cache_type.tag(), owner, repo, user_key)
    }

    /// Look up `key`, honoring type tag and TTL. Expired entries are removed.
    pub fn get(&self, key: &str, cache_type: CacheType) -> Option<Value> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some(entry) if entry.cache_type == cache_type => {
                if entry.is_expired(now) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            _ => None,
        }
    }

    /// Insert `value` under `key` with the type's default TTL or an override.
    pub fn set(&self, key: &str, cache_type: CacheType, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            cache_type,
            value,
            inserted_at: self.clock.now_millis(),
            ttl: ttl.unwrap_or_else(|| cache_type.default_ttl()),
        };
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).insert(key.to_string(), entry);
    }

    /// Drop one entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(key).is_some()
    }

    /// Drop every entry of `cache_type` belonging to `owner/repo`.
    pub fn invalidate_type(&self, cache_type: CacheType, owner: &str, repo: &str) -> usize {
        let prefix = format!("{}:{}/{}:", cache_type.tag(), owner, repo);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|key, entry| {
            !(entry.cache_type == cache_type && key.starts_with(&prefix))
        });
        before - entries.len()
    }

    /// Drop every entry belonging to `owner/repo`, across all types.
    pub fn invalidate_repo(&self, owner: &str, repo: &str) -> usize {
        let marker = format!(":{}/{}:", owner, repo);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !key.contains(&marker));
        before - entries.len()
    }

    /// Number of live (possibly expired, not yet purged) entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all expired entries now; returns the count removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}
