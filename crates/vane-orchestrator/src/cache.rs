// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory response cache keyed by a deterministic fingerprint of the
//! request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use vane_model::{ChatRequest, ChatResponse};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// The cleanup worker is a cooperative sleeper that only ever waits this
/// long between checks, so `stop()` never blocks more than a tick.
const CLEANUP_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: ChatResponse,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
    pub expires_at: SystemTime,
    pub access_count: u64,
    pub approx_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub approx_bytes: usize,
    pub evicted: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Fields that determine whether two requests are cache-equivalent.
#[derive(Serialize)]
struct FingerprintFields<'a> {
    model: &'a str,
    messages: &'a [vane_model::ChatMessage],
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    stop: &'a Option<Vec<String>>,
    tools: &'a [vane_model::Tool],
    tool_choice: &'a Option<vane_model::ToolChoice>,
}

pub fn generate_key(request: &ChatRequest) -> String {
    let fields = FingerprintFields {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
        top_k: request.top_k,
        stop: &request.stop,
        tools: &request.tools,
        tool_choice: &request.tool_choice,
    };
    let bytes = serde_json::to_vec(&fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Shared-memory `CacheKey -> CacheEntry` store with TTL and LRU eviction.
pub struct ResponseCache {
    enabled: bool,
    default_ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    stats: Mutex<CacheStats>,
}

impl ResponseCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            default_ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn with_limits(enabled: bool, default_ttl: Duration, max_entries: usize) -> Self {
        Self { enabled, default_ttl, max_entries, entries: RwLock::new(HashMap::new()), stats: Mutex::new(CacheStats::default()) }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }
        let now = SystemTime::now();
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed_at = now;
                entry.access_count += 1;
                let response = entry.response.clone();
                drop(entries);
                self.stats.lock().unwrap().hits += 1;
                trace!(key, "cache hit");
                Some(response)
            }
            Some(_) => {
                entries.remove(key);
                drop(entries);
                let mut stats = self.stats.lock().unwrap();
                stats.misses += 1;
                stats.entries = stats.entries.saturating_sub(1);
                trace!(key, "cache entry expired");
                None
            }
            None => {
                drop(entries);
                self.stats.lock().unwrap().misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: String, response: ChatResponse, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let now = SystemTime::now();
        let approx_bytes = serde_json::to_vec(&response).map(|b| b.len()).unwrap_or(0);
        let entry = CacheEntry {
            response,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            access_count: 0,
            approx_bytes,
        };

        let mut entries = self.entries.write().unwrap();
        let is_new = !entries.contains_key(&key);
        if is_new && entries.len() >= self.max_entries {
            drop(entries);
            self.evict_expired();
            entries = self.entries.write().unwrap();
            if entries.len() >= self.max_entries {
                let overflow = entries.len() - self.max_entries + 1;
                drop(entries);
                self.evict_lru(overflow);
                entries = self.entries.write().unwrap();
            }
        }
        entries.insert(key, entry);
        let len = entries.len();
        drop(entries);
        let mut stats = self.stats.lock().unwrap();
        stats.entries = len;
        stats.approx_bytes = self.entries.read().unwrap().values().map(|e| e.approx_bytes).sum();
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        let mut stats = self.stats.lock().unwrap();
        stats.entries = 0;
        stats.approx_bytes = 0;
        stats.hits = 0;
        stats.misses = 0;
    }

    pub fn evict_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let evicted = before - entries.len();
        let len = entries.len();
        let approx_bytes = entries.values().map(|e| e.approx_bytes).sum();
        drop(entries);
        if evicted > 0 {
            debug!(evicted, "evicted expired cache entries");
            let mut stats = self.stats.lock().unwrap();
            stats.evicted += evicted as u64;
            stats.entries = len;
            stats.approx_bytes = approx_bytes;
        }
        evicted
    }

    pub fn evict_lru(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut entries = self.entries.write().unwrap();
        let mut by_access: Vec<(String, SystemTime)> =
            entries.iter().map(|(k, v)| (k.clone(), v.last_accessed_at)).collect();
        by_access.sort_by_key(|(_, t)| *t);
        let evicted = by_access.into_iter().take(n).map(|(k, _)| k).filter(|k| entries.remove(k).is_some()).count();
        let len = entries.len();
        let approx_bytes = entries.values().map(|e| e.approx_bytes).sum();
        drop(entries);
        if evicted > 0 {
            let mut stats = self.stats.lock().unwrap();
            stats.evicted += evicted as u64;
            stats.entries = len;
            stats.approx_bytes = approx_bytes;
        }
        evicted
    }

    pub fn get_statistics(&self) -> CacheStats {
        *self.stats.lock().unwrap()
    }

    pub fn get_hit_rate(&self) -> f64 {
        self.stats.lock().unwrap().hit_rate()
    }

    pub fn get_cache_size(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Launches the background cleanup worker: a single-threaded cooperative
    /// sleeper that wakes every second, and calls [`ResponseCache::evict_expired`]
    /// once `cleanup_interval` has elapsed, so `stop()` always completes within
    /// one tick instead of however long the configured interval is.
    pub fn spawn_cleanup(self: &Arc<Self>, cleanup_interval: Duration) -> CleanupHandle {
        let cache = self.clone();
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();
        let cleanup_interval = if cleanup_interval.is_zero() { DEFAULT_CLEANUP_INTERVAL } else { cleanup_interval };

        let task = tokio::spawn(async move {
            let mut since_last_cleanup = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_TICK) => {
                        since_last_cleanup += CLEANUP_TICK;
                        if since_last_cleanup >= cleanup_interval {
                            cache.evict_expired();
                            since_last_cleanup = Duration::ZERO;
                        }
                    }
                    _ = shutdown_for_task.notified() => {
                        cache.evict_expired();
                        return;
                    }
                }
            }
        });

        CleanupHandle { shutdown, task: Some(task) }
    }
}

/// Handle to the background cache-cleanup worker spawned by
/// [`ResponseCache::spawn_cleanup`]. Dropping it leaves the worker running;
/// call [`CleanupHandle::stop`] to wake it and join it.
pub struct CleanupHandle {
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    /// Signals shutdown and waits for the worker to exit. Per the scheduling
    /// model, this completes within one second.
    pub async fn stop(mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
