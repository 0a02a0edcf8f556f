// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registered model configurations, rolling health, and per-model statistics.
//!
//! Tracks the live set of *configured model instances* an operator has
//! registered, plus the rolling health/statistics computed from observed
//! request outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::TaskKind;

/// A registered model instance and its static capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub display_name: String,
    pub supported_tasks: Vec<TaskKind>,
    pub max_context_tokens: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    #[serde(default)]
    pub cost_per_1k_tokens: f32,
    pub max_concurrent_requests: u32,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default = "default_performance_score")]
    pub performance_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_provider: Option<String>,
    /// Diagnostic-only notes, never consulted by routing logic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_performance_score() -> f32 {
    0.5
}

impl ModelConfig {
    pub fn supports_task(&self, task: TaskKind) -> bool {
        self.supported_tasks.contains(&task)
    }

    /// Validity per the data model invariant.
    pub fn is_valid(&self) -> bool {
        self.max_context_tokens > 0
            && (0.0..=2.0).contains(&self.default_temperature)
            && self.max_concurrent_requests > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Default)]
struct ModelStatsInner {
    requests: u64,
    successes: u64,
    failures: u64,
    response_time_sum_ms: u64,
    response_time_count: u64,
    min_response_time_ms: Option<u64>,
    max_response_time_ms: Option<u64>,
    concurrency: AtomicU32,
}

/// Snapshot of a model's rolling statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub response_time_count: u64,
    pub average_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    pub concurrency: u32,
    pub success_rate: f64,
    pub load_factor: f64,
}

struct Entry {
    config: ModelConfig,
    health: ModelHealth,
    stats: ModelStatsInner,
}

/// Thread-safe store of registered models, their health, and their rolling
/// statistics.
pub struct ModelRegistry {
    inner: RwLock<HashMap<String, Entry>>,
}

impl ModelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: RwLock::new(HashMap::new()) })
    }

    /// Register a model. Returns `false` (and leaves the existing entry
    /// untouched) if the id is already registered and `overwrite` is `false`.
    pub fn register(&self, config: ModelConfig, overwrite: bool) -> bool {
        let mut guard = self.inner.write().unwrap();
        if guard.contains_key(&config.model_id) && !overwrite {
            return false;
        }
        guard.insert(config.model_id.clone(), Entry { config, health: ModelHealth::Unknown, stats: ModelStatsInner::default() });
        true
    }

    pub fn unregister(&self, model_id: &str) -> bool {
        self.inner.write().unwrap().remove(model_id).is_some()
    }

    pub fn get(&self, model_id: &str) -> Option<ModelConfig> {
        self.inner.read().unwrap().get(model_id).map(|e| e.config.clone())
    }

    pub fn list_all(&self) -> Vec<ModelConfig> {
        self.inner.read().unwrap().values().map(|e| e.config.clone()).collect()
    }

    /// Models supporting `task`, sorted by descending `performance_score`.
    pub fn list_by_task(&self, task: TaskKind) -> Vec<ModelConfig> {
        let guard = self.inner.read().unwrap();
        let mut out: Vec<ModelConfig> = guard.values().filter(|e| e.config.supports_task(task)).map(|e| e.config.clone()).collect();
        out.sort_by(|a, b| b.performance_score.partial_cmp(&a.performance_score).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Models supporting `task` that are not `Unhealthy`, sorted by descending
    /// `performance_score`.
    pub fn best_for_task(&self, task: TaskKind) -> Vec<ModelConfig> {
        let guard = self.inner.read().unwrap();
        let mut out: Vec<ModelConfig> = guard
            .values()
            .filter(|e| e.config.supports_task(task) && e.health != ModelHealth::Unhealthy)
            .map(|e| e.config.clone())
            .collect();
        out.sort_by(|a, b| b.performance_score.partial_cmp(&a.performance_score).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    pub fn health(&self, model_id: &str) -> Option<ModelHealth> {
        self.inner.read().unwrap().get(model_id).map(|e| e.health)
    }

    pub fn stats(&self, model_id: &str) -> Option<ModelStats> {
        self.inner.read().unwrap().get(model_id).map(|e| snapshot_stats(&e.stats, &e.config))
    }

    pub fn record_request(&self, model_id: &str, success: bool) {
        let mut guard = self.inner.write().unwrap();
        if let Some(entry) = guard.get_mut(model_id) {
            entry.stats.requests += 1;
            if success {
                entry.stats.successes += 1;
            } else {
                entry.stats.failures += 1;
            }
        }
    }

    pub fn record_response_time(&self, model_id: &str, millis: u64) {
        let mut guard = self.inner.write().unwrap();
        if let Some(entry) = guard.get_mut(model_id) {
            entry.stats.response_time_sum_ms += millis;
            entry.stats.response_time_count += 1;
            entry.stats.min_response_time_ms = Some(entry.stats.min_response_time_ms.map_or(millis, |m| m.min(millis)));
            entry.stats.max_response_time_ms = Some(entry.stats.max_response_time_ms.map_or(millis, |m| m.max(millis)));
        }
    }

    pub fn increment_concurrency(&self, model_id: &str) {
        let guard = self.inner.read().unwrap();
        if let Some(entry) = guard.get(model_id) {
            entry.stats.concurrency.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn decrement_concurrency(&self, model_id: &str) {
        let guard = self.inner.read().unwrap();
        if let Some(entry) = guard.get(model_id) {
            let _ = entry.stats.concurrency.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
        }
    }

    /// Record a full observation and recompute health in one call.
    pub fn update_health(&self, model_id: &str, success: bool, response_time_ms: u64) {
        self.record_request(model_id, success);
        self.record_response_time(model_id, response_time_ms);
        let mut guard = self.inner.write().unwrap();
        if let Some(entry) = guard.get_mut(model_id) {
            entry.health = compute_health(&entry.stats);
        }
    }

    /// Reset statistics. Resets every model when `model_id` is `None`.
    pub fn reset_stats(&self, model_id: Option<&str>) {
        let mut guard = self.inner.write().unwrap();
        match model_id {
            Some(id) => {
                if let Some(entry) = guard.get_mut(id) {
                    entry.stats = ModelStatsInner::default();
                    entry.health = ModelHealth::Unknown;
                }
            }
            None => {
                for entry in guard.values_mut() {
                    entry.stats = ModelStatsInner::default();
                    entry.health = ModelHealth::Unknown;
                }
            }
        }
    }
}

fn compute_health(stats: &ModelStatsInner) -> ModelHealth {
    if stats.requests < 3 {
        return ModelHealth::Unknown;
    }
    let failure_rate = stats.failures as f64 / stats.requests as f64;
    let avg = if stats.response_time_count > 0 {
        stats.response_time_sum_ms as f64 / stats.response_time_count as f64
    } else {
        0.0
    };
    if failure_rate > 0.5 {
        return ModelHealth::Unhealthy;
    }
    if avg > 10_000.0 {
        return ModelHealth::Degraded;
    }
    if stats.failures > 3 && failure_rate > 0.2 {
        return ModelHealth::Degraded;
    }
    ModelHealth::Healthy
}

fn snapshot_stats(stats: &ModelStatsInner, config: &ModelConfig) -> ModelStats {
    let average_response_time_ms = if stats.response_time_count > 0 {
        stats.response_time_sum_ms as f64 / stats.response_time_count as f64
    } else {
        0.0
    };
    let success_rate = if stats.requests > 0 { stats.successes as f64 / stats.requests as f64 } else { 0.0 };
    let concurrency = stats.concurrency.load(Ordering::SeqCst);
    let load_factor = if config.max_concurrent_requests > 0 {
        concurrency as f64 / config.max_concurrent_requests as f64
    } else {
        0.0
    };
    ModelStats {
        requests: stats.requests,
        successes: stats.successes,
        failures: stats.failures,
        response_time_count: stats.response_time_count,
        average_response_time_ms,
        min_response_time_ms: stats.min_response_time_ms,
        max_response_time_ms: stats.max_response_time_ms,
        concurrency,
        success_rate,
        load_factor,
    }
}
