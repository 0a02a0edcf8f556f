// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Task routing: picks a model for each request based on capability match,
//! context capacity, health, load, and cost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use vane_model::model_registry::{ModelConfig, ModelHealth, ModelRegistry};
use vane_model::TaskKind;

/// A statically configured preference for one model serving one task kind.
#[derive(Debug, Clone)]
pub struct ModelPreference {
    pub model_id: String,
    /// Lower sorts first when preferences are listed for a task; informational
    /// only — routing always re-scores candidates at request time.
    pub priority: u32,
    /// Multiplies a candidate's clamped score when it appears in the task's
    /// routing table. Candidates reached only through `ModelRegistry::list_by_task`
    /// (i.e. absent from the table) use a weight of `1.0`.
    pub weight: f32,
}

/// Request-time routing parameters: everything the scorer needs besides the
/// registered model configs themselves.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub task: TaskKind,
    pub estimated_tokens: u32,
    pub priority: vane_model::TaskPriority,
    pub max_cost: Option<f32>,
    pub requires_streaming: bool,
    pub preferred_model: Option<String>,
}

impl RouteRequest {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            estimated_tokens: 0,
            priority: vane_model::TaskPriority::Normal,
            max_cost: None,
            requires_streaming: false,
            preferred_model: None,
        }
    }
}

/// The outcome of one routing decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model_id: String,
    pub model_config: Option<ModelConfig>,
    pub confidence: f32,
    pub reason: String,
}

impl RoutingDecision {
    pub fn is_valid(&self) -> bool {
        !self.model_id.is_empty() && self.confidence > 0.0
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self { model_id: String::new(), model_config: None, confidence: 0.0, reason: reason.into() }
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    timestamp_ms: u128,
    task: TaskKind,
    model_id: String,
    confidence: f32,
    reason: String,
}

/// A past routing decision, as returned by [`TaskRouter::routing_history`].
#[derive(Debug, Clone)]
pub struct RoutingHistoryEntry {
    pub timestamp_ms: u128,
    pub task: TaskKind,
    pub model_id: String,
    pub confidence: f32,
    pub reason: String,
}

fn current_millis() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0)
}

const MAX_HISTORY: usize = 1000;

/// Maps `(task, tokens, priority, constraints)` to a model selection.
pub struct TaskRouter {
    registry: Arc<ModelRegistry>,
    routing_table: HashMap<TaskKind, Vec<ModelPreference>>,
    default_model_per_task: HashMap<TaskKind, String>,
    fallback_model: String,
    history: Mutex<VecDeque<HistoryEntry>>,
    selection_counts: Mutex<HashMap<String, u64>>,
}

impl TaskRouter {
    pub fn new(registry: Arc<ModelRegistry>, fallback_model: impl Into<String>) -> Self {
        Self {
            registry,
            routing_table: HashMap::new(),
            default_model_per_task: HashMap::new(),
            fallback_model: fallback_model.into(),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            selection_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_default_model(&mut self, task: TaskKind, model_id: impl Into<String>) {
        self.default_model_per_task.insert(task, model_id.into());
    }

    pub fn set_preferences(&mut self, task: TaskKind, prefs: Vec<ModelPreference>) {
        self.routing_table.insert(task, prefs);
    }

    fn weight_for(&self, task: TaskKind, model_id: &str) -> f32 {
        self.routing_table
            .get(&task)
            .and_then(|prefs| prefs.iter().find(|p| p.model_id == model_id))
            .map(|p| p.weight)
            .unwrap_or(1.0)
    }

    /// Pick a model for `req`. Never panics; always returns a decision (which
    /// may be invalid if nothing can serve the request).
    pub fn route(&self, req: &RouteRequest) -> RoutingDecision {
        let decision = self.route_inner(req);
        self.record(req.task, &decision);
        decision
    }

    fn route_inner(&self, req: &RouteRequest) -> RoutingDecision {
        let candidates = self.registry.list_by_task(req.task);
        if candidates.is_empty() {
            return self.fallback_decision("no models registered support this task");
        }

        let filtered: Vec<ModelConfig> = candidates
            .into_iter()
            .filter(|m| req.estimated_tokens == 0 || m.max_context_tokens >= req.estimated_tokens)
            .filter(|m| !req.requires_streaming || m.supports_streaming)
            .filter(|m| self.registry.health(&m.model_id) != Some(ModelHealth::Unhealthy))
            .collect();

        if filtered.is_empty() {
            return self.fallback_decision("after filtering: no candidate meets capacity/streaming/health constraints");
        }

        let mut scored: Vec<(ModelConfig, f32)> =
            filtered.into_iter().map(|m| { let s = self.score(&m, req); (m, s) }).collect();

        if let Some(max_cost) = req.max_cost {
            let all_over_budget = scored.iter().all(|(m, _)| m.cost_per_1k_tokens > max_cost);
            if all_over_budget {
                scored.sort_by(|(a, _), (b, _)| a.cost_per_1k_tokens.partial_cmp(&b.cost_per_1k_tokens).unwrap_or(std::cmp::Ordering::Equal));
                let (cheapest, score) = scored.into_iter().next().expect("non-empty");
                return self.decision_from(cheapest, score, "all candidates exceed max_cost; picked the cheapest");
            }
            scored.retain(|(m, _)| m.cost_per_1k_tokens <= max_cost);
        }

        if scored.is_empty() {
            return self.fallback_decision("after filtering: no candidate within max_cost");
        }

        for (model, score) in scored.iter_mut() {
            *score *= self.weight_for(req.task, &model.model_id);
            if req.preferred_model.as_deref() == Some(model.model_id.as_str()) {
                *score += 0.15;
            }
        }

        scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let (best, score) = scored.into_iter().next().expect("non-empty");
        self.decision_from(best, score, "highest-scoring candidate")
    }

    fn score(&self, model: &ModelConfig, req: &RouteRequest) -> f32 {
        if !model.supports_task(req.task) {
            return 0.0;
        }
        let mut s = 0.4;

        s += if req.estimated_tokens == 0 || model.max_context_tokens >= req.estimated_tokens {
            0.2
        } else {
            0.2 * (model.max_context_tokens as f32 / req.estimated_tokens as f32)
        };

        s += 0.2 * model.performance_score;

        let cost = model.cost_per_1k_tokens;
        s += match req.priority {
            vane_model::TaskPriority::Low => {
                if cost <= 0.1 {
                    0.3
                } else if cost <= 0.2 {
                    0.1
                } else {
                    0.0
                }
            }
            vane_model::TaskPriority::Critical => 0.1,
            _ => 0.05 * (1.0 - cost.clamp(0.0, 1.0)),
        };

        let load_factor = self.registry.stats(&model.model_id).map(|s| s.load_factor as f32).unwrap_or(0.0);
        s += 0.1 * (1.0 - load_factor);

        let health_multiplier = match self.registry.health(&model.model_id) {
            Some(ModelHealth::Healthy) => 1.1,
            Some(ModelHealth::Degraded) => 0.8,
            Some(ModelHealth::Unhealthy) => 0.1,
            Some(ModelHealth::Unknown) | None => 1.0,
        };
        s *= health_multiplier;

        s.clamp(0.0, 1.0)
    }

    fn fallback_decision(&self, reason: &str) -> RoutingDecision {
        match self.registry.get(&self.fallback_model) {
            Some(cfg) => RoutingDecision {
                model_id: cfg.model_id.clone(),
                model_config: Some(cfg),
                confidence: 0.3,
                reason: reason.to_string(),
            },
            None => RoutingDecision::invalid(format!("{reason}; no fallback model configured")),
        }
    }

    fn decision_from(&self, model: ModelConfig, score: f32, reason: &str) -> RoutingDecision {
        RoutingDecision { model_id: model.model_id.clone(), model_config: Some(model), confidence: score, reason: reason.to_string() }
    }

    fn record(&self, task: TaskKind, decision: &RoutingDecision) {
        if !decision.is_valid() {
            return;
        }
        let mut history = self.history.lock().unwrap();
        if history.len() >= MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            timestamp_ms: current_millis(),
            task,
            model_id: decision.model_id.clone(),
            confidence: decision.confidence,
            reason: decision.reason.clone(),
        });
        drop(history);
        *self.selection_counts.lock().unwrap().entry(decision.model_id.clone()).or_insert(0) += 1;
    }

    pub fn selection_count(&self, model_id: &str) -> u64 {
        self.selection_counts.lock().unwrap().get(model_id).copied().unwrap_or(0)
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    /// The most recent `max` routing decisions, oldest first.
    pub fn routing_history(&self, max: usize) -> Vec<RoutingHistoryEntry> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(max);
        history
            .iter()
            .skip(skip)
            .map(|e| RoutingHistoryEntry {
                timestamp_ms: e.timestamp_ms,
                task: e.task,
                model_id: e.model_id.clone(),
                confidence: e.confidence,
                reason: e.reason.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vane_model::TaskPriority;

    fn model(id: &str, task: TaskKind, perf: f32, cost: f32, max_ctx: u32, max_concurrent: u32) -> ModelConfig {
        ModelConfig {
            model_id: id.to_string(),
            display_name: id.to_string(),
            supported_tasks: vec![task],
            max_context_tokens: max_ctx,
            default_temperature: 0.7,
            default_max_tokens: 2048,
            cost_per_1k_tokens: cost,
            max_concurrent_requests: max_concurrent,
            supports_streaming: true,
            performance_score: perf,
            prompt_style: None,
            api_provider: None,
            notes: None,
        }
    }

    #[test]
    fn routes_to_best_scoring_healthy_candidate() {
        let registry = ModelRegistry::new();
        registry.register(model("fast", TaskKind::CasualChat, 0.9, 0.01, 8_000, 10), false);
        registry.register(model("slow", TaskKind::CasualChat, 0.3, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "fast");
        let decision = router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert!(decision.is_valid());
        assert_eq!(decision.model_id, "fast");
    }

    #[test]
    fn empty_candidates_falls_back() {
        let registry = ModelRegistry::new();
        registry.register(model("fallback", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "fallback");
        let decision = router.route(&RouteRequest::new(TaskKind::CodeGeneration));
        assert!(decision.is_valid());
        assert_eq!(decision.model_id, "fallback");
        assert_eq!(decision.confidence, 0.3);
    }

    #[test]
    fn no_candidates_and_no_fallback_is_invalid() {
        let registry = ModelRegistry::new();
        let router = TaskRouter::new(registry, "nonexistent");
        let decision = router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert!(!decision.is_valid());
    }

    #[test]
    fn capacity_filter_excludes_undersized_models() {
        let registry = ModelRegistry::new();
        registry.register(model("small", TaskKind::CasualChat, 0.9, 0.01, 1_000, 10), false);
        registry.register(model("big", TaskKind::CasualChat, 0.1, 0.01, 100_000, 10), false);
        let router = TaskRouter::new(registry, "big");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.estimated_tokens = 50_000;
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "big");
    }

    #[test]
    fn streaming_filter_excludes_non_streaming_models() {
        let registry = ModelRegistry::new();
        let mut no_stream = model("batch", TaskKind::CasualChat, 0.95, 0.01, 8_000, 10);
        no_stream.supports_streaming = false;
        registry.register(no_stream, false);
        registry.register(model("stream", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "stream");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.requires_streaming = true;
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "stream");
    }

    #[test]
    fn unhealthy_candidate_is_filtered_out() {
        let registry = ModelRegistry::new();
        registry.register(model("bad", TaskKind::CasualChat, 0.99, 0.01, 8_000, 10), false);
        registry.register(model("ok", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        for _ in 0..5 {
            registry.update_health("bad", false, 100);
        }
        let router = TaskRouter::new(registry, "ok");
        let decision = router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert_eq!(decision.model_id, "ok");
    }

    #[test]
    fn overload_prefers_idle_lower_performing_model() {
        let registry = ModelRegistry::new();
        registry.register(model("saturated", TaskKind::CasualChat, 0.9, 0.01, 8_000, 10), false);
        registry.register(model("idle", TaskKind::CasualChat, 0.7, 0.01, 8_000, 10), false);
        for _ in 0..8 {
            registry.increment_concurrency("saturated");
        }
        let router = TaskRouter::new(registry, "idle");
        let decision = router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert_eq!(decision.model_id, "idle");
    }

    #[test]
    fn max_cost_drops_over_budget_models_unconditionally() {
        let registry = ModelRegistry::new();
        registry.register(model("expensive", TaskKind::CasualChat, 0.95, 0.2, 8_000, 10), false);
        registry.register(model("cheap", TaskKind::CasualChat, 0.5, 0.1, 8_000, 10), false);
        let router = TaskRouter::new(registry, "cheap");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.max_cost = Some(0.05);
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "cheap");
    }

    #[test]
    fn max_cost_picks_cheapest_when_all_over_budget() {
        let registry = ModelRegistry::new();
        registry.register(model("a", TaskKind::CasualChat, 0.9, 0.5, 8_000, 10), false);
        registry.register(model("b", TaskKind::CasualChat, 0.5, 0.3, 8_000, 10), false);
        let router = TaskRouter::new(registry, "b");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.max_cost = Some(0.05);
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "b");
    }

    #[test]
    fn preferred_model_bonus_breaks_a_near_tie() {
        let registry = ModelRegistry::new();
        registry.register(model("a", TaskKind::CasualChat, 0.60, 0.01, 8_000, 10), false);
        registry.register(model("b", TaskKind::CasualChat, 0.62, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "a");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.preferred_model = Some("a".to_string());
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "a");
    }

    #[test]
    fn preferred_model_cannot_resurrect_a_filtered_candidate() {
        let registry = ModelRegistry::new();
        registry.register(model("unhealthy", TaskKind::CasualChat, 0.99, 0.01, 8_000, 10), false);
        registry.register(model("healthy", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        for _ in 0..5 {
            registry.update_health("unhealthy", false, 100);
        }
        let router = TaskRouter::new(registry, "healthy");
        let mut req = RouteRequest::new(TaskKind::CasualChat);
        req.preferred_model = Some("unhealthy".to_string());
        let decision = router.route(&req);
        assert_eq!(decision.model_id, "healthy");
    }

    #[test]
    fn routing_table_weight_multiplies_score() {
        let registry = ModelRegistry::new();
        registry.register(model("a", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        registry.register(model("b", TaskKind::CasualChat, 0.52, 0.01, 8_000, 10), false);
        let mut router = TaskRouter::new(registry, "a");
        router.set_preferences(
            TaskKind::CasualChat,
            vec![ModelPreference { model_id: "a".into(), priority: 0, weight: 2.0 }],
        );
        let decision = router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert_eq!(decision.model_id, "a");
    }

    #[test]
    fn selection_counts_and_history_track_valid_decisions() {
        let registry = ModelRegistry::new();
        registry.register(model("only", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "only");
        router.route(&RouteRequest::new(TaskKind::CasualChat));
        router.route(&RouteRequest::new(TaskKind::CasualChat));
        assert_eq!(router.selection_count("only"), 2);
        assert_eq!(router.history_len(), 2);
    }

    #[test]
    fn routing_history_returns_recent_entries_with_task_and_reason() {
        let registry = ModelRegistry::new();
        registry.register(model("only", TaskKind::CasualChat, 0.5, 0.01, 8_000, 10), false);
        let router = TaskRouter::new(registry, "only");
        router.route(&RouteRequest::new(TaskKind::CasualChat));
        router.route(&RouteRequest::new(TaskKind::CodeGeneration));

        let recent = router.routing_history(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].task, TaskKind::CodeGeneration);
        assert_eq!(recent[0].model_id, "only");
        assert!(recent[0].timestamp_ms > 0);
        assert!(!recent[0].reason.is_empty());

        let all = router.routing_history(10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].task, TaskKind::CasualChat);
    }

    #[test]
    fn task_priority_ordering_still_holds() {
        assert!(TaskPriority::Critical < TaskPriority::Low);
    }
}
