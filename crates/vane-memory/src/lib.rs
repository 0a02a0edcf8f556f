// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session conversation history and request-context assembly: system
//! prompts, optional context messages, history trimming, and token-budget
//! enforcement via importance-ranked retention.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use vane_model::{ChatMessage, ErrorKind, MessageRole, ServiceError, TaskKind, ToolChoice};

const CODE_MARKERS: &[&str] = &["class ", "function ", "def ", "void ", "#include"];

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Typed memory entry fed into the `MemoryEvents` context message.
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    pub kind: String,
    pub text: String,
    pub importance: f32,
}

/// Inputs for [`ContextAssembler::build_context`]. Everything beyond `task`
/// and `user_text` is optional; absent fields are simply skipped.
#[derive(Debug, Clone, Default)]
pub struct BuildContextConfig {
    pub task: Option<TaskKind>,
    pub include_conversation_history: bool,
    pub max_history_messages: usize,
    pub max_tokens: usize,
    pub agent_state: Option<String>,
    pub memory_summary: Option<String>,
    pub project_root: Option<String>,
    pub project_structure_summary: Option<String>,
    pub relevant_files: Vec<String>,
    pub code_file_paths: Vec<String>,
    pub code_content: Option<String>,
    pub code_focus_area: Option<String>,
    pub memory_events: Vec<MemoryEvent>,
}

impl BuildContextConfig {
    pub fn new(task: TaskKind) -> Self {
        Self { task: Some(task), max_history_messages: 20, max_tokens: 8_000, ..Default::default() }
    }
}

/// Builds the `AgentState` context message: System role, formatted state plus
/// optional memory summary.
pub fn build_agent_state_message(state: &str, memory_summary: Option<&str>) -> ChatMessage {
    let mut text = format!("Agent state:\n{state}");
    if let Some(summary) = memory_summary {
        text.push_str("\n\nMemory summary:\n");
        text.push_str(summary);
    }
    ChatMessage::system(text)
}

/// Builds the `ProjectContext` context message: System role, root path plus
/// structure summary and relevant files.
pub fn build_project_context_message(root: &str, structure_summary: Option<&str>, relevant_files: &[String]) -> ChatMessage {
    let mut text = format!("Project root: {root}");
    if let Some(summary) = structure_summary {
        text.push_str("\nStructure:\n");
        text.push_str(summary);
    }
    if !relevant_files.is_empty() {
        text.push_str("\nRelevant files:\n");
        for file in relevant_files {
            text.push_str("- ");
            text.push_str(file);
            text.push('\n');
        }
    }
    ChatMessage::system(text)
}

/// Builds the `CodeContext` context message: User role, file paths plus
/// optional content and optional focus area.
pub fn build_code_context_message(file_paths: &[String], content: Option<&str>, focus_area: Option<&str>) -> ChatMessage {
    let mut text = String::from("Code context:\n");
    for path in file_paths {
        text.push_str("- ");
        text.push_str(path);
        text.push('\n');
    }
    if let Some(focus) = focus_area {
        text.push_str("\nFocus area: ");
        text.push_str(focus);
    }
    if let Some(content) = content {
        text.push_str("\n\n```\n");
        text.push_str(content);
        text.push_str("\n```");
    }
    ChatMessage::user(text)
}

/// Builds the `MemoryEvents` context message: System role, typed entries with
/// importance scores.
pub fn build_memory_events_message(events: &[MemoryEvent]) -> ChatMessage {
    let mut text = String::from("Relevant memory events:\n");
    for event in events {
        text.push_str(&format!("- [{:.2}] {}: {}\n", event.importance, event.kind, event.text));
    }
    ChatMessage::system(text)
}

/// A per-task, deterministic, never-empty system prompt.
pub fn build_system_prompt(task: TaskKind) -> String {
    match task {
        TaskKind::CasualChat => "You are a friendly conversational assistant. Keep replies natural and concise.".to_string(),
        TaskKind::CodeDiscussion => "You are a software engineering assistant discussing code design and tradeoffs.".to_string(),
        TaskKind::TechnicalQnA => "You answer technical questions precisely, citing relevant facts where useful.".to_string(),
        TaskKind::CodeGeneration => "You write correct, idiomatic code that compiles and matches the surrounding style.".to_string(),
        TaskKind::CodeAnalysis => "You analyze source code for structure, complexity, and potential issues.".to_string(),
        TaskKind::CodeReview => "You review code changes for correctness, clarity, and maintainability.".to_string(),
        TaskKind::CodeExplanation => "You explain code behavior clearly, step by step, for a reader unfamiliar with it.".to_string(),
        TaskKind::BugFix => "You diagnose and fix bugs, explaining the root cause before proposing a change.".to_string(),
        TaskKind::ProjectAnalysis => "You analyze project structure and dependencies to summarize architecture.".to_string(),
        TaskKind::ArchitectureDesign => "You propose and evaluate system architectures, weighing tradeoffs explicitly.".to_string(),
        TaskKind::Documentation => "You write clear, accurate documentation for the given subject.".to_string(),
        TaskKind::AgentDecision => "You decide the next action for an autonomous agent given its current state.".to_string(),
        TaskKind::AgentReasoning => "You reason step by step about an agent's plan before committing to an action.".to_string(),
        TaskKind::ContextUnderstanding => "You summarize and interpret the provided context accurately.".to_string(),
        TaskKind::SpeechRecognition => "You transcribe spoken audio content into accurate text.".to_string(),
        TaskKind::SpeechSynthesis => "You produce natural, well-punctuated text suitable for speech synthesis.".to_string(),
        TaskKind::VisionAnalysis => "You analyze image content and report what you observe factually.".to_string(),
        TaskKind::VisionDescription => "You describe image content in clear natural language.".to_string(),
        TaskKind::SceneUnderstanding => "You interpret a visual scene and describe its relevant elements and context.".to_string(),
        TaskKind::ProactiveResponse => "You proactively surface relevant information without being explicitly asked.".to_string(),
        TaskKind::ToolCalling => "You select and invoke the correct tool with well-formed arguments.".to_string(),
        TaskKind::CodeToolExecution => "You execute code-related tools and interpret their results correctly.".to_string(),
    }
}

fn importance(message: &ChatMessage, task: Option<TaskKind>, index: usize, total: usize) -> f32 {
    let mut score = match message.role {
        MessageRole::System => 0.5,
        MessageRole::User => 0.3,
        MessageRole::Assistant => 0.2,
        MessageRole::Tool => 0.1,
    };

    if message.role == MessageRole::System {
        score += 0.1;
    } else {
        let distance_from_end = (total.saturating_sub(1).saturating_sub(index)) as f32;
        let n = total.max(1) as f32;
        score += 0.3 * (1.0 - distance_from_end / n);
    }

    let text = message.content.as_text().unwrap_or_default();
    let is_code_related = task.map(|t| t.is_code_related()).unwrap_or(false);
    if is_code_related && CODE_MARKERS.iter().any(|marker| text.contains(marker)) {
        score += 0.2;
    } else if !is_code_related {
        score += 0.1;
    }

    if text.len() > 100 {
        score += 0.1;
    } else if text.len() > 50 {
        score += 0.05;
    }

    score.clamp(0.0, 1.0)
}

#[derive(Default)]
struct PerSessionHistory {
    sessions: RwLock<HashMap<String, Mutex<Vec<ChatMessage>>>>,
}

impl PerSessionHistory {
    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Vec<ChatMessage>) -> R) -> R {
        if let Some(lock) = self.sessions.read().unwrap().get(session_id) {
            return f(&mut lock.lock().unwrap());
        }
        let mut sessions = self.sessions.write().unwrap();
        let lock = sessions.entry(session_id.to_string()).or_insert_with(|| Mutex::new(Vec::new()));
        f(&mut lock.lock().unwrap())
    }
}

/// Per-session message history plus request-context assembly.
pub struct ContextAssembler {
    history: PerSessionHistory,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextAssembler {
    pub fn new() -> Self {
        Self { history: PerSessionHistory::default() }
    }

    pub fn add_message(&self, session_id: &str, message: ChatMessage) {
        self.history.with_session(session_id, |messages| messages.push(message));
    }

    pub fn get_history(&self, session_id: &str, max_messages: usize) -> Vec<ChatMessage> {
        self.history.with_session(session_id, |messages| {
            let start = messages.len().saturating_sub(max_messages);
            messages[start..].to_vec()
        })
    }

    pub fn get_history_by_range(&self, session_id: &str, start: usize, count: usize) -> Vec<ChatMessage> {
        self.history.with_session(session_id, |messages| {
            if start >= messages.len() {
                return Vec::new();
            }
            let end = (start + count).min(messages.len());
            messages[start..end].to_vec()
        })
    }

    /// Keeps the most recent `max_messages` entries for the session.
    pub fn trim_history(&self, session_id: &str, max_messages: usize) {
        self.history.with_session(session_id, |messages| {
            if messages.len() > max_messages {
                let drop = messages.len() - max_messages;
                messages.drain(0..drop);
            }
        });
    }

    /// From the newest message backward, accumulate until the next message
    /// would overflow `max_tokens`; drop everything before that point.
    pub fn trim_history_by_tokens(&self, session_id: &str, max_tokens: usize) {
        self.history.with_session(session_id, |messages| {
            let mut budget = max_tokens;
            let mut cut = messages.len();
            for (i, message) in messages.iter().enumerate().rev() {
                let cost = message.approx_tokens();
                if cost > budget {
                    cut = i + 1;
                    break;
                }
                budget -= cost;
                cut = i;
            }
            messages.drain(0..cut);
        });
    }

    pub fn session_len(&self, session_id: &str) -> usize {
        self.history.with_session(session_id, |messages| messages.len())
    }

    /// Assemble the full message list for one request: system prompt,
    /// optional context messages, trimmed conversation history, the new user
    /// turn, then a token-budget-aware smart trim.
    #[allow(clippy::too_many_arguments)]
    pub fn build_context(
        &self,
        config: &BuildContextConfig,
        user_text: &str,
        session_id: &str,
        context_messages: Vec<ChatMessage>,
    ) -> Vec<ChatMessage> {
        let task = config.task.unwrap_or(TaskKind::CasualChat);
        let mut messages = vec![ChatMessage::system(build_system_prompt(task))];
        messages.extend(context_messages);

        if config.include_conversation_history {
            messages.extend(self.get_history(session_id, config.max_history_messages));
        }

        messages.push(ChatMessage::user(user_text));

        let total_tokens: usize = messages.iter().map(|m| m.approx_tokens()).sum();
        if total_tokens > config.max_tokens {
            messages = Self::retain_by_importance(messages, config.task, config.max_tokens);
        }
        messages
    }

    fn retain_by_importance(messages: Vec<ChatMessage>, task: Option<TaskKind>, max_tokens: usize) -> Vec<ChatMessage> {
        let total = messages.len();
        let scores: Vec<f32> = messages.iter().enumerate().map(|(i, m)| importance(m, task, i, total)).collect();

        let mut order: Vec<usize> = (0..total).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal));

        let mut keep = vec![false; total];
        let mut budget = max_tokens;
        for (i, message) in messages.iter().enumerate() {
            if message.role == MessageRole::System {
                keep[i] = true;
                budget = budget.saturating_sub(message.approx_tokens());
            }
        }
        for &i in &order {
            if keep[i] {
                continue;
            }
            let cost = messages[i].approx_tokens();
            if cost <= budget {
                keep[i] = true;
                budget -= cost;
            }
        }

        messages.into_iter().enumerate().filter(|(i, _)| keep[*i]).map(|(_, m)| m).collect()
    }

    /// Copies the active tool definitions (optionally filtered by name
    /// prefix) into the request and sets `tool_choice`. An unknown tool name
    /// in `choice` is an error.
    pub fn populate_tools_to_request(
        request: &mut vane_model::ChatRequest,
        available_tools: &[vane_model::Tool],
        name_prefix_filter: Option<&str>,
        choice: &str,
    ) -> Result<(), ServiceError> {
        let tools: Vec<vane_model::Tool> = available_tools
            .iter()
            .filter(|t| name_prefix_filter.map(|prefix| t.name.starts_with(prefix)).unwrap_or(true))
            .cloned()
            .collect();

        request.tool_choice = Some(match choice {
            "auto" => ToolChoice::Auto(vane_model::ToolChoiceMode::Auto),
            "none" => ToolChoice::Auto(vane_model::ToolChoiceMode::None),
            name => {
                if !tools.iter().any(|t| t.name == name) {
                    return Err(ServiceError::invalid_request(format!("unknown tool `{name}`"), now_ms()));
                }
                ToolChoice::Named(name.to_string())
            }
        });
        request.tools = tools;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vane_model::ChatRequest;

    #[test]
    fn system_prompts_are_unique_per_task() {
        let prompts: Vec<String> = TaskKind::ALL.iter().map(|&t| build_system_prompt(t)).collect();
        for (i, p) in prompts.iter().enumerate() {
            assert!(!p.is_empty());
            for (j, q) in prompts.iter().enumerate() {
                if i != j {
                    assert_ne!(p, q, "prompts for distinct tasks must differ");
                }
            }
        }
    }

    #[test]
    fn add_and_get_history_respects_max_messages() {
        let assembler = ContextAssembler::new();
        for i in 0..5 {
            assembler.add_message("s1", ChatMessage::user(format!("msg {i}")));
        }
        let history = assembler.get_history("s1", 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content.as_text(), Some("msg 4"));
    }

    #[test]
    fn get_history_by_range_returns_requested_slice() {
        let assembler = ContextAssembler::new();
        for i in 0..5 {
            assembler.add_message("s1", ChatMessage::user(format!("msg {i}")));
        }
        let range = assembler.get_history_by_range("s1", 1, 2);
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].content.as_text(), Some("msg 1"));
    }

    #[test]
    fn trim_history_keeps_most_recent() {
        let assembler = ContextAssembler::new();
        for i in 0..10 {
            assembler.add_message("s1", ChatMessage::user(format!("msg {i}")));
        }
        assembler.trim_history("s1", 3);
        assert_eq!(assembler.session_len("s1"), 3);
        let remaining = assembler.get_history("s1", 3);
        assert_eq!(remaining[0].content.as_text(), Some("msg 7"));
    }

    #[test]
    fn trim_history_by_tokens_drops_oldest_overflow() {
        let assembler = ContextAssembler::new();
        assembler.add_message("s1", ChatMessage::user("a".repeat(400)));
        assembler.add_message("s1", ChatMessage::user("b".repeat(4)));
        assembler.trim_history_by_tokens("s1", 10);
        let remaining = assembler.get_history("s1", 10);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content.as_text(), Some("bbbb"));
    }

    #[test]
    fn build_context_never_fails_with_absent_optional_inputs() {
        let assembler = ContextAssembler::new();
        let config = BuildContextConfig::new(TaskKind::CasualChat);
        let messages = assembler.build_context(&config, "hello", "s1", Vec::new());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].role, MessageRole::User);
    }

    #[test]
    fn build_context_includes_conversation_history_when_enabled() {
        let assembler = ContextAssembler::new();
        assembler.add_message("s1", ChatMessage::user("earlier"));
        assembler.add_message("s1", ChatMessage::assistant("reply"));
        let mut config = BuildContextConfig::new(TaskKind::CasualChat);
        config.include_conversation_history = true;
        let messages = assembler.build_context(&config, "now", "s1", Vec::new());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.last().unwrap().content.as_text(), Some("now"));
    }

    #[test]
    fn build_context_applies_smart_trim_when_over_budget() {
        let assembler = ContextAssembler::new();
        let mut config = BuildContextConfig::new(TaskKind::CasualChat);
        config.include_conversation_history = true;
        config.max_tokens = 20;
        for i in 0..20 {
            assembler.add_message("s1", ChatMessage::user(format!("filler message number {i}")));
        }
        let messages = assembler.build_context(&config, "final question", "s1", Vec::new());
        assert!(messages.iter().any(|m| m.role == MessageRole::System));
        assert_eq!(messages.last().unwrap().content.as_text(), Some("final question"));
    }

    #[test]
    fn importance_favors_recent_and_code_related_messages() {
        let code_msg = ChatMessage::user("function foo() { return 1; }".repeat(4));
        let plain_msg = ChatMessage::user("hi");
        let code_score = importance(&code_msg, Some(TaskKind::CodeGeneration), 4, 5);
        let plain_score = importance(&plain_msg, Some(TaskKind::CasualChat), 0, 5);
        assert!(code_score > plain_score);
    }

    #[test]
    fn context_message_builders_produce_expected_roles() {
        let agent_state = build_agent_state_message("idle", Some("summary"));
        assert_eq!(agent_state.role, MessageRole::System);
        let project = build_project_context_message("/repo", Some("src/, tests/"), &["src/lib.rs".to_string()]);
        assert_eq!(project.role, MessageRole::System);
        let code = build_code_context_message(&["src/lib.rs".to_string()], Some("fn main() {}"), Some("entry point"));
        assert_eq!(code.role, MessageRole::User);
        let memory = build_memory_events_message(&[MemoryEvent { kind: "fact".into(), text: "x".into(), importance: 0.9 }]);
        assert_eq!(memory.role, MessageRole::System);
    }

    #[test]
    fn populate_tools_sets_auto_choice_and_filters_by_prefix() {
        let mut request = ChatRequest::new("gpt", vec![ChatMessage::user("hi")]);
        let tools = vec![
            vane_model::Tool { name: "fs_read".into(), description: String::new(), parameters: serde_json::json!({}) },
            vane_model::Tool { name: "net_fetch".into(), description: String::new(), parameters: serde_json::json!({}) },
        ];
        ContextAssembler::populate_tools_to_request(&mut request, &tools, Some("fs_"), "auto").unwrap();
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].name, "fs_read");
        assert!(matches!(request.tool_choice, Some(ToolChoice::Auto(vane_model::ToolChoiceMode::Auto))));
    }

    #[test]
    fn populate_tools_rejects_unknown_named_choice() {
        let mut request = ChatRequest::new("gpt", vec![ChatMessage::user("hi")]);
        let tools = vec![vane_model::Tool { name: "fs_read".into(), description: String::new(), parameters: serde_json::json!({}) }];
        let err = ContextAssembler::populate_tools_to_request(&mut request, &tools, None, "nonexistent").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("nonexistent"));
    }
}
