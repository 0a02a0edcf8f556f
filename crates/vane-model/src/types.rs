// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat data model: messages, tool schemas, and request/response shapes
//! exchanged with an OpenAI-compatible Chat Completions backend.

use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Task classification ──────────────────────────────────────────────────────

/// Category of work a request represents. Used by the router to pick a model
/// and by the context assembler to pick a system prompt template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CasualChat,
    CodeDiscussion,
    TechnicalQnA,
    CodeGeneration,
    CodeAnalysis,
    CodeReview,
    CodeExplanation,
    BugFix,
    ProjectAnalysis,
    ArchitectureDesign,
    Documentation,
    AgentDecision,
    AgentReasoning,
    ContextUnderstanding,
    SpeechRecognition,
    SpeechSynthesis,
    VisionAnalysis,
    VisionDescription,
    SceneUnderstanding,
    ProactiveResponse,
    ToolCalling,
    CodeToolExecution,
}

impl TaskKind {
    /// All task kinds, in declaration order.
    pub const ALL: &'static [TaskKind] = &[
        TaskKind::CasualChat,
        TaskKind::CodeDiscussion,
        TaskKind::TechnicalQnA,
        TaskKind::CodeGeneration,
        TaskKind::CodeAnalysis,
        TaskKind::CodeReview,
        TaskKind::CodeExplanation,
        TaskKind::BugFix,
        TaskKind::ProjectAnalysis,
        TaskKind::ArchitectureDesign,
        TaskKind::Documentation,
        TaskKind::AgentDecision,
        TaskKind::AgentReasoning,
        TaskKind::ContextUnderstanding,
        TaskKind::SpeechRecognition,
        TaskKind::SpeechSynthesis,
        TaskKind::VisionAnalysis,
        TaskKind::VisionDescription,
        TaskKind::SceneUnderstanding,
        TaskKind::ProactiveResponse,
        TaskKind::ToolCalling,
        TaskKind::CodeToolExecution,
    ];

    pub fn is_code_related(self) -> bool {
        matches!(
            self,
            TaskKind::CodeDiscussion
                | TaskKind::CodeGeneration
                | TaskKind::CodeAnalysis
                | TaskKind::CodeReview
                | TaskKind::CodeExplanation
                | TaskKind::BugFix
                | TaskKind::CodeToolExecution
        )
    }

    pub fn is_multimodal(self) -> bool {
        matches!(
            self,
            TaskKind::SpeechRecognition
                | TaskKind::SpeechSynthesis
                | TaskKind::VisionAnalysis
                | TaskKind::VisionDescription
                | TaskKind::SceneUnderstanding
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("unknown"))
    }
}

/// Request priority. Ordering is significant: `Critical` is the highest and
/// sorts first; derive order follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Lower rank dispatches first.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

// ─── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content part in a multi-part message. Images must be either an
/// `http(s)://` URL or a `data:image/{png,jpeg,jpg,webp};base64,...` URL whose
/// decoded payload is non-empty and at most 5 MiB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
}

/// Maximum decoded size of an inline image, per the data model invariant.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into() }
    }

    /// `true` when this part is non-empty (text has content, or the image URL
    /// validates per [`validate_image_url`]).
    pub fn is_valid(&self) -> bool {
        match self {
            ContentPart::Text { text } => !text.is_empty(),
            ContentPart::Image { image_url } => validate_image_url(image_url).is_ok(),
        }
    }
}

/// Validate an image reference per the data model invariant. Returns the
/// decoded byte length for data URLs, or `0` for remote URLs (size unknown
/// without a fetch).
pub fn validate_image_url(url: &str) -> Result<usize, &'static str> {
    if url.is_empty() {
        return Err("image url is empty");
    }
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, b64) = rest.split_once(',').ok_or("malformed data url")?;
        let mime = meta.strip_suffix(";base64").ok_or("data url must be base64-encoded")?;
        let supported = ["image/png", "image/jpeg", "image/jpg", "image/webp"];
        if !supported.contains(&mime) {
            return Err("unsupported image format");
        }
        if b64.is_empty() {
            return Err("empty image payload");
        }
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| "malformed base64 payload")?;
        if decoded.is_empty() {
            return Err("empty image payload");
        }
        if decoded.len() > MAX_IMAGE_BYTES {
            return Err("image exceeds 5 MiB limit");
        }
        return Ok(decoded.len());
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(0);
    }
    Err("image url must be http(s):// or a data:image/* url")
}

/// Content of a [`ChatMessage`]: either plain text or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Image { image_url } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            MessageContent::Text(t) => !t.is_empty(),
            MessageContent::Parts(parts) => !parts.is_empty() && parts.iter().all(ContentPart::is_valid),
        }
    }
}

/// Identifies the tool a model invocation is aimed at, and the arguments it
/// was called with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Either a JSON object or a raw string (when a streamed payload did not
    /// parse as valid JSON).
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// `true` when `arguments` is either a JSON object or a string.
    pub fn has_valid_arguments(&self) -> bool {
        matches!(self.function.arguments, serde_json::Value::Object(_) | serde_json::Value::String(_))
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool calls requested by an assistant turn alongside (or instead of)
    /// text content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, MessageContent::Text(text.into()))
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Text(text.into()),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: vec![],
        }
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::new(MessageRole::User, MessageContent::Parts(parts))
    }

    fn new(role: MessageRole, content: MessageContent) -> Self {
        Self { role, content, name: None, tool_call_id: None, tool_calls: vec![] }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.content.as_text()
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.content.image_urls()
    }

    /// Invariant check: non-empty text, non-empty/valid parts.
    pub fn is_valid(&self) -> bool {
        self.content.is_valid() || !self.tool_calls.is_empty()
    }

    /// Token estimate for this message using a 4-chars-per-token heuristic for
    /// text. Each image costs a base 200 tokens plus up to 2000 more, scaled
    /// by decoded size (capped at [`MAX_IMAGE_BYTES`]).
    pub fn approx_tokens(&self) -> usize {
        let text_chars: usize = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { .. } => 0,
                })
                .sum(),
        };
        let image_tokens: usize = self
            .content
            .image_urls()
            .iter()
            .map(|url| {
                let size = validate_image_url(url).unwrap_or(0);
                let extra = (size * 2000 / MAX_IMAGE_BYTES.max(1)).min(2000);
                200 + extra
            })
            .sum();
        let tool_chars: usize = self
            .tool_calls
            .iter()
            .map(|tc| tc.function.name.len() + tc.function.arguments.to_string().len())
            .sum();
        ((text_chars + tool_chars) / 4).max(1) + image_tokens
    }
}

// ─── Tool schemas ──────────────────────────────────────────────────────────────

/// A tool definition offered to the model.
///
/// Serializes/deserializes in the OpenAI-compatible wire shape
/// `{"type":"function","function":{"name":...,"description":...,"parameters":...}}`
/// rather than its own flat field layout; see [`ToolWire`].
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ToolFunctionWire {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct ToolWire {
    #[serde(rename = "type", default = "default_tool_call_type")]
    kind: String,
    function: ToolFunctionWire,
}

impl Serialize for Tool {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ToolWire {
            kind: default_tool_call_type(),
            function: ToolFunctionWire {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tool {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ToolWire::deserialize(deserializer)?;
        Ok(Tool { name: wire.function.name, description: wire.function.description, parameters: wire.function.parameters })
    }
}

/// Selects which tool (if any) the model should call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Auto(ToolChoiceMode),
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceMode {
    Auto,
    None,
}

// ─── Requests / responses ──────────────────────────────────────────────────────

/// A chat completion request. Accepts snake_case and camelCase field names on
/// ingress; serializes to snake_case for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "topP")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "topK")]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "toolChoice")]
    pub tool_choice: Option<ToolChoice>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            stream: false,
            stop: None,
            tools: vec![],
            tool_choice: None,
        }
    }
}

/// Closed set of reasons a completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A completed (non-streaming, or fully aggregated streaming) chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatResponse {
    /// Per the validation invariant: empty content is acceptable only when
    /// the completion was truncated or produced tool calls instead of text.
    pub fn is_valid(&self) -> bool {
        if !self.content.is_empty() || !self.tool_calls.is_empty() {
            return true;
        }
        matches!(self.finish_reason, Some(FinishReason::Length))
    }
}

/// A partial delta to a single tool call, as it streams in over SSE.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name_delta: String,
    pub arguments_delta: String,
}

/// A single decoded SSE event from a streaming completion.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    TextDelta(String),
    ToolCallDelta(ToolCallDelta),
    Usage(Usage),
    Done,
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_code_related_classification() {
        assert!(TaskKind::CodeGeneration.is_code_related());
        assert!(TaskKind::BugFix.is_code_related());
        assert!(!TaskKind::CasualChat.is_code_related());
    }

    #[test]
    fn task_kind_multimodal_classification() {
        assert!(TaskKind::VisionAnalysis.is_multimodal());
        assert!(!TaskKind::CodeGeneration.is_multimodal());
    }

    #[test]
    fn task_priority_ordering() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Low);
        assert_eq!(TaskPriority::Critical.rank(), 0);
        assert_eq!(TaskPriority::Low.rank(), 3);
    }

    #[test]
    fn message_constructors_set_role_and_text() {
        assert_eq!(ChatMessage::user("hi").as_text(), Some("hi"));
        assert_eq!(ChatMessage::system("sp").role, MessageRole::System);
        assert_eq!(ChatMessage::assistant("ok").role, MessageRole::Assistant);
    }

    #[test]
    fn tool_result_sets_tool_call_id() {
        let m = ChatMessage::tool_result("call_1", "42");
        assert_eq!(m.role, MessageRole::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(m.as_text(), Some("42"));
    }

    #[test]
    fn image_url_validation_accepts_https() {
        assert!(validate_image_url("https://example.com/a.png").is_ok());
    }

    #[test]
    fn image_url_validation_rejects_empty() {
        assert!(validate_image_url("").is_err());
    }

    #[test]
    fn image_url_validation_rejects_bad_scheme() {
        assert!(validate_image_url("ftp://example.com/a.png").is_err());
    }

    #[test]
    fn image_url_validation_accepts_data_url() {
        // "hi" base64-encoded
        let url = "data:image/png;base64,aGk=";
        assert!(validate_image_url(url).is_ok());
    }

    #[test]
    fn image_url_validation_rejects_unsupported_format() {
        let url = "data:image/gif;base64,aGk=";
        assert!(validate_image_url(url).is_err());
    }

    #[test]
    fn image_url_validation_rejects_oversized_payload() {
        use base64::Engine;
        let big = vec![0u8; MAX_IMAGE_BYTES + 1];
        let b64 = base64::engine::general_purpose::STANDARD.encode(&big);
        let url = format!("data:image/png;base64,{b64}");
        assert!(validate_image_url(&url).is_err());
    }

    #[test]
    fn approx_tokens_text_uses_four_chars_per_token() {
        let m = ChatMessage::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = ChatMessage::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_image_adds_base_cost() {
        let m = ChatMessage::user_with_parts(vec![ContentPart::image("https://example.com/a.png")]);
        assert_eq!(m.approx_tokens(), 200);
    }

    #[test]
    fn tool_call_accepts_object_or_string_arguments() {
        let obj = ToolCall {
            id: "1".into(),
            kind: "function".into(),
            function: FunctionCall { name: "f".into(), arguments: serde_json::json!({"a": 1}) },
        };
        assert!(obj.has_valid_arguments());
        let raw = ToolCall {
            id: "2".into(),
            kind: "function".into(),
            function: FunctionCall { name: "f".into(), arguments: serde_json::Value::String("not json".into()) },
        };
        assert!(raw.has_valid_arguments());
    }

    #[test]
    fn tool_serializes_in_openai_function_wrapper_shape() {
        let tool = Tool { name: "get_weather".into(), description: "look up weather".into(), parameters: serde_json::json!({"type": "object"}) };
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "get_weather");
        assert_eq!(value["function"]["description"], "look up weather");
        assert_eq!(value["function"]["parameters"], serde_json::json!({"type": "object"}));
        assert!(value.get("name").is_none(), "name must not appear flat at the top level");
    }

    #[test]
    fn tool_round_trips_through_the_wrapper_shape() {
        let tool = Tool { name: "search".into(), description: "web search".into(), parameters: serde_json::json!({}) };
        let json = serde_json::to_string(&tool).unwrap();
        let back: Tool = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "search");
        assert_eq!(back.description, "web search");
    }

    #[test]
    fn chat_request_with_tools_serializes_each_tool_in_function_shape() {
        let mut req = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        req.tools = vec![Tool { name: "search".into(), description: "web search".into(), parameters: serde_json::json!({}) }];
        let value = serde_json::to_value(&req).unwrap();
        let tools = value["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "search");
    }

    #[test]
    fn chat_response_valid_when_length_truncated_with_empty_content() {
        let r = ChatResponse {
            content: String::new(),
            tool_calls: vec![],
            finish_reason: Some(FinishReason::Length),
            usage: Usage::default(),
            model: None,
        };
        assert!(r.is_valid());
    }

    #[test]
    fn chat_response_invalid_when_empty_and_stopped() {
        let r = ChatResponse {
            content: String::new(),
            tool_calls: vec![],
            finish_reason: Some(FinishReason::Stop),
            usage: Usage::default(),
            model: None,
        };
        assert!(!r.is_valid());
    }

    #[test]
    fn chat_request_round_trips_through_json() {
        let req = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        let json = serde_json::to_string(&req).unwrap();
        let back: ChatRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, "gpt-4o");
        assert_eq!(back.messages.len(), 1);
    }

    #[test]
    fn chat_request_accepts_camel_case_ingress() {
        let json = r#"{"model":"m","messages":[],"maxTokens":100,"topP":0.5}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.max_tokens, Some(100));
        assert_eq!(req.top_p, Some(0.5));
    }
}
