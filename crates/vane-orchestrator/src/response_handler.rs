// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wraps [`ResponseCache`] with cache-eligibility policy and response
//! validation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use vane_model::{ChatRequest, ChatResponse, FinishReason, ServiceError, StreamCallbacks};

use crate::cache::{generate_key, ResponseCache};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("response is missing a non-empty `choices` array")]
    MissingChoices,
    #[error("choices[0] is not an object")]
    FirstChoiceNotAnObject,
    #[error("choices[0] is missing a `message` object")]
    MissingMessage,
    #[error("finish_reason `{0}` is not one of the recognized values")]
    UnrecognizedFinishReason(String),
    #[error("tool call `{0}` has arguments that are neither an object nor a string")]
    InvalidToolCallArguments(String),
}

/// Outcome of handing a response through cache + validation.
#[derive(Debug, Clone)]
pub struct HandledResponse {
    pub response: ChatResponse,
    pub from_cache: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total_responses: AtomicU64,
    cached_responses: AtomicU64,
    total_response_size: AtomicU64,
}

pub struct ResponseHandler {
    cache: Arc<ResponseCache>,
    cache_enabled: bool,
    cache_tool_calls: bool,
    cache_temperature_threshold: f32,
    counters: Counters,
}

impl ResponseHandler {
    pub fn new(cache: ResponseCache, cache_enabled: bool) -> Self {
        Self {
            cache: Arc::new(cache),
            cache_enabled,
            cache_tool_calls: false,
            cache_temperature_threshold: 0.01,
            counters: Counters::default(),
        }
    }

    pub fn with_tool_call_caching(mut self, cache_tool_calls: bool) -> Self {
        self.cache_tool_calls = cache_tool_calls;
        self
    }

    pub fn with_temperature_threshold(mut self, threshold: f32) -> Self {
        self.cache_temperature_threshold = threshold;
        self
    }

    pub fn should_cache(&self, request: &ChatRequest) -> bool {
        if !self.cache_enabled || request.stream {
            return false;
        }
        let temperature_ok = request.temperature.map(|t| t <= self.cache_temperature_threshold).unwrap_or(true);
        if !temperature_ok {
            return false;
        }
        request.tools.is_empty() || self.cache_tool_calls
    }

    pub fn check_cache(&self, request: &ChatRequest) -> Option<ChatResponse> {
        self.counters.total_responses.fetch_add(1, Ordering::Relaxed);
        if !self.should_cache(request) {
            return None;
        }
        let key = generate_key(request);
        let hit = self.cache.get(&key);
        if let Some(response) = &hit {
            self.counters.cached_responses.fetch_add(1, Ordering::Relaxed);
            let size = serde_json::to_vec(response).map(|b| b.len()).unwrap_or(0);
            self.counters.total_response_size.fetch_add(size as u64, Ordering::Relaxed);
        }
        hit
    }

    pub fn store_cache(&self, request: &ChatRequest, response: &ChatResponse) {
        if !self.should_cache(request) {
            return;
        }
        let key = generate_key(request);
        self.cache.put(key, response.clone(), None);
    }

    pub fn total_responses(&self) -> u64 {
        self.counters.total_responses.load(Ordering::Relaxed)
    }

    pub fn cached_responses(&self) -> u64 {
        self.counters.cached_responses.load(Ordering::Relaxed)
    }

    pub fn total_response_size(&self) -> u64 {
        self.counters.total_response_size.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// A cloned handle to the underlying cache, suitable for passing to
    /// [`ResponseCache::spawn_cleanup`] independently of this handler's own
    /// lifetime.
    pub fn cache_handle(&self) -> Arc<ResponseCache> {
        self.cache.clone()
    }

    /// Validate a raw JSON response body against the OpenAI Chat Completions
    /// shape: an object with a non-empty `choices` array whose first element
    /// is an object containing a `message` object.
    pub fn validate_json_response(json: &serde_json::Value) -> Result<(), ValidationError> {
        let obj = json.as_object().ok_or(ValidationError::NotAnObject)?;
        let choices = obj.get("choices").and_then(|v| v.as_array()).ok_or(ValidationError::MissingChoices)?;
        let first = choices.first().ok_or(ValidationError::MissingChoices)?;
        let first_obj = first.as_object().ok_or(ValidationError::FirstChoiceNotAnObject)?;
        if !first_obj.get("message").map(|m| m.is_object()).unwrap_or(false) {
            return Err(ValidationError::MissingMessage);
        }
        Ok(())
    }

    /// Drive `callbacks` over an arbitrary SSE byte stream using the same
    /// aggregation path as [`vane_model::ProtocolClient::chat_stream`], so a
    /// caller that already has a byte stream in hand (a recorded fixture, a
    /// proxied response) doesn't need a live `ProtocolClient` to consume it.
    pub async fn handle_stream_response<S, B, E>(
        &self,
        byte_stream: S,
        cancel: Arc<AtomicBool>,
        callbacks: &mut impl StreamCallbacks,
    ) -> Result<ChatResponse, ServiceError>
    where
        S: futures::Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        vane_model::drive_stream(byte_stream, cancel, callbacks).await
    }

    /// Validate a typed, already-aggregated response.
    pub fn validate_typed_response(response: &ChatResponse) -> Result<(), ValidationError> {
        if let Some(reason) = response.finish_reason {
            if !matches!(
                reason,
                FinishReason::Stop | FinishReason::Length | FinishReason::ToolCalls | FinishReason::ContentFilter
            ) {
                return Err(ValidationError::UnrecognizedFinishReason(format!("{reason:?}")));
            }
        }
        for call in &response.tool_calls {
            if !call.has_valid_arguments() {
                return Err(ValidationError::InvalidToolCallArguments(call.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vane_model::{ChatMessage, FunctionCall, ToolCall, Usage};

    fn request() -> ChatRequest {
        ChatRequest::new("gpt", vec![ChatMessage::user("hi")])
    }

    fn response() -> ChatResponse {
        ChatResponse {
            content: "hello".to_string(),
            tool_calls: Vec::new(),
            finish_reason: Some(FinishReason::Stop),
            usage: Usage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 },
            model: None,
        }
    }

    #[test]
    fn should_cache_is_false_when_disabled() {
        let handler = ResponseHandler::new(ResponseCache::new(true), false);
        assert!(!handler.should_cache(&request()));
    }

    #[test]
    fn should_cache_is_false_for_streaming_requests() {
        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let mut req = request();
        req.stream = true;
        assert!(!handler.should_cache(&req));
    }

    #[test]
    fn should_cache_respects_temperature_threshold() {
        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let mut req = request();
        req.temperature = Some(0.5);
        assert!(!handler.should_cache(&req));
        req.temperature = Some(0.0);
        assert!(handler.should_cache(&req));
    }

    #[test]
    fn should_cache_excludes_tool_requests_unless_opted_in() {
        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let mut req = request();
        req.tools = vec![vane_model::Tool {
            name: "search".to_string(),
            description: String::new(),
            parameters: json!({}),
        }];
        assert!(!handler.should_cache(&req));
        let handler = handler.with_tool_call_caching(true);
        assert!(handler.should_cache(&req));
    }

    #[test]
    fn check_cache_counts_total_and_hit() {
        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let req = request();
        assert!(handler.check_cache(&req).is_none());
        handler.store_cache(&req, &response());
        assert!(handler.check_cache(&req).is_some());
        assert_eq!(handler.total_responses(), 2);
        assert_eq!(handler.cached_responses(), 1);
    }

    #[test]
    fn store_cache_is_a_no_op_when_not_eligible() {
        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let mut req = request();
        req.stream = true;
        handler.store_cache(&req, &response());
        assert_eq!(handler.cache().get_cache_size(), 0);
    }

    #[test]
    fn validate_json_accepts_well_formed_shape() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert!(ResponseHandler::validate_json_response(&body).is_ok());
    }

    #[test]
    fn validate_json_rejects_missing_choices() {
        let body = json!({});
        assert_eq!(ResponseHandler::validate_json_response(&body), Err(ValidationError::MissingChoices));
    }

    #[test]
    fn validate_json_rejects_empty_choices_array() {
        let body = json!({"choices": []});
        assert_eq!(ResponseHandler::validate_json_response(&body), Err(ValidationError::MissingChoices));
    }

    #[test]
    fn validate_json_rejects_choice_without_message() {
        let body = json!({"choices": [{"finish_reason": "stop"}]});
        assert_eq!(ResponseHandler::validate_json_response(&body), Err(ValidationError::MissingMessage));
    }

    #[test]
    fn validate_typed_accepts_empty_content_on_tool_calls() {
        let mut resp = response();
        resp.content = String::new();
        resp.finish_reason = Some(FinishReason::ToolCalls);
        resp.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall { name: "search".to_string(), arguments: json!({"q": "x"}) },
        });
        assert!(ResponseHandler::validate_typed_response(&resp).is_ok());
        assert!(resp.is_valid());
    }

    #[tokio::test]
    async fn handle_stream_response_aggregates_an_arbitrary_byte_stream() {
        struct Recorder(String);
        impl vane_model::StreamCallbacks for Recorder {
            fn on_text_delta(&mut self, text: &str) {
                self.0.push_str(text);
            }
        }

        let handler = ResponseHandler::new(ResponseCache::new(true), true);
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let stream = futures::stream::iter(chunks);
        let mut recorder = Recorder(String::new());
        let cancel = std::sync::Arc::new(AtomicBool::new(false));

        let response = handler.handle_stream_response(stream, cancel, &mut recorder).await.unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(recorder.0, "hi");
    }

    #[test]
    fn validate_typed_rejects_invalid_tool_call_arguments() {
        let mut resp = response();
        resp.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            kind: "function".to_string(),
            function: FunctionCall { name: "search".to_string(), arguments: json!(42) },
        });
        assert_eq!(
            ResponseHandler::validate_typed_response(&resp),
            Err(ValidationError::InvalidToolCallArguments("call_1".to_string()))
        );
    }
}
