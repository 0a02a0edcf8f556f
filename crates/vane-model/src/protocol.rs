// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible Chat Completions client: non-streaming, async, and SSE
//! streaming with delta aggregation.
//!
//! The SSE line-buffering strategy here is the same one this workspace's
//! earlier multi-provider client used: bytes arrive in arbitrary TCP chunks,
//! so a persistent buffer accumulates them and only complete events are
//! parsed out, with any trailing partial event left for the next chunk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, ServiceError};
use crate::types::{ChatRequest, ChatResponse, FinishReason, FunctionCall, ResponseEvent, ToolCall, ToolCallDelta, Usage};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Callbacks invoked as a streaming completion progresses. `on_complete` is
/// guaranteed to fire at most once, and never after `on_error`.
pub trait StreamCallbacks: Send {
    fn on_text_delta(&mut self, _text: &str) {}
    fn on_tool_call_delta(&mut self, _delta: &ToolCallDelta) {}
    fn on_complete(&mut self, _response: &ChatResponse) {}
    fn on_error(&mut self, _error: &ServiceError) {}
}

/// OpenAI-compatible Chat Completions client.
pub struct ProtocolClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    default_timeout_ms: u64,
}

impl ProtocolClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, default_timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            default_timeout_ms,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Synchronous (blocking-until-complete) chat call. Never streams.
    pub async fn chat(&self, mut req: ChatRequest) -> Result<ChatResponse, ServiceError> {
        req.stream = false;
        let cancel = Arc::new(AtomicBool::new(false));
        self.chat_async(req, cancel).await
    }

    /// Async chat call honoring an external cancellation flag. Used by the
    /// scheduler, which owns the flag and can set it from another task.
    pub async fn chat_async(&self, req: ChatRequest, cancel: Arc<AtomicBool>) -> Result<ChatResponse, ServiceError> {
        debug!(model = %req.model, stream = req.stream, messages = req.messages.len(), "sending completion request");
        trace!(request = ?req, "full completion request");

        let body = serde_json::to_value(&req).map_err(|e| ServiceError::invalid_request(e.to_string(), now_ms()))?;

        let send = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_millis(self.default_timeout_ms))
            .send();

        let resp = tokio::select! {
            r = send => r.map_err(map_transport_error)?,
            _ = cancel_watch(&cancel) => return Err(ServiceError::cancelled(now_ms())),
        };

        if !resp.status().is_success() {
            return Err(map_http_error(resp).await);
        }

        let body: Value = resp.json().await.map_err(|e| ServiceError::network(e.to_string(), now_ms()))?;
        parse_completion_body(&body)
    }

    /// Streaming chat call. Drives `callbacks` until the stream terminates,
    /// then returns the aggregated response (also delivered via `on_complete`).
    pub async fn chat_stream(
        &self,
        mut req: ChatRequest,
        cancel: Arc<AtomicBool>,
        mut callbacks: impl StreamCallbacks,
    ) -> Result<ChatResponse, ServiceError> {
        req.stream = true;
        let body = serde_json::to_value(&req).map_err(|e| ServiceError::invalid_request(e.to_string(), now_ms()))?;

        debug!(model = %req.model, "sending streaming completion request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .timeout(Duration::from_millis(self.default_timeout_ms))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            let err = map_http_error(resp).await;
            callbacks.on_error(&err);
            return Err(err);
        }

        drive_stream(resp.bytes_stream(), cancel, &mut callbacks).await
    }
}

/// Drives `callbacks` from an arbitrary byte stream using the same SSE
/// line-buffering and delta-aggregation logic as [`ProtocolClient::chat_stream`].
/// Lets callers feed bytes from something other than a live `reqwest`
/// response (a recorded fixture, a proxy, a different transport) through the
/// same aggregation path.
pub async fn drive_stream<S, B, E>(
    mut byte_stream: S,
    cancel: Arc<AtomicBool>,
    callbacks: &mut impl StreamCallbacks,
) -> Result<ChatResponse, ServiceError>
where
    S: futures::Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut aggregator = StreamAggregator::default();
    let mut buf = String::new();

    loop {
        if cancel.load(Ordering::SeqCst) {
            let err = ServiceError::cancelled(now_ms());
            callbacks.on_error(&err);
            return Err(err);
        }
        let chunk = match byte_stream.next().await {
            Some(Ok(b)) => b,
            Some(Err(e)) => {
                let err = ServiceError::network(e.to_string(), now_ms());
                callbacks.on_error(&err);
                return Err(err);
            }
            None => break,
        };
        buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));
        for payload in drain_complete_sse_events(&mut buf) {
            if payload == "[DONE]" {
                aggregator.mark_done_with_callback(callbacks);
                continue;
            }
            let value: Value = match serde_json::from_str(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to parse SSE payload");
                    continue;
                }
            };
            for event in parse_sse_chunk(&value) {
                aggregator.apply(&event, callbacks);
            }
        }
        if aggregator.completed {
            break;
        }
    }

    let response = aggregator.finish();
    if !aggregator.completed {
        callbacks.on_complete(&response);
    }
    Ok(response)
}

async fn cancel_watch(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn map_transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::timeout(e.to_string(), now_ms())
    } else {
        ServiceError::network(e.to_string(), now_ms())
    }
}

async fn map_http_error(resp: reqwest::Response) -> ServiceError {
    let status = resp.status().as_u16();
    let kind = ErrorKind::from_status(status);
    let text = resp.text().await.unwrap_or_default();
    let details = serde_json::from_str::<Value>(&text).ok();
    let mut err = ServiceError::new(kind, status, text, now_ms());
    if let Some(d) = details {
        err = err.with_details(d);
    }
    err
}

/// Parse a non-streaming completion response body. Accepts both the full
/// OpenAI `choices[0].message` shape and a simplified flat shape.
fn parse_completion_body(v: &Value) -> Result<ChatResponse, ServiceError> {
    let model = v.get("model").and_then(|m| m.as_str()).map(str::to_string);
    let usage = v
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
        .unwrap_or_default();

    if let Some(choice) = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first()) {
        let message = choice.get("message").unwrap_or(&Value::Null);
        let content = message.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string();
        let tool_calls = parse_tool_calls_array(message.get("tool_calls"));
        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .and_then(parse_finish_reason);
        return Ok(ChatResponse { content, tool_calls, finish_reason, usage, model });
    }

    // Simplified flat shape: {content, tool_calls, finish_reason, usage}.
    let content = v.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string();
    let tool_calls = parse_tool_calls_array(v.get("tool_calls"));
    let finish_reason = v.get("finish_reason").and_then(|f| f.as_str()).and_then(parse_finish_reason);
    Ok(ChatResponse { content, tool_calls, finish_reason, usage, model })
}

fn parse_finish_reason(s: &str) -> Option<FinishReason> {
    match s {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "tool_calls" => Some(FinishReason::ToolCalls),
        "content_filter" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

fn parse_tool_calls_array(v: Option<&Value>) -> Vec<ToolCall> {
    let Some(arr) = v.and_then(|v| v.as_array()) else { return vec![] };
    arr.iter()
        .enumerate()
        .map(|(i, tc)| {
            let id = tc.get("id").and_then(|i| i.as_str()).map(str::to_string).unwrap_or_else(|| format!("toolcall_{i}"));
            let name = tc.get("function").and_then(|f| f.get("name")).and_then(|n| n.as_str()).unwrap_or("").to_string();
            let raw_args = tc.get("function").and_then(|f| f.get("arguments")).and_then(|a| a.as_str()).unwrap_or("");
            let arguments = serde_json::from_str::<Value>(raw_args).unwrap_or_else(|_| Value::String(raw_args.to_string()));
            ToolCall { id, kind: "function".to_string(), function: FunctionCall { name, arguments } }
        })
        .collect()
}

// ─── SSE decoding ────────────────────────────────────────────────────────────

/// Drain complete SSE events (delimited by a blank line) from `buf`, returning
/// each event's concatenated `data:` payload. Any trailing partial event is
/// left in `buf` for the next chunk.
pub(crate) fn drain_complete_sse_events(buf: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    loop {
        let normalized_boundary = find_event_boundary(buf);
        let Some((event_end, consumed)) = normalized_boundary else { break };
        let event_text = buf[..event_end].to_string();
        *buf = buf[consumed..].to_string();

        let mut data_lines = Vec::new();
        for line in event_text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if data_lines.is_empty() {
            continue;
        }
        payloads.push(data_lines.join("\n"));
    }
    payloads
}

/// Find the end of the next complete SSE event in `buf`: returns
/// `(event_text_end, bytes_consumed_including_blank_line)`.
fn find_event_boundary(buf: &str) -> Option<(usize, usize)> {
    if let Some(pos) = buf.find("\n\n") {
        return Some((pos, pos + 2));
    }
    if let Some(pos) = buf.find("\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    None
}

fn parse_sse_chunk(v: &Value) -> Vec<ResponseEvent> {
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return vec![ResponseEvent::Usage(Usage {
            prompt_tokens: usage.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as u32,
            completion_tokens: usage.get("completion_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as u32,
            total_tokens: usage.get("total_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as u32,
        })];
    }

    let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());
    let Some(choice) = choice else { return vec![] };
    let delta = choice.get("delta").or_else(|| choice.get("message")).unwrap_or(&Value::Null);

    let mut events = Vec::new();

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for (fallback_idx, tc) in tool_calls.iter().enumerate() {
            let index = tc
                .get("index")
                .and_then(|i| i.as_u64())
                .map(|i| i as u32)
                .unwrap_or(fallback_idx as u32);
            let id = tc.get("id").and_then(|i| i.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
            let name_delta = tc.get("function").and_then(|f| f.get("name")).and_then(|n| n.as_str()).unwrap_or("").to_string();
            let arguments_delta = tc.get("function").and_then(|f| f.get("arguments")).and_then(|a| a.as_str()).unwrap_or("").to_string();
            if id.is_some() || !name_delta.is_empty() || !arguments_delta.is_empty() {
                events.push(ResponseEvent::ToolCallDelta(ToolCallDelta { index, id, name_delta, arguments_delta }));
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(ResponseEvent::TextDelta(text.to_string()));
        }
    }

    events
}

/// Accumulates streamed text and tool-call deltas into a final [`ChatResponse`].
#[derive(Default)]
struct StreamAggregator {
    content: String,
    model: Option<String>,
    finish_reason: Option<FinishReason>,
    usage: Usage,
    tool_calls: BTreeMap<u32, ToolCallBuilder>,
    id_to_index: std::collections::HashMap<String, u32>,
    next_fallback_index: u32,
    completed: bool,
}

#[derive(Default)]
struct ToolCallBuilder {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl StreamAggregator {
    fn apply(&mut self, event: &ResponseEvent, callbacks: &mut impl StreamCallbacks) {
        match event {
            ResponseEvent::TextDelta(text) => {
                if !text.is_empty() {
                    self.content.push_str(text);
                    callbacks.on_text_delta(text);
                }
            }
            ResponseEvent::ToolCallDelta(delta) => {
                let index = if let Some(id) = &delta.id {
                    *self.id_to_index.entry(id.clone()).or_insert(delta.index)
                } else if self.tool_calls.contains_key(&delta.index) {
                    delta.index
                } else {
                    let idx = delta.index.max(self.next_fallback_index);
                    self.next_fallback_index = idx + 1;
                    idx
                };
                let builder = self.tool_calls.entry(index).or_default();
                if let Some(id) = &delta.id {
                    builder.id = Some(id.clone());
                }
                builder.name.push_str(&delta.name_delta);
                builder.arguments.push_str(&delta.arguments_delta);
                callbacks.on_tool_call_delta(delta);
            }
            ResponseEvent::Usage(u) => self.usage = *u,
            ResponseEvent::Done => self.mark_done_with_callback(callbacks),
            ResponseEvent::Error(_) => {}
        }
    }

    fn mark_done_with_callback(&mut self, callbacks: &mut impl StreamCallbacks) {
        if self.completed {
            return;
        }
        self.completed = true;
        let response = self.finish();
        callbacks.on_complete(&response);
    }

    fn finish(&self) -> ChatResponse {
        // BTreeMap iterates in ascending key (index) order already.
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .iter()
            .map(|(index, builder)| {
                let id = builder.id.clone().unwrap_or_else(|| format!("toolcall_{index}"));
                let arguments = serde_json::from_str::<Value>(&builder.arguments)
                    .unwrap_or_else(|_| Value::String(builder.arguments.clone()));
                ToolCall { id, kind: "function".to_string(), function: FunctionCall { name: builder.name.clone(), arguments } }
            })
            .collect();
        let finish_reason = self.finish_reason.or(if tool_calls.is_empty() { None } else { Some(FinishReason::ToolCalls) });
        ChatResponse {
            content: self.content.clone(),
            tool_calls,
            finish_reason,
            usage: self.usage,
            model: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        text: String,
        completes: u32,
        errors: u32,
    }

    impl StreamCallbacks for Recorder {
        fn on_text_delta(&mut self, text: &str) {
            self.text.push_str(text);
        }
        fn on_complete(&mut self, _response: &ChatResponse) {
            self.completes += 1;
        }
        fn on_error(&mut self, _error: &ServiceError) {
            self.errors += 1;
        }
    }

    #[test]
    fn drains_single_complete_event() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_string();
        let events = drain_complete_sse_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn retains_incomplete_trailing_event() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel".to_string();
        let mut buf = partial.clone();
        let events = drain_complete_sse_events(&mut buf);
        assert!(events.is_empty());
        assert_eq!(buf, partial);
    }

    #[test]
    fn event_split_across_chunks_is_reassembled() {
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\n";
        let split = full.len() / 2;
        let mut buf = full[..split].to_string();
        assert!(drain_complete_sse_events(&mut buf).is_empty());
        buf.push_str(&full[split..]);
        let events = drain_complete_sse_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn crlf_event_boundary_is_handled() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n\r\n".to_string();
        let events = drain_complete_sse_events(&mut buf);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn done_sentinel_is_recognised() {
        let mut buf = "data: [DONE]\n\n".to_string();
        let events = drain_complete_sse_events(&mut buf);
        assert_eq!(events, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn multiline_data_payload_is_concatenated() {
        let mut buf = "data: line one\ndata: line two\n\n".to_string();
        let events = drain_complete_sse_events(&mut buf);
        assert_eq!(events, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn aggregator_accumulates_tool_calls_by_index() {
        let mut agg = StreamAggregator::default();
        let mut recorder = Recorder { text: String::new(), completes: 0, errors: 0 };
        let c1: Value = json!({"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_","arguments":"{\"city\":\"Bei"}}]}}]});
        for ev in parse_sse_chunk(&c1) {
            agg.apply(&ev, &mut recorder);
        }
        let c2: Value = json!({"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"weather","arguments":"jing\"}"}}]}}]});
        for ev in parse_sse_chunk(&c2) {
            agg.apply(&ev, &mut recorder);
        }
        agg.mark_done_with_callback(&mut recorder);
        let resp = agg.finish();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "call_1");
        assert_eq!(resp.tool_calls[0].function.name, "get_weather");
        assert_eq!(resp.tool_calls[0].function.arguments, json!({"city": "Beijing"}));
        assert_eq!(recorder.completes, 1);
    }

    #[test]
    fn aggregator_fires_on_complete_exactly_once() {
        let mut agg = StreamAggregator::default();
        let mut recorder = Recorder { text: String::new(), completes: 0, errors: 0 };
        agg.apply(&ResponseEvent::TextDelta("hi".into()), &mut recorder);
        agg.mark_done_with_callback(&mut recorder);
        agg.mark_done_with_callback(&mut recorder);
        assert_eq!(recorder.completes, 1);
        assert_eq!(recorder.text, "hi");
    }

    #[test]
    fn parse_completion_body_handles_full_openai_shape() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "hi",
                    "tool_calls": [{"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"Beijing\"}"}}]
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
            "model": "m1"
        });
        let resp = parse_completion_body(&body).unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].function.arguments, json!({"city": "Beijing"}));
        assert_eq!(resp.usage.total_tokens, 3);
        assert_eq!(resp.model.as_deref(), Some("m1"));
    }

    #[test]
    fn error_kind_mapping_matches_status_table() {
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Server);
    }

    #[tokio::test]
    async fn drive_stream_aggregates_an_arbitrary_byte_stream() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let stream = futures::stream::iter(chunks);
        let mut recorder = Recorder { text: String::new(), completes: 0, errors: 0 };
        let cancel = Arc::new(AtomicBool::new(false));

        let response = drive_stream(stream, cancel, &mut recorder).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(recorder.text, "hello");
        assert_eq!(recorder.completes, 1);
    }

    #[tokio::test]
    async fn drive_stream_honors_cancellation() {
        let cancel = Arc::new(AtomicBool::new(true));
        let stream = futures::stream::iter(Vec::<Result<Vec<u8>, std::io::Error>>::new());
        let mut recorder = Recorder { text: String::new(), completes: 0, errors: 0 };
        let result = drive_stream(stream, cancel, &mut recorder).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Unknown);
        assert_eq!(recorder.errors, 1);
    }
}
