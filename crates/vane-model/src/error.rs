// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Closed error taxonomy shared by every fallible operation in the
//! orchestration pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse error classification used for routing retry/backoff policy and for
/// mapping HTTP status codes onto a stable vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    InvalidRequest,
    Server,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Map an HTTP status code onto an [`ErrorKind`] per the wire contract.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 401 | 403 => ErrorKind::InvalidRequest,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }
}

/// A structured, redaction-aware error carried through the pipeline.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?} ({code}): {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    /// HTTP status code, or a synthetic code for non-HTTP failures (0).
    pub code: u16,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, code: u16, message: impl Into<String>, now_ms: u64) -> Self {
        Self { kind, code, message: message.into(), timestamp: now_ms, details: None, context: HashMap::new() }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn network(message: impl Into<String>, now_ms: u64) -> Self {
        Self::new(ErrorKind::Network, 0, message, now_ms)
    }

    pub fn timeout(message: impl Into<String>, now_ms: u64) -> Self {
        Self::new(ErrorKind::Timeout, 408, message, now_ms)
    }

    pub fn invalid_request(message: impl Into<String>, now_ms: u64) -> Self {
        Self::new(ErrorKind::InvalidRequest, 400, message, now_ms)
    }

    pub fn cancelled(now_ms: u64) -> Self {
        Self::new(ErrorKind::Unknown, 0, "request was cancelled", now_ms).with_context("reason", "cancelled")
    }

    pub fn queue_full(now_ms: u64) -> Self {
        Self::new(ErrorKind::Server, 503, "request queue is full", now_ms).with_context("reason", "queue_full")
    }
}
