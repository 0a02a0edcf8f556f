// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Task routing, response caching, and response post-processing for the
//! orchestration pipeline.

mod cache;
mod response_handler;
mod router;

pub use cache::{CacheEntry, CacheStats, CleanupHandle, ResponseCache};
pub use response_handler::{HandledResponse, ResponseHandler, ValidationError};
pub use router::{ModelPreference, RouteRequest, RoutingDecision, RoutingHistoryEntry, TaskRouter};
