//! Cursor pagination for listing operations.
//!
//! Cursors are opaque base64-url tokens embedding the last sort key and
//! an issue time. They expire (default 10 minutes) so listings never
//! resume from arbitrarily stale positions; an expired cursor surfaces
//! as `stale_cursor` and the client restarts the listing.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

pub const DEFAULT_LIMIT: usize = 1_000;
pub const MAX_LIMIT: usize = 5_000;
pub const CURSOR_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, Deserialize)]
struct CursorToken {
    after_seq: u64,
    issued_at_ms: i64,
}

pub fn encode_cursor(after_seq: u64, now: DateTime<Utc>) -> String {
    let token = CursorToken {
        after_seq,
        issued_at_ms: now.timestamp_millis(),
    };
    let json = serde_json::to_vec(&token).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_cursor(cursor: &str, now: DateTime<Utc>, ttl: Duration) -> QueueResult<u64> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| QueueError::Validation("malformed cursor".into()))?;
    let token: CursorToken = serde_json::from_slice(&bytes)
        .map_err(|_| QueueError::Validation("malformed cursor".into()))?;
    let age_ms = now.timestamp_millis() - token.issued_at_ms;
    if age_ms < 0 || age_ms as u128 > ttl.as_millis() {
        return Err(QueueError::StaleCursor);
    }
    Ok(token.after_seq)
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// One page of results with the continuation token for the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}
