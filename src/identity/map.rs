//! Short-lived login-timestamp -> username map with tolerance lookup.
//!
//! Guarded the way the teacher's rate limiter guards its process table: a
//! `DashMap` with no outer lock object, each operation touching only the
//! shard it needs.

use dashmap::DashMap;

use crate::config::{CORRELATION_TOLERANCE_MS, LOGIN_TTL_MS};

#[derive(Debug, Clone)]
pub struct LoginRecord {
    pub username: String,
    pub timestamp_ms: i64,
}

/// Maps login timestamp (ms) -> login record. Multiple timestamps may
/// coexist for the same username.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: DashMap<i64, LoginRecord>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_login(&self, timestamp_ms: i64, username: String) {
        self.entries.insert(
            timestamp_ms,
            LoginRecord {
                username,
                timestamp_ms,
            },
        );
    }

    /// Removes the first entry whose username matches and whose stored
    /// timestamp is within `±CORRELATION_TOLERANCE_MS` of `ts`. No-op if
    /// none found.
    pub fn register_logout(&self, ts: i64, username: &str) {
        let key = self.entries.iter().find_map(|entry| {
            let record = entry.value();
            if record.username == username
                && (record.timestamp_ms - ts).abs() < CORRELATION_TOLERANCE_MS
            {
                Some(*entry.key())
            } else {
                None
            }
        });

        if let Some(key) = key {
            self.entries.remove(&key);
        }
    }

    /// Returns the username of the entry closest to `conn_ts`, subject to
    /// `|stored - conn_ts| < CORRELATION_TOLERANCE_MS`.
    pub fn find(&self, conn_ts: i64) -> Option<String> {
        self.entries
            .iter()
            .map(|entry| (entry.value().timestamp_ms, entry.value().username.clone()))
            .filter(|(ts, _)| (ts - conn_ts).abs() < CORRELATION_TOLERANCE_MS)
            .min_by_key(|(ts, _)| (ts - conn_ts).abs())
            .map(|(_, user)| user)
    }

    /// Evicts any entry older than `LOGIN_TTL_MS` relative to `now_ms`.
    pub fn cleanup(&self, now_ms: i64) {
        self.entries
            .retain(|_, record| now_ms - record.timestamp_ms <= LOGIN_TTL_MS);
    }

    /// Snapshot of all currently registered logins, for `GET /api/players`.
    pub fn snapshot(&self) -> Vec<(i64, String)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().username.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
