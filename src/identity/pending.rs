//! Buffer of observed flows awaiting a login event to attach an identity to.
//!
//! Each entry carries its one-shot callback inline (the "callback-in-entry"
//! shape): whichever path removes the entry first — the per-entry timeout
//! or a matching `process_pending_for_player` call — is the one that fires
//! it. `DashMap::remove` makes that removal atomic, so the two paths never
//! double-fire.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::config::{CORRELATION_TOLERANCE_MS, PENDING_FLOW_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct PendingFlow {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub arrival_ts: i64,
}

fn flow_key(flow: &PendingFlow) -> String {
    format!("{}:{}:{}", flow.ip, flow.port, flow.protocol)
}

struct PendingEntry {
    flow: PendingFlow,
    sender: oneshot::Sender<Option<String>>,
}

/// Flow key -> pending entry, each with an individual 30 s timeout.
#[derive(Default)]
pub struct PendingBuffer {
    entries: DashMap<String, PendingEntry>,
}

impl PendingBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a flow awaiting identity and schedules its timeout.
    /// Returns a receiver that resolves with `Some(username)` if correlated
    /// before expiry, or `None` if the 30 s timeout fires first.
    pub fn insert(self: &Arc<Self>, flow: PendingFlow) -> oneshot::Receiver<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let key = flow_key(&flow);
        self.entries.insert(key.clone(), PendingEntry { flow, sender: tx });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(PENDING_FLOW_TIMEOUT_SECS)).await;
            if let Some((_, entry)) = this.entries.remove(&key) {
                let _ = entry.sender.send(None);
            }
        });

        rx
    }

    /// Correlates `user`'s login at `ts` against buffered flows within
    /// `±CORRELATION_TOLERANCE_MS`. Matching entries are removed atomically
    /// and their callbacks fired with `Some(user)`. Returns
    /// `(matched, unmatched)` where `unmatched` is a snapshot taken after
    /// the removals.
    pub fn process_pending_for_player(
        &self,
        user: &str,
        ts: i64,
    ) -> (Vec<PendingFlow>, Vec<PendingFlow>) {
        let candidate_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| (entry.value().flow.arrival_ts - ts).abs() < CORRELATION_TOLERANCE_MS)
            .map(|entry| entry.key().clone())
            .collect();

        let mut matched = Vec::new();
        for key in candidate_keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                let _ = entry.sender.send(Some(user.to_string()));
                matched.push(entry.flow);
            }
        }

        let unmatched = self
            .entries
            .iter()
            .map(|entry| entry.value().flow.clone())
            .collect();

        (matched, unmatched)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
