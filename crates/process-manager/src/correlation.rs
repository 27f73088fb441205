//! Correlation table: pairs outstanding requests with their eventual replies.
//!
//! Exclusively owned by one master instance. Replies are matched strictly by
//! correlation id, never by arrival order, so concurrent round trips resolve
//! independently.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;

/// How a pending request ended.
#[derive(Debug, PartialEq)]
pub enum ReplyOutcome {
    /// The matching Reply envelope's payload (`None` = "no value").
    Reply(Option<Value>),
    /// The channel stopped or crashed before a reply arrived.
    Lost,
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: HashMap<CorrelationId, oneshot::Sender<ReplyOutcome>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and store the pending entry.
    pub fn register(&mut self) -> (CorrelationId, oneshot::Receiver<ReplyOutcome>) {
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    /// Fulfill and remove the entry for `id`. Returns false for a stale or
    /// unknown id; the caller treats the envelope as invalid and drops it.
    pub fn resolve(&mut self, id: CorrelationId, payload: Option<Value>) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => {
                if tx.send(ReplyOutcome::Reply(payload)).is_err() {
                    tracing::warn!(%id, "reply receiver dropped before resolution");
                }
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it (send-side rollback).
    pub fn remove(&mut self, id: CorrelationId) {
        self.pending.remove(&id);
    }

    /// Force-resolve every remaining entry as lost; returns the count.
    pub fn drain_as_lost(&mut self) -> usize {
        let count = self.pending.len();
        for (id, tx) in self.pending.drain() {
            tracing::debug!(%id, "resolving pending request as lost");
            let _ = tx.send(ReplyOutcome::Lost);
        }
        count
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
