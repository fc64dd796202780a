//! Request/reply correlation.
//!
//! Waiters are keyed by conversation id. A reply completes the waiter once;
//! the caller removes its waiter on timeout so late replies are dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::envelope::Envelope;
use crate::types::ConversationId;

/// Pending request/reply waiters.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    waiters: Mutex<HashMap<ConversationId, oneshot::Sender<Envelope>>>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `conversation_id`.
    pub fn register(&self, conversation_id: ConversationId) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(conversation_id, tx);
        rx
    }

    /// Hand a reply to its waiter. Returns false when nobody is waiting.
    pub fn complete(&self, envelope: Envelope) -> bool {
        let Some(conversation_id) = envelope.conversation_id else {
            return false;
        };
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&conversation_id);
        match waiter {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, conversation_id: &ConversationId) {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(conversation_id);
    }

    pub fn pending(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
