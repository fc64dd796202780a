//! Recording transport (`stub://`).
//!
//! Stubs out external endpoints: every sent envelope is recorded, and when a
//! stub listener exists at the same address the envelope is delivered to it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use url::Url;

use super::{Listener, Receiver, Sender, Transport};
use crate::envelope::Envelope;
use crate::routing::Endpoint;
use crate::types::Result;

pub const STUB_SCHEME: &str = "stub";

#[derive(Default)]
struct StubState {
    sent: Mutex<Vec<Envelope>>,
    listeners: Mutex<HashMap<Url, Weak<StubListener>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records outgoing envelopes. Clones share the record.
#[derive(Clone, Default)]
pub struct StubTransport {
    state: Arc<StubState>,
}

impl std::fmt::Debug for StubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubTransport")
            .field("sent", &lock(&self.state.sent).len())
            .finish()
    }
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope sent so far, in send order.
    pub fn sent(&self) -> Vec<Envelope> {
        lock(&self.state.sent).clone()
    }

    pub fn sent_to(&self, destination: &Url) -> Vec<Envelope> {
        lock(&self.state.sent)
            .iter()
            .filter(|e| e.destination.as_ref() == Some(destination))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.state.sent).clear();
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn scheme(&self) -> &str {
        STUB_SCHEME
    }

    async fn build_sender(&self, endpoint: &Endpoint) -> Result<Arc<dyn Sender>> {
        Ok(Arc::new(StubSender {
            destination: endpoint.uri.clone(),
            state: self.state.clone(),
        }))
    }

    async fn build_listener(
        &self,
        endpoint: &Endpoint,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Listener>> {
        let listener = Arc::new(StubListener {
            address: endpoint.uri.clone(),
            receiver,
            accepting: Mutex::new(false),
        });
        lock(&self.state.listeners).insert(endpoint.uri.clone(), Arc::downgrade(&listener));
        Ok(listener)
    }
}

struct StubSender {
    destination: Url,
    state: Arc<StubState>,
}

#[async_trait]
impl Sender for StubSender {
    fn destination(&self) -> Url {
        self.destination.clone()
    }

    fn supports_native_scheduled_send(&self) -> bool {
        false
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        lock(&self.state.sent).push(envelope.clone());
        let listener = lock(&self.state.listeners)
            .get(&self.destination)
            .and_then(Weak::upgrade);
        if let Some(listener) = listener {
            if *lock(&listener.accepting) {
                let receiver = listener.receiver.clone();
                let channel: Arc<dyn Listener> = listener;
                receiver.received(channel, vec![envelope]).await?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

struct StubListener {
    address: Url,
    receiver: Arc<dyn Receiver>,
    accepting: Mutex<bool>,
}

#[async_trait]
impl Listener for StubListener {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn complete(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    async fn defer(&self, envelope: Envelope) -> Result<()> {
        tracing::debug!("stub_envelope_deferred: id={}", envelope.id);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        *lock(&self.accepting) = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *lock(&self.accepting) = false;
        Ok(())
    }
}
