//! In-process message broker transport (`memory://`).
//!
//! Stands in for a networked broker: several runtimes in one process share
//! a [`MemoryBroker`] and exchange [`MemoryMessage`]s (headers plus body)
//! through named queues. Competing listeners on one queue each take the
//! next message. Messages published while nobody listens stay queued.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{headers, HeaderMapper, Listener, Receiver, Sender, Transport};
use crate::envelope::Envelope;
use crate::routing::Endpoint;
use crate::types::{Error, Result};

pub const MEMORY_SCHEME: &str = "memory";

/// Transport-level message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryMessage {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Header mapping onto [`MemoryMessage::headers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryHeaderMapper;

impl HeaderMapper<MemoryMessage> for MemoryHeaderMapper {
    fn write_outgoing_header(&self, message: &mut MemoryMessage, key: &str, value: &str) {
        message.headers.insert(key.to_string(), value.to_string());
    }

    fn try_read_incoming_header(&self, message: &MemoryMessage, key: &str) -> Option<String> {
        message.headers.get(key).cloned()
    }

    fn read_custom_headers(&self, message: &MemoryMessage) -> HashMap<String, String> {
        message
            .headers
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(headers::CUSTOM_PREFIX)
                    .map(|key| (key.to_string(), value.clone()))
            })
            .collect()
    }
}

// =============================================================================
// Broker
// =============================================================================

#[derive(Debug, Default)]
struct BrokerQueue {
    messages: VecDeque<MemoryMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, BrokerQueue>>,
    offline: AtomicBool,
}

/// Shared in-process broker. Clones share the queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, BrokerQueue>> {
        self.state
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate the broker becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
        tracing::info!("memory_broker_availability: offline={}", offline);
    }

    pub fn is_offline(&self) -> bool {
        self.state.offline.load(Ordering::SeqCst)
    }

    pub fn publish(&self, queue: &str, message: MemoryMessage) -> Result<()> {
        if self.is_offline() {
            return Err(Error::transport(format!(
                "memory broker is offline, cannot publish to '{}'",
                queue
            )));
        }
        let mut queues = self.queues();
        let entry = queues.entry(queue.to_string()).or_default();
        entry.messages.push_back(message);
        entry.notify.notify_one();
        Ok(())
    }

    /// Messages waiting in `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.queues()
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Wait for the next message of `queue`.
    async fn next(&self, queue: &str) -> MemoryMessage {
        loop {
            let notify = {
                let mut queues = self.queues();
                let entry = queues.entry(queue.to_string()).or_default();
                if let Some(message) = entry.messages.pop_front() {
                    if !entry.messages.is_empty() {
                        entry.notify.notify_one();
                    }
                    return message;
                }
                entry.notify.clone()
            };
            notify.notified().await;
        }
    }
}

/// Queue name of an endpoint: host plus path.
fn queue_name(uri: &Url) -> String {
    let host = uri.host_str().unwrap_or_default();
    let path = uri.path().trim_matches('/');
    if path.is_empty() {
        host.to_string()
    } else {
        format!("{}/{}", host, path)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// `memory://` transport over a shared broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    mapper: MemoryHeaderMapper,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            mapper: MemoryHeaderMapper,
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    async fn build_sender(&self, endpoint: &Endpoint) -> Result<Arc<dyn Sender>> {
        Ok(Arc::new(MemorySender {
            destination: endpoint.uri.clone(),
            queue: queue_name(&endpoint.uri),
            broker: self.broker.clone(),
            mapper: self.mapper,
        }))
    }

    async fn build_listener(
        &self,
        endpoint: &Endpoint,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Listener>> {
        let listener = MemoryListener::new(
            endpoint.uri.clone(),
            self.broker.clone(),
            self.mapper,
            receiver,
        );
        listener.spawn_pump()?;
        Ok(listener)
    }
}

#[derive(Debug)]
struct MemorySender {
    destination: Url,
    queue: String,
    broker: MemoryBroker,
    mapper: MemoryHeaderMapper,
}

#[async_trait]
impl Sender for MemorySender {
    fn destination(&self) -> Url {
        self.destination.clone()
    }

    fn supports_native_scheduled_send(&self) -> bool {
        false
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let mut message = MemoryMessage {
            headers: HashMap::new(),
            body: envelope.data.clone(),
        };
        self.mapper.map_envelope_to_outgoing(&envelope, &mut message);
        self.broker.publish(&self.queue, message)
    }

    async fn ping(&self) -> bool {
        !self.broker.is_offline()
    }
}

struct MemoryListener {
    address: Url,
    queue: String,
    broker: MemoryBroker,
    mapper: MemoryHeaderMapper,
    receiver: Arc<dyn Receiver>,
    running: watch::Sender<bool>,
    cancel: CancellationToken,
    me: Weak<MemoryListener>,
}

impl MemoryListener {
    fn new(
        address: Url,
        broker: MemoryBroker,
        mapper: MemoryHeaderMapper,
        receiver: Arc<dyn Receiver>,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            queue: queue_name(&address),
            address,
            broker,
            mapper,
            receiver,
            running,
            cancel: CancellationToken::new(),
            me: me.clone(),
        })
    }

    fn spawn_pump(&self) -> Result<()> {
        let listener = self
            .me
            .upgrade()
            .ok_or_else(|| Error::internal("memory listener dropped before start"))?;
        tokio::spawn(listener.pump());
        Ok(())
    }

    async fn pump(self: Arc<Self>) {
        let mut running = self.running.subscribe();
        loop {
            let resumed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = running.wait_for(|running| *running) => result.is_ok(),
            };
            if !resumed {
                break;
            }

            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = running.wait_for(|running| !*running) => continue,
                message = self.broker.next(&self.queue) => message,
            };

            let mut envelope = match self
                .mapper
                .map_incoming_to_envelope(&message, message.body.clone())
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(
                        "memory_message_rejected: queue={}, error={}",
                        self.queue,
                        e
                    );
                    continue;
                }
            };
            envelope.destination = Some(self.address.clone());

            let channel: Arc<dyn Listener> = self.clone();
            if let Err(e) = self.receiver.received(channel, vec![envelope]).await {
                tracing::warn!(
                    "memory_receive_failed: queue={}, error={}",
                    self.queue,
                    e
                );
                if let Err(e) = self.broker.publish(&self.queue, message) {
                    tracing::error!("memory_redelivery_failed: queue={}, error={}", self.queue, e);
                }
            }
        }
        tracing::debug!("memory_listener_stopped: queue={}", self.queue);
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn complete(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    async fn defer(&self, envelope: Envelope) -> Result<()> {
        let mut message = MemoryMessage {
            headers: HashMap::new(),
            body: envelope.data.clone(),
        };
        self.mapper.map_envelope_to_outgoing(&envelope, &mut message);
        self.broker.publish(&self.queue, message)
    }

    async fn start(&self) -> Result<()> {
        self.running.send_replace(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.send_replace(false);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.running.send_replace(false);
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct ChannelReceiver {
        tx: mpsc::UnboundedSender<Envelope>,
    }

    #[async_trait]
    impl Receiver for ChannelReceiver {
        async fn received(
            &self,
            _listener: Arc<dyn Listener>,
            envelopes: Vec<Envelope>,
        ) -> Result<()> {
            for envelope in envelopes {
                let _ = self.tx.send(envelope);
            }
            Ok(())
        }
    }

    #[test]
    fn test_header_mapping_round_trip() {
        let mut envelope = Envelope::new("app.Request1", Bytes::from_static(b"{}"))
            .with_reply_uri(Url::parse("memory://sender-replies").unwrap())
            .with_header("tenant", "blue");
        envelope.conversation_id = Some(ConversationId::new());
        envelope.reply_requested = Some("app.Response1".into());
        envelope.source = Some("Sender".into());
        envelope.attempts = 2;

        let mut message = MemoryMessage::default();
        MemoryHeaderMapper.map_envelope_to_outgoing(&envelope, &mut message);
        let mapped = MemoryHeaderMapper
            .map_incoming_to_envelope(&message, envelope.data.clone())
            .unwrap();

        assert_eq!(mapped.id, envelope.id);
        assert_eq!(mapped.conversation_id, envelope.conversation_id);
        assert_eq!(mapped.reply_uri, envelope.reply_uri);
        assert_eq!(mapped.reply_requested, envelope.reply_requested);
        assert_eq!(mapped.source, envelope.source);
        assert_eq!(mapped.attempts, 2);
        assert_eq!(mapped.headers.get("tenant").map(String::as_str), Some("blue"));
    }

    #[test]
    fn test_incoming_without_message_type_is_rejected() {
        let message = MemoryMessage::default();
        assert!(MemoryHeaderMapper
            .map_incoming_to_envelope(&message, Bytes::new())
            .is_err());
    }

    #[tokio::test]
    async fn test_offline_broker_rejects_sends() {
        let transport = MemoryTransport::new(MemoryBroker::new());
        let endpoint = Endpoint::parse("memory://receiver1").unwrap();
        let sender = transport.build_sender(&endpoint).await.unwrap();

        transport.broker().set_offline(true);
        assert!(!sender.ping().await);
        let err = sender.send(Envelope::new("a", Bytes::new())).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        transport.broker().set_offline(false);
        assert!(sender.ping().await);
        sender.send(Envelope::new("a", Bytes::new())).await.unwrap();
        assert_eq!(transport.broker().pending("receiver1"), 1);
    }

    #[tokio::test]
    async fn test_listener_receives_after_start() {
        let transport = MemoryTransport::new(MemoryBroker::new());
        let endpoint = Endpoint::parse("memory://receiver1").unwrap().listener();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = transport
            .build_listener(&endpoint, Arc::new(ChannelReceiver { tx }))
            .await
            .unwrap();
        let sender = transport.build_sender(&endpoint).await.unwrap();

        let envelope = Envelope::new("app.Request1", Bytes::from_static(b"{}"));
        sender.send(envelope.clone()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        listener.start().await.unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(received.destination, Some(endpoint.uri.clone()));

        listener.dispose().await.unwrap();
    }
}
