//! Durable inbox/outbox behavior across restarts and competing nodes.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use common::{config, eventually};
use courier_core::envelope::{EnvelopeStatus, OwnerId};
use courier_core::persistence::{
    DeadLetterEntry, EnvelopeStore, InMemoryEnvelopeStore, PersistedCounts, StoreSession,
};
use courier_core::routing::Endpoint;
use courier_core::runtime::{MessageEventKind, RecordingMessageLogger};
use courier_core::transports::{MemoryBroker, MemoryTransport};
use courier_core::types::{BoxError, EnvelopeId, NodeId};
use courier_core::{BusBuilder, Config, Envelope, Error, Message, Result, Runtime};

#[derive(Debug, Serialize, Deserialize)]
struct Work {
    n: u32,
}

impl Message for Work {}

#[derive(Debug, Serialize, Deserialize)]
struct Audit {
    n: u32,
}

impl Message for Audit {}

/// Store whose direct `store_incoming` refuses one message type. Session
/// writes go through untouched.
#[derive(Debug, Clone)]
struct RefusingStore {
    inner: InMemoryEnvelopeStore,
    refused_type: String,
}

#[async_trait]
impl EnvelopeStore for RefusingStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<()> {
        if envelope.message_type == self.refused_type {
            return Err(Error::persistence("incoming table unavailable"));
        }
        self.inner.store_incoming(envelope).await
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner: OwnerId) -> Result<()> {
        self.inner.store_outgoing(envelope, owner).await
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<()> {
        self.inner.schedule_job(envelope).await
    }

    async fn mark_handled(&self, id: EnvelopeId, keep_until: DateTime<Utc>) -> Result<()> {
        self.inner.mark_handled(id, keep_until).await
    }

    async fn increment_attempts(&self, id: EnvelopeId, attempts: u32) -> Result<()> {
        self.inner.increment_attempts(id, attempts).await
    }

    async fn delete_incoming(&self, id: EnvelopeId) -> Result<()> {
        self.inner.delete_incoming(id).await
    }

    async fn delete_outgoing(&self, ids: &[EnvelopeId]) -> Result<()> {
        self.inner.delete_outgoing(ids).await
    }

    async fn delete_expired_handled(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_expired_handled(cutoff).await
    }

    async fn move_to_dead_letter(&self, envelope: &Envelope, error: &str) -> Result<()> {
        self.inner.move_to_dead_letter(envelope, error).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.inner.dead_letters().await
    }

    async fn replay_dead_letter(&self, id: EnvelopeId) -> Result<()> {
        self.inner.replay_dead_letter(id).await
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts> {
        self.inner.fetch_counts().await
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>> {
        self.inner.all_incoming().await
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>> {
        self.inner.all_outgoing().await
    }

    async fn claim_incoming(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        self.inner.claim_incoming(id, node).await
    }

    async fn claim_outgoing(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        self.inner.claim_outgoing(id, node).await
    }

    async fn claim_scheduled(&self, id: EnvelopeId, node: &NodeId) -> Result<bool> {
        self.inner.claim_scheduled(id, node).await
    }

    async fn release_ownership(&self, ids: &[EnvelopeId]) -> Result<()> {
        self.inner.release_ownership(ids).await
    }

    async fn load_scheduled_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Envelope>> {
        self.inner.load_scheduled_due(now, limit).await
    }

    async fn load_unowned_incoming(&self, limit: usize) -> Result<Vec<Envelope>> {
        self.inner.load_unowned_incoming(limit).await
    }

    async fn load_unowned_outgoing(&self, limit: usize) -> Result<Vec<Envelope>> {
        self.inner.load_unowned_outgoing(limit).await
    }

    async fn record_heartbeat(&self, node: &NodeId, now: DateTime<Utc>) -> Result<()> {
        self.inner.record_heartbeat(node, now).await
    }

    async fn dormant_nodes(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeId>> {
        self.inner.dormant_nodes(cutoff).await
    }

    async fn reassign_dormant_node(&self, node: &NodeId) -> Result<usize> {
        self.inner.reassign_dormant_node(node).await
    }

    async fn rebuild(&self) -> Result<()> {
        self.inner.rebuild().await
    }

    fn session(&self) -> Box<dyn StoreSession> {
        self.inner.session()
    }
}

async fn worker(
    config: Config,
    store: &InMemoryEnvelopeStore,
    handled: &Arc<AtomicUsize>,
) -> Runtime {
    let counter = handled.clone();
    BusBuilder::new(config)
        .store(Arc::new(store.clone()))
        .endpoint(Endpoint::local_queue("work").unwrap().durable())
        .route::<Work>("local://work")
        .handle::<Work, _, _>(move |_work: Work, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
        .start()
        .await
        .unwrap()
}

fn orphan(owner: OwnerId) -> Envelope {
    let mut envelope = Envelope::for_message(&Work { n: 1 })
        .unwrap()
        .with_destination(Url::parse("local://work").unwrap());
    envelope.status = EnvelopeStatus::Incoming;
    envelope.owner_id = owner;
    envelope
}

#[tokio::test]
async fn test_durable_local_queue_marks_envelope_handled() {
    let store = InMemoryEnvelopeStore::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;

    runtime.publish(&Work { n: 1 }).await.unwrap();
    eventually("envelope handled", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 1 }
    })
    .await;

    let counts = runtime.persisted_counts().await.unwrap();
    assert_eq!(counts.incoming, 0);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_enlisted_handler_state_follows_the_commit() {
    let store = InMemoryEnvelopeStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let ledger = Arc::new(Mutex::new(Vec::<u32>::new()));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let (c, l, r, s) = (calls.clone(), ledger.clone(), rolled_back.clone(), store.clone());
    let runtime = BusBuilder::new(config("worker"))
        .store(Arc::new(store.clone()))
        .endpoint(Endpoint::local_queue("work").unwrap().durable())
        .route::<Work>("local://work")
        .handle_with::<Work, _, _>(
            move |work: Work, ctx| {
                let (calls, ledger, rolled_back, store) = (c.clone(), l.clone(), r.clone(), s.clone());
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // The handled-mark commit of this attempt fails.
                        store.inject_failures(1).await;
                    }
                    ctx.on_commit(move || ledger.lock().unwrap().push(work.n));
                    ctx.on_rollback(move || {
                        rolled_back.fetch_add(1, Ordering::SeqCst);
                    });
                    Ok::<(), BoxError>(())
                }
            },
            |rules| {
                rules.on::<Error>().retry_now(1);
            },
        )
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 7 }).await.unwrap();
    eventually("second attempt committed", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 1 }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(*ledger.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn test_durable_local_cascade_commits_with_the_handled_mark() {
    let inner = InMemoryEnvelopeStore::new();
    let store = RefusingStore {
        inner: inner.clone(),
        refused_type: Audit::message_type(),
    };
    let audited = Arc::new(AtomicUsize::new(0));
    let counter = audited.clone();
    let runtime = BusBuilder::new(config("worker"))
        .store(Arc::new(store))
        .endpoint(Endpoint::local_queue("work").unwrap().durable())
        .endpoint(Endpoint::local_queue("audit").unwrap().durable())
        .route::<Work>("local://work")
        .route::<Audit>("local://audit")
        .handle::<Work, _, _>(|work: Work, ctx| async move {
            ctx.publish(&Audit { n: work.n })?;
            Ok::<(), BoxError>(())
        })
        .handle::<Audit, _, _>(move |_audit: Audit, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 4 }).await.unwrap();
    eventually("work and its audit both handled", || {
        let inner = inner.clone();
        async move { inner.fetch_counts().await.unwrap().handled == 2 }
    })
    .await;
    assert_eq!(audited.load(Ordering::SeqCst), 1);
    assert!(runtime.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduled_cascade_is_staged_as_a_job() {
    let store = InMemoryEnvelopeStore::new();
    let runtime = BusBuilder::new(config("worker"))
        .store(Arc::new(store.clone()))
        .endpoint(Endpoint::local_queue("work").unwrap().durable())
        .endpoint(Endpoint::local_queue("audit").unwrap().durable())
        .route::<Work>("local://work")
        .route::<Audit>("local://audit")
        .handle::<Work, _, _>(|work: Work, ctx| async move {
            ctx.schedule(&Audit { n: work.n }, Utc::now() + chrono::Duration::hours(1))?;
            Ok::<(), BoxError>(())
        })
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 5 }).await.unwrap();
    eventually("work handled", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 1 }
    })
    .await;
    let counts = runtime.persisted_counts().await.unwrap();
    assert_eq!(counts.scheduled, 1);
    let job = store
        .all_incoming()
        .await
        .unwrap()
        .into_iter()
        .find(|envelope| envelope.status == EnvelopeStatus::Scheduled)
        .unwrap();
    assert_eq!(job.destination, Some(Url::parse("local://audit").unwrap()));
    assert!(job.owner_id.is_any_node());
}

#[tokio::test]
async fn test_unowned_incoming_is_recovered_after_restart() {
    let store = InMemoryEnvelopeStore::new();
    store.store_incoming(&orphan(OwnerId::AnyNode)).await.unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;
    let stats = runtime.recover_now().await;
    assert_eq!(stats.incoming_recovered, 1);

    eventually("recovered envelope handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
    eventually("recovered envelope marked handled", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_dormant_node_envelopes_are_reassigned() {
    let store = InMemoryEnvelopeStore::new();
    let dead = NodeId::from_string("dead-node".to_string()).unwrap();
    store
        .record_heartbeat(&dead, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    store
        .store_incoming(&orphan(OwnerId::Node(dead.clone())))
        .await
        .unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;
    let stats = runtime.recover_now().await;
    assert_eq!(stats.reassigned, 1);
    assert_eq!(stats.incoming_recovered, 1);

    eventually("reassigned envelope handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(store
        .dormant_nodes(Utc::now())
        .await
        .unwrap()
        .iter()
        .all(|node| node != &dead));
}

#[tokio::test]
async fn test_restarted_node_recovers_its_own_envelopes() {
    let store = InMemoryEnvelopeStore::new();
    let previous = NodeId::from_string("worker-node".to_string()).unwrap();
    store
        .record_heartbeat(&previous, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    store
        .store_incoming(&orphan(OwnerId::Node(previous)))
        .await
        .unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;
    assert_eq!(runtime.node_id().as_str(), "worker-node");
    let stats = runtime.recover_now().await;
    assert_eq!(stats.incoming_recovered, 1);

    eventually("envelope from the previous run handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_competing_nodes_handle_an_envelope_once() {
    let store = InMemoryEnvelopeStore::new();
    for _ in 0..5 {
        store.store_incoming(&orphan(OwnerId::AnyNode)).await.unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let first = worker(config("first"), &store, &handled).await;
    let second = worker(config("second"), &store, &handled).await;

    let (a, b) = tokio::join!(first.recover_now(), second.recover_now());
    assert_eq!(a.incoming_recovered + b.incoming_recovered, 5);

    eventually("every envelope handled", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 5 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handled.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_scheduled_message_is_released_when_due() {
    let store = InMemoryEnvelopeStore::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;

    runtime
        .schedule(&Work { n: 9 }, Utc::now() + chrono::Duration::milliseconds(100))
        .await
        .unwrap();
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 1);

    let early = runtime.recover_now().await;
    assert_eq!(early.scheduled_released, 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let due = runtime.recover_now().await;
    assert_eq!(due.scheduled_released, 1);

    eventually("scheduled envelope handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert_eq!(store.fetch_counts().await.unwrap().scheduled, 0);
}

#[tokio::test]
async fn test_expired_handled_envelopes_are_deleted() {
    let store = InMemoryEnvelopeStore::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let mut config = config("worker");
    config.durability.keep_after_message_handling = Duration::ZERO;
    let runtime = worker(config, &store, &handled).await;

    runtime.publish(&Work { n: 1 }).await.unwrap();
    runtime.publish(&Work { n: 2 }).await.unwrap();
    eventually("both handled", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().handled == 2 }
    })
    .await;

    let stats = runtime.recover_now().await;
    assert_eq!(stats.expired_deleted, 2);
    assert_eq!(store.fetch_counts().await.unwrap().handled, 0);
}

#[tokio::test]
async fn test_shutdown_releases_owned_envelopes() {
    let store = InMemoryEnvelopeStore::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;
    let node = runtime.node_id().clone();
    store.store_incoming(&orphan(OwnerId::Node(node))).await.unwrap();

    runtime.shutdown().await.unwrap();
    let unowned = store.load_unowned_incoming(10).await.unwrap();
    assert_eq!(unowned.len(), 1);
}

#[tokio::test]
async fn test_shutdown_persists_unsent_buffered_envelopes() {
    let broker = MemoryBroker::new();
    broker.set_offline(true);
    let store = InMemoryEnvelopeStore::new();
    let mut config = config("orders");
    config.messaging.failures_before_latch = 1;
    let runtime = BusBuilder::new(config)
        .store(Arc::new(store.clone()))
        .transport(MemoryTransport::new(broker.clone()))
        .route::<Work>("memory://billing")
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 1 }).await.unwrap();
    runtime.publish(&Work { n: 2 }).await.unwrap();
    let billing = Url::parse("memory://billing").unwrap();
    eventually("sender latched on the offline broker", || {
        let sender = runtime.sending_agent(&billing);
        async move { sender.is_some_and(|sender| sender.is_latched()) }
    })
    .await;

    runtime.shutdown().await.unwrap();
    let unsent = store.load_unowned_outgoing(10).await.unwrap();
    assert_eq!(unsent.len(), 2);
    assert!(unsent
        .iter()
        .all(|envelope| envelope.destination.as_ref() == Some(&billing)));
    assert!(runtime.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_letter_can_be_replayed() {
    let store = InMemoryEnvelopeStore::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let runtime = worker(config("worker"), &store, &handled).await;

    let envelope = orphan(OwnerId::AnyNode);
    store
        .move_to_dead_letter(&envelope, "poisoned")
        .await
        .unwrap();
    runtime.replay_dead_letter(envelope.id).await.unwrap();
    assert!(runtime.dead_letters().await.unwrap().is_empty());

    runtime.recover_now().await;
    eventually("replayed envelope handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_send_failures_requeue_then_dead_letter() {
    let broker = MemoryBroker::new();
    broker.set_offline(true);
    let logger = Arc::new(RecordingMessageLogger::new());
    let mut config = config("orders");
    config.messaging.failures_before_latch = 10;
    let runtime = BusBuilder::new(config)
        .transport(MemoryTransport::new(broker.clone()))
        .message_logger(logger.clone())
        .route::<Work>("memory://billing")
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 1 }).await.unwrap();
    eventually("unsendable envelope dead-lettered", || {
        let runtime = runtime.clone();
        async move { runtime.dead_letters().await.unwrap().len() == 1 }
    })
    .await;

    assert_eq!(logger.count(MessageEventKind::MovedToErrorQueue), 1);
    assert_eq!(logger.count(MessageEventKind::Sent), 0);
    assert_eq!(broker.pending("billing"), 0);
}

#[tokio::test]
async fn test_durable_outbox_row_is_deleted_once_sent() {
    let broker = MemoryBroker::new();
    let store = InMemoryEnvelopeStore::new();
    let runtime = BusBuilder::new(config("orders"))
        .store(Arc::new(store.clone()))
        .transport(MemoryTransport::new(broker.clone()))
        .use_durable_outbox_on_all_sending_endpoints()
        .route::<Work>("memory://billing")
        .start()
        .await
        .unwrap();

    runtime.publish(&Work { n: 1 }).await.unwrap();
    eventually("message reached the broker", || {
        let broker = broker.clone();
        async move { broker.pending("billing") == 1 }
    })
    .await;
    eventually("outgoing row deleted", || {
        let store = store.clone();
        async move { store.fetch_counts().await.unwrap().outgoing == 0 }
    })
    .await;
}
