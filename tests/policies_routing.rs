//! Endpoint policies and conventional routing as seen through a built node.

mod common;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

use common::{config, eventually};
use courier_core::envelope::EndpointMode;
use courier_core::routing::{ConventionalRouting, Endpoint, LambdaEndpointPolicy};
use courier_core::runtime::{MessageEventKind, RecordingMessageLogger};
use courier_core::transports::{MemoryBroker, MemoryTransport, StubTransport};
use courier_core::types::BoxError;
use courier_core::{BusBuilder, Message};

#[derive(Debug, Serialize, Deserialize)]
struct Invoice {
    total: u64,
}

impl Message for Invoice {
    fn message_type() -> String {
        "billing.Invoice".to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat;

impl Message for Heartbeat {
    fn message_type() -> String {
        "internal.Heartbeat".to_string()
    }
}

fn uri(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

#[tokio::test]
async fn test_local_convention_creates_queue_per_handled_type() {
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let runtime = BusBuilder::new(config("billing"))
        .conventional_routing(ConventionalRouting::local())
        .handle::<Invoice, _, _>(move |_invoice: Invoice, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
        .start()
        .await
        .unwrap();

    let routes = runtime.router().resolve(&Invoice::message_type()).unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].uri, uri("local://billing.invoice"));
    assert!(routes[0].is_listener);

    runtime.publish(&Invoice { total: 12 }).await.unwrap();
    eventually("invoice handled", || {
        let handled = handled.clone();
        async move { handled.load(Ordering::SeqCst) == 1 }
    })
    .await;
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transport_convention_respects_exclusions() {
    let stub = StubTransport::new();
    let logger = Arc::new(RecordingMessageLogger::new());
    let runtime = BusBuilder::new(config("billing"))
        .transport(stub.clone())
        .message_logger(logger.clone())
        .conventional_routing(
            ConventionalRouting::transport("stub").exclude_types(|t| t.starts_with("internal.")),
        )
        .start()
        .await
        .unwrap();

    runtime.publish(&Invoice { total: 3 }).await.unwrap();
    eventually("invoice sent to conventional queue", || {
        let stub = stub.clone();
        async move { stub.sent_to(&uri("stub://billing.invoice")).len() == 1 }
    })
    .await;

    assert!(runtime
        .router()
        .resolve(&Heartbeat::message_type())
        .unwrap()
        .is_empty());
    runtime.publish(&Heartbeat).await.unwrap();
    assert_eq!(logger.count(MessageEventKind::NoRoutes), 1);
}

#[tokio::test]
async fn test_durable_inbox_policy_only_touches_listeners() {
    let broker = MemoryBroker::new();
    let runtime = BusBuilder::new(config("billing"))
        .transport(MemoryTransport::new(broker))
        .endpoint(Endpoint::parse("memory://billing").unwrap().listener())
        .route::<Invoice>("memory://ledger")
        .use_durable_inbox_on_all_listeners()
        .build()
        .unwrap();

    let router = runtime.router();
    let inbox = router.find(&uri("memory://billing")).unwrap();
    assert_eq!(inbox.mode, EndpointMode::Durable);
    let outbound = router.find(&uri("memory://ledger")).unwrap();
    assert_eq!(outbound.mode, EndpointMode::BufferedInMemory);
    assert!(router.in_durable_scope(&inbox.uri));
}

#[tokio::test]
async fn test_inline_policy_sends_in_the_caller() {
    let stub = StubTransport::new();
    let runtime = BusBuilder::new(config("billing"))
        .transport(stub.clone())
        .route::<Invoice>("stub://ledger")
        .inline_listeners_and_senders()
        .build()
        .unwrap();

    assert_eq!(
        runtime.router().find(&uri("stub://ledger")).unwrap().mode,
        EndpointMode::Inline
    );
    runtime.send(&Invoice { total: 5 }).await.unwrap();
    assert_eq!(stub.sent().len(), 1);
}

#[tokio::test]
async fn test_lambda_policy_applies_to_application_endpoints() {
    let runtime = BusBuilder::new(config("billing"))
        .endpoint(Endpoint::local_queue("ledger").unwrap())
        .policy(LambdaEndpointPolicy::new("sequential", |endpoint: &mut Endpoint| {
            endpoint.max_parallelism = 1;
        }))
        .build()
        .unwrap();

    let ledger = runtime.router().find(&uri("local://ledger")).unwrap();
    assert_eq!(ledger.max_parallelism, 1);
    let replies = runtime.router().find(runtime.reply_uri()).unwrap();
    assert_eq!(replies.max_parallelism, 10);
}
