//! Request/reply between nodes sharing an in-memory broker.

mod common;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use common::config;
use courier_core::routing::Endpoint;
use courier_core::transports::{MemoryBroker, MemoryTransport, StubTransport};
use courier_core::types::BoxError;
use courier_core::{BusBuilder, Error, Message, MessageContext, Runtime};

#[derive(Debug, Serialize, Deserialize)]
struct Charge {
    amount: u64,
}

impl Message for Charge {}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Receipt {
    amount: u64,
    approved: bool,
}

impl Message for Receipt {}

#[derive(Debug, Serialize, Deserialize)]
struct Refund {
    amount: u64,
}

impl Message for Refund {}

#[derive(Debug, Serialize, Deserialize)]
struct Lookup {
    key: String,
}

impl Message for Lookup {}

#[derive(Debug, Serialize, Deserialize)]
struct Audit {
    note: String,
}

impl Message for Audit {}

/// Quote as the requester sees it: it gives up after 200ms.
#[derive(Debug, Serialize, Deserialize)]
struct Quote {
    amount: u64,
}

impl Message for Quote {
    fn message_type() -> String {
        "billing.Quote".to_string()
    }

    fn execution_timeout() -> Option<Duration> {
        Some(Duration::from_millis(200))
    }
}

/// The same quote as the billing handler sees it, with no deadline of its own.
#[derive(Debug, Serialize, Deserialize)]
struct PricedQuote {
    amount: u64,
}

impl Message for PricedQuote {
    fn message_type() -> String {
        "billing.Quote".to_string()
    }
}

async fn billing_node(broker: &MemoryBroker) -> Runtime {
    BusBuilder::new(config("billing"))
        .transport(MemoryTransport::new(broker.clone()))
        .reply_uri("memory://billing-replies")
        .endpoint(Endpoint::parse("memory://billing").unwrap().listener())
        .handle::<Charge, _, _>(|charge: Charge, ctx: MessageContext| async move {
            ctx.respond(&Receipt {
                amount: charge.amount,
                approved: true,
            })?;
            Ok::<(), BoxError>(())
        })
        .handle::<Refund, _, _>(|_refund: Refund, _ctx| async move {
            Err::<(), BoxError>("card declined".into())
        })
        .handle::<Lookup, _, _>(|_lookup: Lookup, _ctx| async move { Ok::<(), BoxError>(()) })
        .handle::<Audit, _, _>(|_audit: Audit, _ctx| async move { Ok::<(), BoxError>(()) })
        .start()
        .await
        .unwrap()
}

async fn orders_node(broker: &MemoryBroker) -> Runtime {
    BusBuilder::new(config("orders"))
        .transport(MemoryTransport::new(broker.clone()))
        .reply_uri("memory://orders-replies")
        .route::<Charge>("memory://billing")
        .route::<Refund>("memory://billing")
        .route::<Lookup>("memory://billing")
        .route::<Audit>("memory://billing")
        .start()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_returns_typed_response() {
    let broker = MemoryBroker::new();
    let billing = billing_node(&broker).await;
    let orders = orders_node(&broker).await;

    let receipt: Receipt = orders
        .request::<Charge, Receipt>(&Charge { amount: 42 })
        .await
        .unwrap();
    assert_eq!(
        receipt,
        Receipt {
            amount: 42,
            approved: true
        }
    );

    orders.shutdown().await.unwrap();
    billing.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_failure_surfaces_as_request_failed() {
    let broker = MemoryBroker::new();
    let billing = billing_node(&broker).await;
    let orders = orders_node(&broker).await;

    let error = orders
        .request::<Refund, Receipt>(&Refund { amount: 5 })
        .await
        .unwrap_err();
    match error {
        Error::RequestFailed(message) => {
            assert!(message.contains("card declined"), "{}", message);
            assert!(message.contains("Error Queue"), "{}", message);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let dead = billing.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].envelope.message_type, Refund::message_type());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_response_fails_request() {
    let broker = MemoryBroker::new();
    let _billing = billing_node(&broker).await;
    let orders = orders_node(&broker).await;

    let error = orders
        .request::<Lookup, Receipt>(&Lookup {
            key: "a".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        format!(
            "Request failed: No response was created for expected response '{}'",
            Receipt::message_type()
        )
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_and_wait_completes_on_acknowledgement() {
    let broker = MemoryBroker::new();
    let _billing = billing_node(&broker).await;
    let orders = orders_node(&broker).await;

    orders
        .send_and_wait(&Audit {
            note: "checked".to_string(),
        })
        .await
        .unwrap();
    orders
        .send_and_wait_to(
            "memory://billing",
            &Audit {
                note: "addressed".to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_request_without_reply_times_out() {
    let broker = MemoryBroker::new();
    let mut config = config("orders");
    config.messaging.default_request_timeout = Duration::from_millis(500);
    let orders = BusBuilder::new(config)
        .transport(MemoryTransport::new(broker.clone()))
        .reply_uri("memory://orders-replies")
        .route::<Charge>("memory://nobody-listens")
        .start()
        .await
        .unwrap();

    let error = orders
        .request::<Charge, Receipt>(&Charge { amount: 1 })
        .await
        .unwrap_err();
    match error {
        Error::Timeout(message) => assert_eq!(
            message,
            format!(
                "Timed out waiting for expected response {}",
                Receipt::message_type()
            )
        ),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_gives_up_at_message_execution_timeout() {
    let broker = MemoryBroker::new();
    let billing = BusBuilder::new(config("billing"))
        .transport(MemoryTransport::new(broker.clone()))
        .reply_uri("memory://billing-replies")
        .endpoint(Endpoint::parse("memory://billing").unwrap().listener())
        .handle::<PricedQuote, _, _>(|quote: PricedQuote, ctx: MessageContext| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ctx.respond(&Receipt {
                amount: quote.amount,
                approved: true,
            })?;
            Ok::<(), BoxError>(())
        })
        .start()
        .await
        .unwrap();
    let orders = BusBuilder::new(config("orders"))
        .transport(MemoryTransport::new(broker.clone()))
        .reply_uri("memory://orders-replies")
        .route::<Quote>("memory://billing")
        .start()
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let error = orders
        .request::<Quote, Receipt>(&Quote { amount: 7 })
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(900));
    match error {
        Error::Timeout(message) => assert_eq!(
            message,
            format!(
                "Timed out waiting for expected response {}",
                Receipt::message_type()
            )
        ),
        other => panic!("unexpected error {:?}", other),
    }

    orders.shutdown().await.unwrap();
    billing.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_request_with_several_routes_is_a_configuration_error() {
    let orders = BusBuilder::new(config("orders"))
        .transport(StubTransport::new())
        .route::<Charge>("stub://a")
        .route::<Charge>("stub://b")
        .build()
        .unwrap();

    let error = orders
        .request::<Charge, Receipt>(&Charge { amount: 1 })
        .await
        .unwrap_err();
    match error {
        Error::Configuration(message) => {
            assert!(message.starts_with("There are multiple subscribing endpoints"));
            assert!(message.contains("stub://a"));
            assert!(message.contains("stub://b"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_request_without_route_is_no_routes() {
    let orders = BusBuilder::new(config("orders")).build().unwrap();
    let error = orders
        .request::<Charge, Receipt>(&Charge { amount: 1 })
        .await
        .unwrap_err();
    assert!(matches!(error, Error::NoRoutes { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_request_reply() {
    let runtime = BusBuilder::new(config("local"))
        .handle::<Charge, _, _>(|charge: Charge, ctx: MessageContext| async move {
            ctx.respond(&Receipt {
                amount: charge.amount * 2,
                approved: false,
            })?;
            Ok::<(), BoxError>(())
        })
        .start()
        .await
        .unwrap();

    let receipt = runtime
        .request::<Charge, Receipt>(&Charge { amount: 21 })
        .await
        .unwrap();
    assert_eq!(receipt.amount, 42);
    assert!(!receipt.approved);
}
