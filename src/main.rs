//! Courier demo node - main entry point.
//!
//! Starts a node over the in-memory store with one durable local queue,
//! publishes a batch of demo messages, waits for them to be handled and
//! prints the persisted counts as JSON.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::routing::Endpoint;
use courier_core::{BusBuilder, Config, Message};

#[derive(Debug, Parser)]
#[command(name = "courier-node", about = "Run a demo Courier node")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Number of demo messages to publish.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Maximum time to wait for the batch to be handled.
    #[arg(long, default_value = "5s", value_parser = humantime_serde::re::humantime::parse_duration)]
    wait: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct DemoPing {
    sequence: usize,
}

impl Message for DemoPing {
    fn message_type() -> String {
        "courier.demo.ping".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    courier_core::observability::init_tracing_with(&config.observability);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let runtime = BusBuilder::new(config)
        .endpoint(Endpoint::local_queue("demo")?.durable())
        .route::<DemoPing>("local://demo")
        .handle::<DemoPing, _, _>(move |ping, _ctx| {
            let counter = counter.clone();
            async move {
                tracing::debug!("demo_ping_handled: sequence={}", ping.sequence);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .start()
        .await?;

    tracing::info!(
        "courier_node_started: node={}, messages={}",
        runtime.node_id(),
        args.messages
    );

    for sequence in 0..args.messages {
        runtime.publish(&DemoPing { sequence }).await?;
    }

    let deadline = tokio::time::Instant::now() + args.wait;
    while handled.load(Ordering::SeqCst) < args.messages && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let counts = runtime.persisted_counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);

    runtime.shutdown().await?;
    Ok(())
}
