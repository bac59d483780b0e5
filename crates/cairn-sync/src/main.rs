//! Cairn Node binary
//!
//! Runs an engagement engine over an in-process document store and serves
//! JSON commands on stdin.

use cairn_sync::command::CommandServer;
use cairn_sync::{Engine, EngineConfig, MemoryDocumentStore};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries responses
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cairn_node=info,cairn_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Cairn Node");

    let config = EngineConfig::from_env();
    let documents = Arc::new(
        MemoryDocumentStore::new()
            .with_max_attempts(config.tx_max_attempts)
            .with_feed_capacity(config.event_capacity)
            .with_vote_rules(config.drops_collection.clone()),
    );

    let engine = Arc::new(Engine::open(config, documents.clone())?);
    let server = CommandServer::new(Arc::clone(&engine), documents);

    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;

    engine.shutdown().await;
    tracing::info!("Input closed, shutting down");
    Ok(())
}
