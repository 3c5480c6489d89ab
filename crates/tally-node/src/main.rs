//! Tally node binary.

use std::sync::Arc;

use clap::Parser;
use tally_node::{
    create_router, AppState, Args, BootstrapOrchestrator, GossipMembership, NodeContext,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_node=info,tally_raft=info,openraft=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node_id,
        http = %config.http_addr,
        raft = %config.raft_addr,
        gossip = %config.gossip_addr,
        data_dir = %config.data_dir.display(),
        "starting tally node"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let membership = GossipMembership::bind(
        config.node_id.clone(),
        &config.gossip_listen,
        Some(&config.gossip_addr),
    )
    .await?;
    membership.start(&shutdown_tx);

    let http_listen = config.http_listen.clone();
    let context = Arc::new(NodeContext::new(config, membership));
    let http = reqwest::Client::new();

    let listener = tokio::net::TcpListener::bind(&http_listen).await?;
    info!(addr = %http_listen, "admin API listening");

    // Spawn shutdown signal handler
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        info!("received shutdown signal");
        let _ = signal_tx.send(());
    });

    let orchestrator = BootstrapOrchestrator::new(context.clone(), http.clone());
    let bootstrap_shutdown = shutdown_tx.subscribe();
    let bootstrap_tx = shutdown_tx.clone();
    let bootstrap = tokio::spawn(async move {
        let result = orchestrator.run(bootstrap_shutdown).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "bootstrap failed");
            let _ = bootstrap_tx.send(());
        }
        result
    });

    let app = create_router(AppState::new(context.clone(), http));
    let mut server_shutdown = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.recv().await;
        })
        .await?;

    context.shutdown().await?;
    bootstrap.await??;

    info!("node shutdown complete");
    Ok(())
}
