// Copyright (c) 2025 Domo, Inc.
// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use axum::{routing::get, Router};
use kube::Client;
use kube_lease_manager::LeaseManagerBuilder;
use kube_valet::config::ValetConfig;
use kube_valet::constants::{
    METRICS_SERVER_BIND_ADDRESS, METRICS_SERVER_PATH, METRICS_SERVER_PORT, TOKIO_WORKER_THREADS,
};
use kube_valet::metrics;
use kube_valet::watcher::ResourceWatcher;
use kube_valet::webhook::WebhookServer;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn main() -> Result<()> {
    // Build the Tokio runtime with named worker threads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(TOKIO_WORKER_THREADS)
        .thread_name("kube-valet")
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Initialize logging.
///
/// Respects `RUST_LOG` for filtering (default: info) and `RUST_LOG_FORMAT`
/// for output format (json or text).
fn initialize_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting kube-valet controller");
}

/// Start the Prometheus metrics HTTP server.
fn start_metrics_server() -> tokio::task::JoinHandle<()> {
    info!(
        bind_address = METRICS_SERVER_BIND_ADDRESS,
        port = METRICS_SERVER_PORT,
        path = METRICS_SERVER_PATH,
        "Starting metrics HTTP server"
    );

    tokio::spawn(async move {
        async fn metrics_handler() -> String {
            match metrics::gather_metrics() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to gather metrics: {e}");
                    String::from("# Error gathering metrics\n")
                }
            }
        }

        let app = Router::new().route(METRICS_SERVER_PATH, get(metrics_handler));

        let bind_addr = format!("{METRICS_SERVER_BIND_ADDRESS}:{METRICS_SERVER_PORT}");
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {bind_addr}: {e}");
                return;
            }
        };

        info!("Metrics server listening on http://{bind_addr}{METRICS_SERVER_PATH}");

        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {e}");
        }
    })
}

async fn async_main() -> Result<()> {
    initialize_logging();

    let config = ValetConfig::load().context("failed to resolve configuration")?;
    debug!(?config, "Configuration resolved");

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let _metrics_handle = start_metrics_server();

    // Caches and controller queues start immediately; the subscriber lists
    // stay empty until leadership is gained
    let watcher = Arc::new(ResourceWatcher::new(client.clone(), config.clone()));
    watcher.run();
    watcher
        .wait_for_cache_sync()
        .await
        .context("cache sync failed")?;

    // The webhook serves from the caches regardless of leadership
    let webhook = WebhookServer::new(config.webhook.clone(), watcher.context());
    let mut webhook_handle = tokio::spawn(async move { webhook.run().await });

    let shutdown_result: Result<()> = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown...");
            result.map_err(anyhow::Error::from)
        }

        result = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                sigterm.recv().await;
                Ok::<(), anyhow::Error>(())
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            }
        } => {
            info!("Received SIGTERM, initiating graceful shutdown...");
            result
        }

        // The webhook serves forever; missing or invalid TLS material is a
        // fatal startup error and must bring the process down
        result = &mut webhook_handle => {
            error!("CRITICAL: Webhook server exited unexpectedly: {:?}", result);
            match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("webhook server exited unexpectedly without error")),
                Ok(Err(e)) => Err(e.context("webhook server failed")),
                Err(e) => Err(anyhow::Error::from(e).context("webhook server task panicked")),
            }
        }

        result = run_elected(client, config, watcher.clone()) => {
            result
        }
    };

    watcher.shutdown();
    webhook_handle.abort();
    shutdown_result?;
    info!("Graceful shutdown completed");

    Ok(())
}

/// Gate the elected reconcilers on leadership.
///
/// With election disabled the elected components start immediately and this
/// future never resolves. With election enabled the components are started
/// on every leadership gain and stopped on every loss; the process stays
/// alive across losses so the webhook keeps serving, and re-contends for the
/// lease.
async fn run_elected(
    client: Client,
    config: ValetConfig,
    watcher: Arc<ResourceWatcher>,
) -> Result<()> {
    let election = &config.leader_election;

    if !election.enabled {
        warn!("Leader election DISABLED - running without high availability");
        watcher.start_elected_components();
        return std::future::pending::<Result<()>>().await;
    }

    info!(
        lock_name = %election.lock_name,
        lock_namespace = %election.lock_namespace,
        identity = %election.identity,
        lease_duration_secs = election.lease_duration_secs,
        retry_period_secs = election.retry_period_secs,
        "Leader election enabled"
    );

    let lease_manager = LeaseManagerBuilder::new(client, &election.lock_name)
        .with_namespace(&election.lock_namespace)
        .with_identity(&election.identity)
        .with_duration(election.lease_duration_secs)
        .with_grace(election.retry_period_secs)
        .build()
        .await
        .context("failed to build leader election lease manager")?;

    let (mut leader_rx, _lease_handle) = lease_manager.watch().await;

    let mut is_leader = false;
    loop {
        let leading = *leader_rx.borrow_and_update();
        if leading && !is_leader {
            info!("Leadership acquired. Starting elected components");
            metrics::record_leader_elected(&election.identity);
            watcher.start_elected_components();
            is_leader = true;
        } else if !leading && is_leader {
            warn!("Leadership lost. Stopping elected components");
            metrics::record_leader_lost(&election.identity);
            watcher.stop_elected_components();
            is_leader = false;
        }

        leader_rx
            .changed()
            .await
            .context("leader election channel closed")?;
    }
}
