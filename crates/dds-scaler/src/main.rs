use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use dds_meta::{EtcdMetaStore, StoreCluster};
use dds_scaler::args::Args;
use dds_scaler::metrics::{self, SharedMetrics};
use dds_scaler::Reconciler;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let otel_guard = dds_common::telemetry::init_tracing(
        "dds-scaler",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    info!("dds-scaler starting...");

    let store = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
    info!(endpoint=%args.etcd_endpoint, "connected to etcd");

    let metrics = Arc::new(SharedMetrics::default());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.metrics_port)).await?;
    let app = metrics::router(metrics.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error=%e, "metrics server exited");
        }
    });
    info!(port = args.metrics_port, "serving /metrics and /healthz");

    let reconciler = Reconciler::new(StoreCluster::new(store), args.settings(), metrics);
    tokio::select! {
        _ = reconciler.run(args.scan_interval(), args.trigger_debounce()) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    if let Some(provider) = otel_guard {
        if let Err(e) = provider.shutdown() {
            error!(error=%e, "failed to flush traces");
        }
    }
    Ok(())
}
