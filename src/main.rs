use shardfs::config::Config;
use shardfs::fs::{spawn_mount, MountContext, ShardFs};
use shardfs::metrics::{self, MetricsState};
use shardfs::store::S3ObjectStore;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration problems go to stderr before any mounting happens.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shardfs: {}", e);
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bucket = %config.bucket,
        region = %config.region,
        workers = config.workers,
        lookahead = config.lookahead,
        cache_size = config.cache_size,
        "starting shardfs"
    );

    let store = Arc::new(
        S3ObjectStore::connect(&config.bucket, &config.region, &config.s3_prefix).await,
    );
    let ctx = MountContext::new(config.clone(), store);

    if let Err(e) = ctx.bootstrap_metadata().await {
        warn!(error = %e, "object listing failed; sizes fall back to the open-time placeholder");
    }

    if let Some(path) = &config.manifest {
        match ctx.predictor.load_manifest(path) {
            Ok(0) => warn!(manifest = %path.display(), "manifest empty, using pattern prediction"),
            Ok(entries) => info!(manifest = %path.display(), entries, "manifest mode active"),
            Err(e) => warn!(error = %e, "failed to load manifest, using pattern prediction"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_state = Arc::new(MetricsState::new(
        ctx.cache.clone(),
        ctx.fetcher.clone(),
        ctx.predictor.clone(),
    ));
    let metrics_task = tokio::spawn(metrics::serve(
        metrics_state,
        config.metrics_port,
        shutdown_rx,
    ));

    let fs = match ShardFs::new(ctx.clone()) {
        Ok(fs) => fs,
        Err(e) => {
            error!(error = %e, "failed to create filesystem");
            return ExitCode::FAILURE;
        }
    };

    let session = match spawn_mount(fs, &config.mount_point) {
        Ok(session) => session,
        Err(e) => {
            error!(mount = %config.mount_point.display(), error = %e, "mount failed");
            return ExitCode::FAILURE;
        }
    };
    info!(mount = %config.mount_point.display(), "filesystem mounted");

    wait_for_shutdown_signal().await;

    info!("unmounting");
    drop(session);
    // The unmount path stops the context via destroy; this covers mounts
    // torn down externally.
    ctx.stop().await;

    let _ = shutdown_tx.send(true);
    let _ = metrics_task.await;

    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
