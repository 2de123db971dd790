//! Metrics Module
//!
//! Aggregates cache, fetcher, and predictor statistics and serves them over
//! HTTP: Prometheus text exposition on `/metrics`, a JSON snapshot on
//! `/stats`.

use crate::cache::{CacheStats, ChunkCache};
use crate::fetcher::{FetcherPool, FetcherStats};
use crate::predictor::{Predictor, PredictorStats};
use crate::{FsError, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One coherent snapshot across all instrumented components.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cache: CacheStats,
    pub fetcher: FetcherStats,
    pub predictor: PredictorStats,
}

/// Shared handles the metrics endpoints read from.
pub struct MetricsState {
    cache: Arc<ChunkCache>,
    fetcher: Arc<FetcherPool>,
    predictor: Arc<Predictor>,
}

impl MetricsState {
    pub fn new(
        cache: Arc<ChunkCache>,
        fetcher: Arc<FetcherPool>,
        predictor: Arc<Predictor>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            predictor,
        }
    }

    pub fn snapshot(&self) -> SystemStats {
        SystemStats {
            cache: self.cache.stats(),
            fetcher: self.fetcher.stats(),
            predictor: self.predictor.stats(),
        }
    }

    fn respond(&self, path: &str) -> Response<String> {
        match path {
            "/metrics" => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4",
                render_prometheus(&self.snapshot()),
            ),
            "/stats" => match serde_json::to_string_pretty(&self.snapshot()) {
                Ok(body) => text_response(StatusCode::OK, "application/json", body),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("serialization error: {}\n", e),
                ),
            },
            _ => text_response(StatusCode::NOT_FOUND, "text/plain", "not found\n".to_string()),
        }
    }
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<String> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(body)
        .expect("static response parts")
}

/// Render a snapshot in Prometheus text exposition format.
pub fn render_prometheus(stats: &SystemStats) -> String {
    let mut out = String::with_capacity(1024);

    let mut gauge = |name: &str, help: &str, value: u64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
        ));
    };
    gauge(
        "shardfs_cache_size_bytes",
        "Current cache size in bytes",
        stats.cache.current_size,
    );
    gauge(
        "shardfs_cache_max_size_bytes",
        "Configured cache capacity in bytes",
        stats.cache.max_size,
    );
    gauge(
        "shardfs_cache_hot_bytes",
        "Bytes cached in the HOT zone",
        stats.cache.hot_size,
    );
    gauge(
        "shardfs_cache_prefetch_bytes",
        "Bytes cached in the PREFETCH zone",
        stats.cache.prefetch_size,
    );
    gauge(
        "shardfs_cache_files",
        "Number of cached files",
        stats.cache.num_files as u64,
    );
    gauge(
        "shardfs_cache_chunks",
        "Number of cached chunks",
        stats.cache.num_chunks as u64,
    );

    let mut counter = |name: &str, help: &str, value: u64| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
        ));
    };
    counter(
        "shardfs_downloads_total",
        "Total download attempts",
        stats.fetcher.total_downloads,
    );
    counter(
        "shardfs_downloads_failed_total",
        "Failed download attempts",
        stats.fetcher.failed_downloads,
    );
    counter(
        "shardfs_download_bytes_total",
        "Total bytes downloaded",
        stats.fetcher.bytes_downloaded,
    );
    counter(
        "shardfs_predictions_total",
        "Prediction rounds executed",
        stats.predictor.predictions_made,
    );
    counter(
        "shardfs_prefetches_issued_total",
        "Prefetch tasks issued",
        stats.predictor.prefetches_issued,
    );

    out
}

/// Serve the metrics endpoints until the shutdown signal flips.
pub async fn serve(
    state: Arc<MetricsState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| FsError::HttpError(format!("failed to bind metrics server: {}", e)))?;

    info!("metrics server listening on {}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("metrics accept failed: {}", e);
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(state.respond(req.uri().path())) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("metrics connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}
