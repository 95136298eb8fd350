//! Prometheus metrics for the LW3 server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Command duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Prometheus metrics for the LW3 server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Total commands by verb.
    pub commands_total: CounterVec,
    /// Total error responses by wire code.
    pub errors_total: CounterVec,
    /// Command duration histogram by verb.
    pub command_duration: HistogramVec,
    /// Currently opened nodes across all sessions.
    pub subscriptions_active: Gauge,
    /// CHG lines queued for delivery.
    pub changes_sent_total: Counter,
    /// Outbound messages dropped on a full connection buffer.
    pub outbound_dropped_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "lw3_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "lw3_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Commands
        let commands_total = CounterVec::new(
            Opts::new("lw3_commands_total", "Total commands by verb"),
            &["verb"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("lw3_errors_total", "Total error responses by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new(
                "lw3_command_duration_seconds",
                "Command duration in seconds by verb",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["verb"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        // Subscriptions
        let subscriptions_active = Gauge::with_opts(Opts::new(
            "lw3_subscriptions_active",
            "Number of nodes currently opened by clients",
        ))?;
        registry.register(Box::new(subscriptions_active.clone()))?;

        let changes_sent_total = Counter::with_opts(Opts::new(
            "lw3_changes_sent_total",
            "Total CHG notifications queued for clients",
        ))?;
        registry.register(Box::new(changes_sent_total.clone()))?;

        let outbound_dropped_total = Counter::with_opts(Opts::new(
            "lw3_outbound_dropped_total",
            "Outbound messages dropped because a connection buffer was full",
        ))?;
        registry.register(Box::new(outbound_dropped_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            commands_total,
            errors_total,
            command_duration,
            subscriptions_active,
            changes_sent_total,
            outbound_dropped_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Serves metrics at `/metrics` and a liveness check at `/health`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let mut response = Response::new(Full::new(Bytes::from(metrics.encode())));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" | "/healthz" => Response::new(Full::new(Bytes::from("OK"))),
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}
