//! Prometheus metrics for the syncwire engine.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server exposing `/metrics` and `/health`

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
use tokio_util::sync::CancellationToken;

/// Operation duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the engine.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Connections registered since start.
    pub connections_total: Counter,
    pub connections_active: Gauge,
    /// Inbound messages by type.
    pub messages_total: CounterVec,
    /// Dispatched operations by name.
    pub operations_total: CounterVec,
    /// Error envelopes by code.
    pub errors_total: CounterVec,
    pub operation_duration: HistogramVec,
    pub subscriptions_active: Gauge,
    /// Fan-out deliveries by outcome (`sent`, `failed`).
    pub notifications_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "syncwire_connections_total",
            "Total number of connections registered",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "syncwire_connections_active",
            "Number of currently registered connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let messages_total = CounterVec::new(
            Opts::new("syncwire_messages_total", "Inbound messages by type"),
            &["type"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let operations_total = CounterVec::new(
            Opts::new("syncwire_operations_total", "Dispatched operations by name"),
            &["operation"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let errors_total = CounterVec::new(
            Opts::new("syncwire_errors_total", "Error responses by error code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "syncwire_operation_duration_seconds",
                "Operation duration in seconds by operation",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let subscriptions_active = Gauge::with_opts(Opts::new(
            "syncwire_subscriptions_active",
            "Number of active subscriptions",
        ))?;
        registry.register(Box::new(subscriptions_active.clone()))?;

        let notifications_total = CounterVec::new(
            Opts::new(
                "syncwire_notifications_total",
                "Change notifications by delivery outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            messages_total,
            operations_total,
            errors_total,
            operation_duration,
            subscriptions_active,
            notifications_total,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Binds the metrics listener.
pub async fn bind_metrics_server(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        "Metrics server listening on http://{}/metrics",
        listener.local_addr()?
    );
    Ok(listener)
}

/// Serves metrics until `shutdown` fires.
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>, shutdown: CancellationToken) {
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
            _ = shutdown.cancelled() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            ),
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                )
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
