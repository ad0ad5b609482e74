use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tracer::stats::{Outcome, StatsSnapshot};

const NAMESPACE: &str = "sysagg";

/// Prometheus metrics for agent health.
///
/// All metrics use the "sysagg" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Engine ===
    /// Engine outcomes (events processed, drops, flushes) by outcome.
    pub engine_outcomes: CounterVec,
    /// Live groups in the aggregation table at the last stats tick.
    pub table_live_entries: Gauge,
    /// Keys holding a table slot.
    pub table_occupied_keys: Gauge,
    /// Maximum distinct keys.
    pub table_capacity: Gauge,

    // === Channel ===
    /// Bytes held in the output channel.
    pub channel_used_bytes: Gauge,
    /// Output channel capacity in bytes.
    pub channel_capacity_bytes: Gauge,

    // === Consumer ===
    /// Published channel records delivered to sinks.
    pub batches_consumed: Counter,
    /// Decoded rows delivered to sinks.
    pub rows_consumed: Counter,
    /// Rows per consumed record (1-100000 buckets).
    pub batch_rows: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let engine_outcomes = CounterVec::new(
            Opts::new(
                "engine_outcomes_total",
                "Engine outcomes (events processed, drops, flushes) by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let table_live_entries = Gauge::with_opts(
            Opts::new(
                "table_live_entries",
                "Live groups in the aggregation table.",
            )
            .namespace(NAMESPACE),
        )?;
        let table_occupied_keys = Gauge::with_opts(
            Opts::new("table_occupied_keys", "Keys holding a table slot.").namespace(NAMESPACE),
        )?;
        let table_capacity = Gauge::with_opts(
            Opts::new("table_capacity", "Maximum distinct keys.").namespace(NAMESPACE),
        )?;
        let channel_used_bytes = Gauge::with_opts(
            Opts::new("channel_used_bytes", "Bytes held in the output channel.")
                .namespace(NAMESPACE),
        )?;
        let channel_capacity_bytes = Gauge::with_opts(
            Opts::new(
                "channel_capacity_bytes",
                "Output channel capacity in bytes.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_consumed = Counter::with_opts(
            Opts::new(
                "batches_consumed_total",
                "Published channel records delivered to sinks.",
            )
            .namespace(NAMESPACE),
        )?;
        let rows_consumed = Counter::with_opts(
            Opts::new("rows_consumed_total", "Decoded rows delivered to sinks.")
                .namespace(NAMESPACE),
        )?;
        let batch_rows = Histogram::with_opts(
            HistogramOpts::new("batch_rows", "Rows per consumed channel record.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0]),
        )?;

        registry.register(Box::new(engine_outcomes.clone()))?;
        registry.register(Box::new(table_live_entries.clone()))?;
        registry.register(Box::new(table_occupied_keys.clone()))?;
        registry.register(Box::new(table_capacity.clone()))?;
        registry.register(Box::new(channel_used_bytes.clone()))?;
        registry.register(Box::new(channel_capacity_bytes.clone()))?;
        registry.register(Box::new(batches_consumed.clone()))?;
        registry.register(Box::new(rows_consumed.clone()))?;
        registry.register(Box::new(batch_rows.clone()))?;

        // Pre-create every outcome series so dashboards see zeros.
        for outcome in Outcome::ALL {
            engine_outcomes.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            engine_outcomes,
            table_live_entries,
            table_occupied_keys,
            table_capacity,
            channel_used_bytes,
            channel_capacity_bytes,
            batches_consumed,
            rows_consumed,
            batch_rows,
        })
    }

    /// Adds a stats delta to the outcome counters.
    pub fn apply_stats(&self, snapshot: &StatsSnapshot) {
        for (outcome, n) in snapshot.non_zero() {
            self.engine_outcomes
                .with_label_values(&[outcome.as_str()])
                .inc_by(n as f64);
        }
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
