//! Process metrics and the `/metrics` HTTP surface.
//!
//! A pull-based substitution for the teacher's push-based OpenTelemetry/OTLP
//! pipeline (`observability::metrics`): a single unauthenticated endpoint
//! rendered by `metrics-exporter-prometheus`, matching the teacher's
//! unauthenticated health-route convention rather than its meter-provider
//! wiring. See DESIGN.md for the substitution rationale.

use axum::extract::State;
use axum::routing::get;
use axum::{Router, serve};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::queue::QueueStore;

pub const PLAYS_TOTAL: &str = "callvox_plays_total";
pub const DOWNLOAD_FAILURES_TOTAL: &str = "callvox_download_failures_total";
pub const JOIN_FAILURES_TOTAL: &str = "callvox_join_failures_total";
pub const PLAYED_TIME_SECONDS: &str = "callvox_played_time_seconds";
pub const ACTIVE_CHATS: &str = "callvox_active_chats";

#[derive(Clone)]
struct MetricsState {
    handle: PrometheusHandle,
    queue: Arc<QueueStore>,
}

/// Installs the global Prometheus recorder. Call once at startup, before
/// any `metrics::counter!`/`metrics::histogram!` call site executes.
#[must_use]
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus metrics recorder")
}

/// Builds the `/metrics` router. `queue` backs the `callvox_active_chats`
/// gauge, refreshed on every scrape rather than kept as a running counter,
/// since chats can go idle without a corresponding metrics event.
fn router(handle: PrometheusHandle, queue: Arc<QueueStore>) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .layer(TraceLayer::new_for_http())
        .with_state(MetricsState { handle, queue })
}

async fn render(State(state): State<MetricsState>) -> String {
    metrics::gauge!(ACTIVE_CHATS).set(state.queue.active_chats().len() as f64);
    state.handle.render()
}

/// Serves `/metrics` on `port` until the process is asked to shut down.
/// Never returns `Err` under normal operation; a bind failure is treated as
/// fatal startup misconfiguration by the caller.
pub async fn serve_metrics(
    port: u16,
    handle: PrometheusHandle,
    queue: Arc<QueueStore>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    serve(listener, router(handle, queue)).await
}

pub fn record_join_failure() {
    metrics::counter!(JOIN_FAILURES_TOTAL).increment(1);
}

pub fn record_play() {
    metrics::counter!(PLAYS_TOTAL).increment(1);
}

pub fn record_download_failure() {
    metrics::counter!(DOWNLOAD_FAILURES_TOTAL).increment(1);
}

pub fn record_played_time(chat_id: i64, seconds: u64) {
    metrics::histogram!(PLAYED_TIME_SECONDS, "chat_id" => chat_id.to_string()).record(seconds as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use std::sync::Once;

    static INSTALL: Once = Once::new();

    fn handle() -> PrometheusHandle {
        let mut installed = None;
        INSTALL.call_once(|| installed = Some(install_recorder()));
        installed.unwrap_or_else(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .build_recorder()
                .handle()
        })
    }

    #[tokio::test]
    async fn render_reports_the_active_chat_gauge() {
        let handle = handle();
        let queue = Arc::new(QueueStore::new());
        queue.set_active(-1, true);
        let state = MetricsState { handle, queue };
        let body = render(State(state)).await;
        assert!(body.contains(ACTIVE_CHATS));
    }
}
