use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{net::TcpListener, signal, sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::config::{RelayConfig, SessionConfig};
use crate::gatekeeper::{gatekeeper, OriginPolicy};

/// Immutable per-process state shared by every connection.
pub struct RelayState {
    pub origins: OriginPolicy,
    pub session: SessionConfig,
    shutdown: watch::Receiver<bool>,
    active: watch::Sender<usize>,
}

impl RelayState {
    pub fn new(
        origins: OriginPolicy,
        session: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            origins,
            session,
            shutdown,
            active,
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn active_sessions(&self) -> usize {
        *self.active.borrow()
    }

    pub(crate) fn track_session(self: &Arc<Self>) -> ActiveSession {
        self.active.send_modify(|count| *count += 1);
        ActiveSession {
            state: Arc::clone(self),
        }
    }

    /// Waits until every session has terminated or `grace` elapses.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(grace, rx.wait_for(|count| *count == 0))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }
}

pub(crate) struct ActiveSession {
    state: Arc<RelayState>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.state
            .active
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

pub fn relay_router(state: Arc<RelayState>) -> Router {
    Router::new().fallback(gatekeeper).with_state(state)
}

/// A bound relay listener, ready to serve.
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub async fn bind(
        addr: SocketAddr,
        origins: OriginPolicy,
        session: SessionConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {addr}"))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RelayState::new(origins, session, shutdown_rx));
        Ok(Self {
            listener,
            state,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read relay listener address")
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Serves until `stop` resolves, then tears down live sessions within `grace`.
    pub async fn run<F>(self, stop: F, grace: Duration) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!("apl-relay listening on {addr}");

        let router = relay_router(self.state());
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stop)
        .await
        .context("relay server exited with error")?;

        // Upgraded sockets outlive the HTTP server; stop their workers explicitly.
        let live = self.state.active_sessions();
        info!(
            live_sessions = live,
            grace_seconds = grace.as_secs(),
            "shutdown signal received; terminating sessions"
        );
        self.shutdown_tx.send_replace(true);
        if self.state.drain(grace).await {
            info!("graceful shutdown complete");
        } else {
            warn!(
                remaining = self.state.active_sessions(),
                "sessions still running after shutdown grace"
            );
        }
        Ok(())
    }
}

pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let server = RelayServer::bind(
        config.listen_addr,
        OriginPolicy::new(&config.allowed_origins),
        config.session.clone(),
    )
    .await?;
    info!(
        allowed_origins = ?config.allowed_origins,
        worker = %config.session.launch.program().display(),
        buffer_policy = ?config.session.buffer_policy,
        "relay configured"
    );

    let metrics_task = match config.metrics_addr {
        Some(addr) => Some(spawn_metrics_listener(addr, metrics).await?),
        None => None,
    };

    let result = server.run(shutdown_signal(), config.shutdown_grace).await;
    if let Some(task) = metrics_task {
        task.abort();
    }
    result
}

async fn spawn_metrics_listener(
    addr: SocketAddr,
    metrics: PrometheusHandle,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    info!("metrics listening on {addr}");
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!(error = %err, "metrics listener stopped");
        }
    }))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
