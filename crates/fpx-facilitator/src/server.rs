use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use fpx_registry::{load_relay_file, reload_relay_file};

use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::facilitator::Facilitator;
use crate::metrics::FacilitatorMetrics;

pub struct FacilitatorServer {
    config: ServerConfig,
    facilitator: Arc<Facilitator>,
    metrics: Arc<FacilitatorMetrics>,
    listener: TcpListener,
    shutdown_tx: watch::Sender<bool>,
}

impl FacilitatorServer {
    /// Validate `config`, load the relay file and bind the listening socket.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let metrics = Arc::new(FacilitatorMetrics::new()?);
        let facilitator = Arc::new(Facilitator::new(&config, Arc::clone(&metrics)));

        let content = tokio::fs::read_to_string(&config.relay_file).await?;
        let count = load_relay_file(facilitator.relays(), content.as_bytes())?;
        if count == 0 {
            warn!("Relay file {:?} lists no relays; every proxy poll will get NONE", config.relay_file);
        }
        facilitator.update_gauges();

        let listener = TcpListener::bind(config.listen_addr).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            facilitator,
            metrics,
            listener,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is requested or a termination signal
    /// arrives.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("fpx-facilitator listening on {}", self.local_addr()?);

        if let Some(interval) = self.config.relay_reload_interval() {
            tokio::spawn(Self::reload_task(
                Arc::clone(&self.facilitator),
                self.config.relay_file.clone(),
                interval,
                self.shutdown_tx.subscribe(),
            ));
        }

        if let Some(metrics_addr) = self.config.metrics_addr {
            self.start_http(metrics_addr).await?;
        }

        let guard = self.config.to_guard_config();
        let mut shutdown = Box::pin(Self::shutdown_signal(self.shutdown_tx.subscribe()));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let facilitator = Arc::clone(&self.facilitator);
                            tokio::spawn(handle_connection(facilitator, stream, peer, guard));
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        // Let the helper tasks see the shutdown even when a signal ended the loop.
        self.shutdown_tx.send_replace(true);
        info!("fpx-facilitator stopped");
        Ok(())
    }

    async fn start_http(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&self.metrics))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server for health/metrics listening on {}", addr);

        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                error!("HTTP server error: {}", e);
            }
        });

        Ok(())
    }

    async fn reload_task(
        facilitator: Arc<Facilitator>,
        relay_file: PathBuf,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the file was just loaded.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let content = match tokio::fs::read_to_string(&relay_file).await {
                        Ok(content) => content,
                        Err(e) => {
                            warn!("Cannot read relay file {:?}: {}", relay_file, e);
                            continue;
                        }
                    };
                    match reload_relay_file(facilitator.relays(), content.as_bytes()) {
                        Ok(_) => facilitator.update_gauges(),
                        Err(e) => {
                            warn!("Keeping previous relays, reload of {:?} failed: {}", relay_file, e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender means the server is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm {
                        Some(ref mut sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn health_handler(State(metrics): State<Arc<FacilitatorMetrics>>) -> Response {
    use serde_json::json;

    let response = json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "relays": metrics.relays.get(),
        "unserved_clients": metrics.unserved_clients.get(),
        "active_connections": metrics.active_connections.get(),
    });

    (StatusCode::OK, axum::Json(response)).into_response()
}

async fn metrics_handler(State(metrics): State<Arc<FacilitatorMetrics>>) -> Response {
    match metrics.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Metrics export failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
