use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::gateway::Tuning;
use crate::http::connection::Connection;
use crate::proxy::backend::BackendPool;
use crate::proxy::upstream::ProxyHandler;

/// HTTP relay gate: one listener, a pool of reverse-proxy targets.
pub struct HttpGate {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    limiter: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    max_sessions: u32,
}

impl HttpGate {
    /// Builds the backend pool and binds the listener.
    ///
    /// Fails on an empty or malformed target list and on bind errors, so a
    /// gate that cannot serve is reported instead of silently idle.
    pub async fn bind(listen_addr: &str, targets: &[String], tuning: &Tuning) -> Result<Self> {
        let pool = BackendPool::new(targets, tuning)?;

        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind HTTP gate to {listen_addr}"))?;

        info!(
            proto = "http",
            listen_addr,
            backends = pool.len(),
            "Gate active"
        );

        Ok(Self {
            listener,
            handler: Arc::new(ProxyHandler::new(pool)),
            limiter: Arc::new(Semaphore::new(tuning.max_sessions)),
            shutdown: Arc::new(Notify::new()),
            max_sessions: tuning.max_sessions as u32,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read HTTP gate local address")
    }

    /// Signal handle used by the controller to stop this gate.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown, then drains in-flight sessions.
    ///
    /// Sessions are bounded by the gate's semaphore: at capacity the loop
    /// stops accepting and the OS backlog queues new connections.
    pub async fn serve(&self) {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.shutdown.notified() => break,
            };

            let (socket, peer) = tokio::select! {
                res = self.listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
                _ = self.shutdown.notified() => break,
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let mut conn = Connection::new(socket, handler);
                if let Err(e) = conn.run().await {
                    debug!(peer = %peer, error = %e, "Connection error");
                }
                drop(permit);
            });
        }

        // Every session holds a permit; reacquiring all of them is the
        // drain barrier.
        let _ = self.limiter.acquire_many(self.max_sessions).await;
        info!(proto = "http", "Gate stopped");
    }
}
