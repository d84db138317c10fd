use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::gateway::Tuning;

/// TCP tunnel gate: one listener, bytes relayed verbatim to one upstream.
pub struct TunnelGate {
    listener: TcpListener,
    upstream_addr: String,
    dial_timeout: Duration,
    limiter: Arc<Semaphore>,
    shutdown: Arc<Notify>,
    max_sessions: u32,
}

impl TunnelGate {
    /// Binds the listener. Bind errors are reported to the caller.
    pub async fn bind(listen_addr: &str, upstream_addr: &str, tuning: &Tuning) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind tunnel gate to {listen_addr}"))?;

        info!(
            proto = "tunnel",
            listen_addr,
            upstream = upstream_addr,
            "Gate active"
        );

        Ok(Self {
            listener,
            upstream_addr: upstream_addr.to_string(),
            dial_timeout: tuning.dial_timeout,
            limiter: Arc::new(Semaphore::new(tuning.max_sessions)),
            shutdown: Arc::new(Notify::new()),
            max_sessions: tuning.max_sessions as u32,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read tunnel gate local address")
    }

    /// Signal handle used by the controller to stop this gate.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown, then drains in-flight sessions.
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

            let upstream_addr = self.upstream_addr.clone();
            let dial_timeout = self.dial_timeout;
            tokio::spawn(async move {
                if let Err(e) = relay(socket, &upstream_addr, dial_timeout).await {
                    debug!(peer = %peer, error = %e, "Tunnel session ended");
                }
                drop(permit);
            });
        }

        let _ = self.limiter.acquire_many(self.max_sessions).await;
        info!(proto = "tunnel", "Gate stopped");
    }
}

/// One relay session: Dialing → Relaying → Closed.
///
/// A dial failure closes the client with no retry. Once relaying, the
/// session completes when the first copy direction returns (EOF or error);
/// returning drops both sockets, so the other direction is torn down with
/// it.
async fn relay(mut client: TcpStream, upstream_addr: &str, dial_timeout: Duration) -> Result<()> {
    let mut upstream = timeout(dial_timeout, TcpStream::connect(upstream_addr))
        .await
        .with_context(|| format!("dial {upstream_addr} timed out"))?
        .with_context(|| format!("failed to connect to upstream {upstream_addr}"))?;

    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();

    tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut upstream_wr) => {
            if let Err(e) = res {
                debug!(error = %e, "client→upstream copy ended");
            }
        }
        res = tokio::io::copy(&mut upstream_rd, &mut client_wr) => {
            if let Err(e) = res {
                debug!(error = %e, "upstream→client copy ended");
            }
        }
    }

    Ok(())
}
