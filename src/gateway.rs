//! Gateway controller
//!
//! The controller creates gates, tracks their tasks, and provides the
//! blocking join point for the embedding program. Runtime knobs live in
//! [`Tuning`], fixed once at construction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::server::http::HttpGate;
use crate::server::tunnel::TunnelGate;

/// Runtime knobs shared by every gate.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Cap on concurrent sessions per gate; at the cap a gate stops
    /// accepting and the OS backlog queues.
    pub max_sessions: usize,
    /// Timeout for outbound connection establishment.
    pub dial_timeout: Duration,
    /// Idle keep-alive connections retained per HTTP backend.
    pub max_idle_per_backend: usize,
    /// Idle connections older than this are discarded on checkout.
    pub idle_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            dial_timeout: Duration::from_secs(5),
            max_idle_per_backend: 2048,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Top-level gateway: registers gates and joins on their tasks.
pub struct Gateway {
    tuning: Tuning,
    tasks: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::with_tuning(Tuning::default())
    }

    pub fn with_tuning(tuning: Tuning) -> Self {
        Self {
            tuning,
            tasks: Vec::new(),
            shutdowns: Vec::new(),
        }
    }

    /// Registers an HTTP gate and spawns its accept loop.
    ///
    /// Binding happens here, so bind errors and invalid target lists reach
    /// the caller. Returns the bound local address.
    pub async fn register_http(
        &mut self,
        listen_addr: &str,
        targets: &[String],
    ) -> Result<SocketAddr> {
        let gate = HttpGate::bind(listen_addr, targets, &self.tuning).await?;
        let addr = gate.local_addr()?;

        self.shutdowns.push(gate.shutdown_signal());
        self.tasks.push(tokio::spawn(async move {
            gate.serve().await;
        }));

        Ok(addr)
    }

    /// Registers a tunnel gate and spawns its accept loop.
    pub async fn register_tunnel(
        &mut self,
        listen_addr: &str,
        upstream_addr: &str,
    ) -> Result<SocketAddr> {
        let gate = TunnelGate::bind(listen_addr, upstream_addr, &self.tuning).await?;
        let addr = gate.local_addr()?;

        self.shutdowns.push(gate.shutdown_signal());
        self.tasks.push(tokio::spawn(async move {
            gate.serve().await;
        }));

        Ok(addr)
    }

    /// Signals every registered gate to stop accepting and drain.
    pub fn shutdown(&self) {
        for gate in &self.shutdowns {
            gate.notify_one();
        }
    }

    /// A handle over the gates registered so far, usable after the gateway
    /// itself has been moved into `join`.
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            shutdowns: self.shutdowns.clone(),
        }
    }

    /// Blocks until every registered gate task has exited.
    ///
    /// Gates run until shut down, so under normal operation this only
    /// returns after [`Gateway::shutdown`] (or a handle's) was called.
    pub async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Detached shutdown handle for registered gates.
#[derive(Clone)]
pub struct GatewayHandle {
    shutdowns: Vec<Arc<Notify>>,
}

impl GatewayHandle {
    pub fn shutdown(&self) {
        for gate in &self.shutdowns {
            gate.notify_one();
        }
    }
}
