//! Backend pool and round-robin selection
//!
//! The pool is an ordered, immutable list of upstream targets fixed at gate
//! creation. Selection is stateless round-robin over an atomic counter; no
//! health state is tracked and a dead backend is selected on schedule like
//! any other.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use url::Url;

use crate::gateway::Tuning;
use crate::proxy::transport::Transport;

/// One upstream target of an HTTP gate.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Parsed target URL, e.g. "http://localhost:3000"
    pub url: Url,
    /// host:port dial address derived from the URL
    pub addr: String,
    /// Keep-alive connection pool for this backend
    pub transport: Arc<Transport>,
}

impl Backend {
    fn new(target: &str, tuning: &Tuning) -> Result<Self> {
        let url =
            Url::parse(target).with_context(|| format!("invalid backend URL {target}"))?;

        if url.scheme() != "http" {
            anyhow::bail!("unsupported scheme {:?} in backend URL {target}", url.scheme());
        }

        let host = url
            .host_str()
            .with_context(|| format!("backend URL {target} has no host"))?;
        let port = url.port().unwrap_or(80);
        let addr = format!("{host}:{port}");

        Ok(Self {
            transport: Arc::new(Transport::new(addr.clone(), tuning)),
            url,
            addr,
        })
    }

    /// Display name used in logs.
    pub fn display_name(&self) -> &str {
        self.url.as_str()
    }
}

/// Ordered pool of backends with round-robin selection.
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: Arc<Vec<Backend>>,
    counter: Arc<AtomicUsize>,
}

impl BackendPool {
    /// Builds a pool from target URLs.
    ///
    /// At least one target is required; selection computes `counter % len`,
    /// so an empty pool is rejected here instead of faulting later.
    pub fn new(targets: &[String], tuning: &Tuning) -> Result<Self> {
        if targets.is_empty() {
            anyhow::bail!("backend pool requires at least one target");
        }

        let backends = targets
            .iter()
            .map(|t| Backend::new(t, tuning))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            backends: Arc::new(backends),
            counter: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Selects the next backend in registration order, wrapping at the end.
    ///
    /// Lock-free: concurrent callers each observe a distinct counter value,
    /// so over any window of k*len calls each backend is returned k times.
    pub fn select(&self) -> &Backend {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.backends[idx % self.backends.len()]
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// All backends in registration order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}
