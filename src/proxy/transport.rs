//! Per-backend outbound transport
//!
//! Completed exchanges check their connection back in; later requests to the
//! same backend check one out again instead of dialing. The idle set is
//! capped and entries expire after the configured idle timeout.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::gateway::Tuning;

#[derive(Debug)]
struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

/// Reusable keep-alive connections to one backend address.
#[derive(Debug)]
pub struct Transport {
    addr: String,
    idle: Mutex<VecDeque<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
    dial_timeout: Duration,
}

impl Transport {
    pub fn new(addr: String, tuning: &Tuning) -> Self {
        Self {
            addr,
            idle: Mutex::new(VecDeque::new()),
            max_idle: tuning.max_idle_per_backend,
            idle_timeout: tuning.idle_timeout,
            dial_timeout: tuning.dial_timeout,
        }
    }

    /// The host:port this transport dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// A connection to the backend: a live idle one when available,
    /// otherwise a fresh dial bounded by the dial timeout.
    pub async fn checkout(&self) -> Result<TcpStream> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(conn) = idle.pop_back() {
                if conn.since.elapsed() >= self.idle_timeout {
                    continue;
                }
                if is_live(&conn.stream) {
                    return Ok(conn.stream);
                }
            }
        }

        timeout(self.dial_timeout, TcpStream::connect(&self.addr))
            .await
            .with_context(|| format!("dial {} timed out", self.addr))?
            .with_context(|| format!("failed to connect to {}", self.addr))
    }

    /// Returns a connection for reuse. Dropped when the idle set is full.
    pub async fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push_back(IdleConn {
                stream,
                since: Instant::now(),
            });
        }
    }

    /// Idle connections currently pooled.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// Whether an idle connection is still usable.
///
/// A readable socket with zero bytes means the peer closed while the
/// connection sat idle; buffered stray bytes would desynchronize the next
/// exchange. Only a would-block probe is reusable.
fn is_live(stream: &TcpStream) -> bool {
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
    }
}
