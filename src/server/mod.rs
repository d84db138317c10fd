//! Gate accept loops
//!
//! Each gate owns one listening socket and serves it from its own task:
//! the HTTP gate dispatches requests across a backend pool, the tunnel gate
//! relays raw bytes to a single upstream.

pub mod http;
pub mod tunnel;

pub use http::HttpGate;
pub use tunnel::TunnelGate;
