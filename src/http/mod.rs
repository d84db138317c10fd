//! HTTP protocol implementation.
//!
//! A small HTTP/1.1 layer with support for keep-alive connections, shared by
//! the HTTP gate's client side and the proxy's backend side.
//!
//! # Architecture
//!
//! - **`connection`**: the per-client connection handler implementing the
//!   request-proxy-response state machine
//! - **`parser`**: parses incoming HTTP requests from byte buffers
//! - **`request`**: HTTP request representation and builder
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: serializes and writes HTTP responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//! Reading ──request──▶ Proxying ──response──▶ Writing
//!    ▲                                           │
//!    └────────────── keep-alive ◀────────────────┤
//!                                                └─ close ──▶ Closed
//! ```

pub mod request;
pub mod response;
pub mod parser;
pub mod connection;
pub mod writer;
