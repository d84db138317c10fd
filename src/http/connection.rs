use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::upstream::ProxyHandler;

/// One client connection on an HTTP gate.
///
/// Runs the request-proxy-response state machine until the client closes or
/// asks for the connection to be closed.
pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
    state: ConnectionState,
    handler: Arc<ProxyHandler>,
}

pub enum ConnectionState {
    Reading,
    Proxying(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

enum ReadOutcome {
    Request(Request),
    /// Client closed the connection between requests.
    Closed,
    /// Request could not be parsed; answered with a 400, then closed.
    Malformed,
}

impl Connection {
    pub fn new(stream: TcpStream, handler: Arc<ProxyHandler>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            handler,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await? {
                    ReadOutcome::Request(req) => {
                        self.state = ConnectionState::Proxying(req);
                    }
                    ReadOutcome::Closed => {
                        self.state = ConnectionState::Closed;
                    }
                    ReadOutcome::Malformed => {
                        let writer = ResponseWriter::new(&Response::bad_request());
                        self.state = ConnectionState::Writing(writer, false);
                    }
                },

                ConnectionState::Proxying(req) => {
                    let keep_alive = req.keep_alive();
                    let response = self.handler.forward_request(&req).await;

                    let writer = ResponseWriter::new(&response);
                    self.state = ConnectionState::Writing(writer, keep_alive);
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(ReadOutcome::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data, fall through to read
                }

                Err(e) => {
                    tracing::debug!(error = ?e, "Malformed request");
                    return Ok(ReadOutcome::Malformed);
                }
            }

            let mut temp = [0u8; 1024];
            let n = self.stream.read(&mut temp).await?;

            if n == 0 {
                // Client closed connection
                return Ok(ReadOutcome::Closed);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}
