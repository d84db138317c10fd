//! Tests for the TCP tunnel gate

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use flowgate::gateway::Gateway;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP echo server on a free port.
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buffer = [0u8; 4096];
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) if stream.write_all(&buffer[..n]).await.is_err() => break,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_tunnel_echoes_ping() {
    let upstream = spawn_echo_server().await;

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    let mut client = TcpStream::connect(gate).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn test_tunnel_relays_large_payload_in_order() {
    let upstream = spawn_echo_server().await;

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    // Larger than any single copy buffer, with position-dependent content
    // so reordering would be detected.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let client = TcpStream::connect(gate).await.unwrap();
    let (mut rd, mut wr) = client.into_split();

    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        // Keep the write half open: an EOF would tear down the whole
        // session before the echo drains back.
        wr
    });

    let mut received = vec![0u8; expected.len()];
    timeout(TEST_TIMEOUT, rd.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);

    drop(writer.await.unwrap());

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn test_tunnel_concurrent_sessions_are_independent() {
    let upstream = spawn_echo_server().await;

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = TcpStream::connect(gate).await.unwrap();
                let message = format!("session {i}");
                client.write_all(message.as_bytes()).await.unwrap();

                let mut reply = vec![0u8; message.len()];
                timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(reply, message.as_bytes());
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn test_client_close_tears_down_upstream_side() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    let client = TcpStream::connect(gate).await.unwrap();
    let (mut upstream_side, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();

    drop(client);

    // The session ends on the first finished copy direction; the gate's
    // upstream socket must close within a bounded time.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(2), upstream_side.read(&mut buf))
        .await
        .expect("upstream side was not closed after client hangup");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes from a closed session"),
    }

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn test_upstream_close_tears_down_client_side() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    let mut client = TcpStream::connect(gate).await.unwrap();
    let (upstream_side, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();

    drop(upstream_side);

    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client side was not closed after upstream hangup");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes from a closed session"),
    }

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn test_dial_failure_closes_client_and_spares_later_sessions() {
    // Reserve a port, then free it so the tunnel's upstream refuses.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = parked.local_addr().unwrap();
    drop(parked);

    let mut gateway = Gateway::new();
    let gate = gateway
        .register_tunnel("127.0.0.1:0", &upstream.to_string())
        .await
        .unwrap();

    // First attempt: upstream refuses, the client is simply closed.
    let mut failed_client = TcpStream::connect(gate).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(2), failed_client.read(&mut buf))
        .await
        .expect("client was not closed after dial failure");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after dial failure"),
    }

    // Upstream comes back on the same port; the same gate serves new
    // sessions as if nothing happened.
    let listener = TcpListener::bind(upstream).await.unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut buffer = [0u8; 16];
        if let Ok(n) = stream.read(&mut buffer).await {
            let _ = stream.write_all(&buffer[..n]).await;
        }
    });

    let mut client = TcpStream::connect(gate).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ping");

    gateway.shutdown();
    gateway.join().await;
}
