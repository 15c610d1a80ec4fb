//! TCP server accepting echo connections.
//!
//! The accept loop admits each new connection through the `AdmissionGate`
//! and hands it to its own supervisor task. When the gate is full the
//! connection is dropped on the spot with nothing written to it; there is
//! no queueing and no rejection message.

use crate::admission::AdmissionGate;
use crate::config::ServerConfig;
use crate::connection::{supervise, ConnectionConfig, ConnectionLease};
use crate::stats::Stats;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Pause after a transient accept failure before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Listen backlog for the primary listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    listener: TcpListener,
    gate: AdmissionGate,
    stats: Arc<Stats>,
    connection: ConnectionConfig,
}

impl Server {
    /// Bind the primary listener.
    ///
    /// Must be called from within a Tokio runtime. A bind failure is the one
    /// error the caller is expected to treat as fatal.
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let addr = config.listen.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for '{}'", config.listen),
            )
        })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(
            address = %listener.local_addr()?,
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Server {
            listener,
            gate: AdmissionGate::new(config.max_connections),
            stats: Arc::new(Stats::new()),
            connection: config.connection,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared counters, for the admin endpoint.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn gate(&self) -> AdmissionGate {
        self.gate.clone()
    }

    /// Accept connections forever.
    ///
    /// Accept errors never end the loop and the listener is never rebuilt.
    pub async fn run(&self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    debug!(error = %e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let Some(slot) = self.gate.try_acquire() else {
                self.stats.record_rejection();
                warn!(peer = %peer, "Connection rejected: server full");
                drop(stream);
                continue;
            };

            debug!(peer = %peer, "New connection");
            let lease = ConnectionLease::new(slot, Arc::clone(&self.stats));
            let config = self.connection;

            tokio::spawn(async move {
                supervise(stream, peer, config, lease).await;
            });
        }
    }
}

/// Accept errors worth a short pause and retry: the peer went away before
/// we got to it, or the process is out of descriptors or buffers.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::Instant;

    struct Running {
        addr: SocketAddr,
        stats: Arc<Stats>,
        gate: AdmissionGate,
    }

    fn test_config(max_connections: usize, connection: ConnectionConfig) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            admin_listen: None,
            max_connections,
            connection,
        }
    }

    fn start(config: ServerConfig) -> Running {
        let server = Server::bind(&config).unwrap();
        let running = Running {
            addr: server.local_addr().unwrap(),
            stats: server.stats(),
            gate: server.gate(),
        };
        tokio::spawn(async move { server.run().await });
        running
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn request(stream: &mut TcpStream, line: &[u8], expected: &[u8]) {
        stream.write_all(line).await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = Server::bind(&test_config(1, ConnectionConfig::default())).unwrap();
        let taken = first.local_addr().unwrap();

        let mut config = test_config(1, ConnectionConfig::default());
        config.listen = taken.to_string();
        assert!(Server::bind(&config).is_err());
    }

    #[tokio::test]
    async fn test_ping_pong_and_echo() {
        let server = start(test_config(4, ConnectionConfig::default()));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        request(&mut stream, b"PING\n", b"PONG\n").await;
        request(&mut stream, b"hello\n", b"ECHO: hello\n").await;
        request(&mut stream, b"  PING  \r\n", b"PONG\n").await;
        request(&mut stream, b"PING me\n", b"ECHO: PING me\n").await;
        request(&mut stream, b"PING\n", b"PONG\n").await;
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_echoed() {
        let server = start(test_config(4, ConnectionConfig::default()));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        request(&mut stream, b"caf\xe9\n", b"ECHO: caf\xe9\n").await;
        request(&mut stream, b"PING\n", b"PONG\n").await;
    }

    #[tokio::test]
    async fn test_fragment_before_half_close_gets_no_reply() {
        let server = start(test_config(4, ConnectionConfig::default()));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        stream.write_all(b"no-newline").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "unexpected reply {:?}", buf);
        eventually(|| server.stats.snapshot().tcp_current_connections == 0).await;
    }

    #[tokio::test]
    async fn test_unbounded_connection_age() {
        let connection = ConnectionConfig {
            max_conn_age: Duration::from_secs(u64::MAX),
            ..ConnectionConfig::default()
        };
        let server = start(test_config(4, connection));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        request(&mut stream, b"PING\n", b"PONG\n").await;
        request(&mut stream, b"hello\n", b"ECHO: hello\n").await;
        assert_eq!(server.stats.snapshot().tcp_current_connections, 1);
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity_with_zero_bytes() {
        let server = start(test_config(2, ConnectionConfig::default()));

        let mut a = TcpStream::connect(server.addr).await.unwrap();
        let mut b = TcpStream::connect(server.addr).await.unwrap();
        request(&mut a, b"PING\n", b"PONG\n").await;
        request(&mut b, b"PING\n", b"PONG\n").await;
        assert_eq!(server.gate.available(), 0);

        let mut c = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let snap = server.stats.snapshot();
        assert_eq!(snap.tcp_rejected_connections, 1);
        assert_eq!(snap.tcp_current_connections, 2);
        assert_eq!(snap.tcp_total_connections, 2);

        // Admitted connections are unaffected
        request(&mut a, b"still\n", b"ECHO: still\n").await;
    }

    #[tokio::test]
    async fn test_idle_connection_is_reaped() {
        let connection = ConnectionConfig {
            read_timeout: Duration::from_millis(100),
            ..ConnectionConfig::default()
        };
        let server = start(test_config(4, connection));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let started = Instant::now();
        request(&mut stream, b"PING\n", b"PONG\n").await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(started.elapsed() >= Duration::from_millis(100));

        let stats = Arc::clone(&server.stats);
        eventually(|| stats.snapshot().tcp_current_connections == 0).await;
        assert_eq!(server.stats.snapshot().tcp_timeout_errors, 1);
    }

    #[tokio::test]
    async fn test_ttl_closes_heartbeating_connection() {
        let connection = ConnectionConfig {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            max_conn_age: Duration::from_millis(300),
        };
        let server = start(test_config(4, connection));
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let started = Instant::now();

        let mut buf = [0u8; 5];
        loop {
            if stream.write_all(b"PING\n").await.is_err() {
                break;
            }
            match stream.read_exact(&mut buf).await {
                Ok(_) => assert_eq!(&buf, b"PONG\n"),
                Err(_) => break,
            }
            assert!(started.elapsed() < Duration::from_secs(3), "TTL never fired");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(started.elapsed() >= Duration::from_millis(300));
        let stats = Arc::clone(&server.stats);
        eventually(|| stats.snapshot().tcp_ttl_expirations == 1).await;
        assert_eq!(server.stats.snapshot().tcp_timeout_errors, 0);
    }

    #[tokio::test]
    async fn test_slots_recovered_after_abrupt_reset() {
        let server = start(test_config(2, ConnectionConfig::default()));
        let before = server.gate.available();

        let mut streams = Vec::new();
        for _ in 0..2 {
            let mut stream = TcpStream::connect(server.addr).await.unwrap();
            request(&mut stream, b"PING\n", b"PONG\n").await;
            streams.push(stream);
        }
        assert_eq!(server.gate.available(), 0);

        // SO_LINGER 0 makes close send RST instead of FIN
        for stream in streams {
            socket2::SockRef::from(&stream)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(stream);
        }

        let gate = server.gate.clone();
        eventually(|| gate.available() == before).await;
        assert_eq!(server.stats.snapshot().tcp_current_connections, 0);

        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        request(&mut stream, b"after reset\n", b"ECHO: after reset\n").await;
    }
}
