//! Reconnecting client.
//!
//! The driver runs forever. Each cycle picks a target at random, resolves
//! and dials it, serves the connection until it fails, then sleeps a
//! jittered backoff before the next cycle:
//!
//! ```text
//! pick target -> resolve -> dial -> [heartbeat + read loop] -> backoff -> ...
//! ```
//!
//! Nothing carries over from one cycle to the next: the address is resolved
//! again, the heartbeat starts from scratch, and a failed target is as
//! likely to be picked again as any other.

use crate::config::ClientConfig;
use crate::connection::deadline_after;
use crate::heartbeat::{send_frame, spawn_heartbeat};
use crate::protocol::{classify_reply, encode_line, Reply};
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Longest reply line accepted before the session is dropped.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Depth of the inbound and outbound message queues.
const CHANNEL_CAPACITY: usize = 1024;

/// Read-only list of `host:port` targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerList {
    targets: Vec<String>,
}

impl ServerList {
    /// Returns `None` for an empty list.
    pub fn new(targets: Vec<String>) -> Option<Self> {
        if targets.is_empty() {
            None
        } else {
            Some(Self { targets })
        }
    }

    /// One independent uniform draw.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &str {
        &self.targets[rng.gen_range(0..self.targets.len())]
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

/// Flat random delay in `[min, max)`.
pub fn jittered_backoff<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    rng.gen_range(min..max)
}

/// Why a connect/serve cycle ended.
#[derive(Debug)]
pub enum SessionError {
    /// Target name could not be resolved.
    Resolve(io::Error),
    /// Connect failed or timed out.
    Dial(io::Error),
    /// Server closed the connection.
    PeerClosed,
    /// Nothing received within the read deadline.
    ReadTimeout,
    /// Transport or framing failure while reading.
    Read(AnyDelimiterCodecError),
    /// An application message could not be written.
    Write(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Resolve(e) => write!(f, "resolve failed: {}", e),
            SessionError::Dial(e) => write!(f, "connection failed: {}", e),
            SessionError::PeerClosed => write!(f, "closed by server"),
            SessionError::ReadTimeout => write!(f, "read timed out"),
            SessionError::Read(e) => write!(f, "read failed: {}", e),
            SessionError::Write(e) => write!(f, "write failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Application side of a running client.
///
/// Messages sent while disconnected are held until the next connection.
/// Only application replies arrive on the inbound side; heartbeat replies
/// never do.
pub struct ClientHandle {
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
}

impl ClientHandle {
    /// Split into the outbound sender and the inbound receiver.
    pub fn into_parts(self) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        (self.outbound, self.inbound)
    }
}

/// Outer reconnect loop.
pub struct ReconnectDriver {
    config: ClientConfig,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
    rng: StdRng,
}

impl ReconnectDriver {
    pub fn new(config: ClientConfig) -> (Self, ClientHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let driver = Self {
            config,
            outbound: outbound_rx,
            inbound: inbound_tx,
            rng: StdRng::from_entropy(),
        };
        let handle = ClientHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        (driver, handle)
    }

    /// Connect, serve, back off, repeat. Never returns.
    pub async fn run(mut self) {
        loop {
            let target = self.config.servers.pick(&mut self.rng).to_string();

            let reason = self.connect_and_serve(&target).await;
            warn!(target = %target, reason = %reason, "Disconnected");

            let backoff = jittered_backoff(
                &mut self.rng,
                self.config.backoff_min,
                self.config.backoff_max,
            );
            info!(backoff_ms = backoff.as_millis() as u64, "Waiting before reconnect");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect_and_serve(&mut self, target: &str) -> SessionError {
        let stream = match self.connect(target).await {
            Ok(stream) => stream,
            Err(e) => return e,
        };

        info!(target = %target, "Connected");
        self.serve(stream).await
    }

    /// Resolve afresh and dial the first address, within the connect timeout.
    async fn connect(&self, target: &str) -> Result<TcpStream, SessionError> {
        let addr = lookup_host(target)
            .await
            .map_err(SessionError::Resolve)?
            .next()
            .ok_or_else(|| {
                SessionError::Resolve(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for '{}'", target),
                ))
            })?;

        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(SessionError::Dial(e)),
            Err(_) => Err(SessionError::Dial(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }

    /// Serve one connection until it fails.
    ///
    /// The socket halves are owned by this call and released when it returns.
    async fn serve(&mut self, stream: TcpStream) -> SessionError {
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));
        // Byte framing: replies need not be UTF-8.
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_LENGTH);
        let mut lines = FramedRead::new(read_half, codec);

        let stop = CancellationToken::new();
        let heartbeat = spawn_heartbeat(Arc::clone(&writer), self.config.heartbeat, stop.clone());
        let stop_guard = stop.drop_guard();

        let reason = self.read_loop(&mut lines, &writer).await;

        drop(stop_guard);
        let _ = heartbeat.await;
        reason
    }

    async fn read_loop(
        &mut self,
        lines: &mut FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
        writer: &Mutex<OwnedWriteHalf>,
    ) -> SessionError {
        let read_timeout = self.config.read_timeout;
        let mut deadline = deadline_after(Instant::now(), read_timeout);

        loop {
            tokio::select! {
                line = lines.next() => match line {
                    None => return SessionError::PeerClosed,
                    Some(Err(e)) => return SessionError::Read(e),
                    Some(Ok(line)) => {
                        deadline = deadline_after(Instant::now(), read_timeout);
                        self.deliver(&line).await;
                    }
                },

                _ = tokio::time::sleep_until(deadline) => return SessionError::ReadTimeout,

                Some(message) = self.outbound.recv() => {
                    let frame = encode_line(&message);
                    if let Err(e) = send_frame(writer, &frame, self.config.write_timeout).await {
                        return SessionError::Write(e);
                    }
                }
            }
        }
    }

    /// Hand an application reply to the caller. Invalid UTF-8 is replaced
    /// rather than treated as a broken session.
    async fn deliver(&self, line: &[u8]) {
        match classify_reply(line) {
            Reply::Pong => trace!("Heartbeat acknowledged"),
            Reply::Data(data) => {
                let data = String::from_utf8_lossy(data).into_owned();
                if self.inbound.send(data).await.is_err() {
                    debug!("Reply dropped, no receiver");
                }
            }
        }
    }
}
