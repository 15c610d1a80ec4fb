//! Per-connection supervisor.
//!
//! Each admitted connection is driven by a small state machine:
//!
//! ```text
//! Active --(read/write failure, idle timeout, TTL)--> Closing(cause) --> Closed
//! ```
//!
//! While `Active` the supervisor alternates strictly between reading one
//! line and writing its reply. A TTL watchdog runs alongside it. When the
//! connection reaches its maximum age the watchdog trips a cancellation
//! token, which the pending (or next) read observes as an already-elapsed
//! deadline. Teardown therefore always goes through the read-failure path.

use crate::admission::AdmissionSlot;
use crate::protocol::{classify_request, encode_reply};
use crate::stats::Stats;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const LINE_CAPACITY: usize = 256;

/// Stand-in for "never" when a configured duration does not fit in an
/// `Instant`. Roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + timeout`, saturated to a far-future instant instead of
/// overflowing when `timeout` is huge.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Timeouts applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Idle read deadline, reset before every read.
    pub read_timeout: Duration,
    /// Deadline for writing and flushing one reply.
    pub write_timeout: Duration,
    /// Maximum connection lifetime regardless of activity.
    pub max_conn_age: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            max_conn_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Maximum connection age reached.
    TtlExpired,
    /// No data within the read deadline.
    IdleTimeout,
    /// Peer closed its side of the stream.
    PeerClosed,
    /// Transport failure while reading.
    IoError,
    /// Reply could not be written before its deadline. Never retried.
    WriteError,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseCause::TtlExpired => "ttl expired",
            CloseCause::IdleTimeout => "idle timeout",
            CloseCause::PeerClosed => "peer closed",
            CloseCause::IoError => "i/o error",
            CloseCause::WriteError => "write error",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    Closing(CloseCause),
    Closed,
}

/// Resources held for as long as an admitted connection is being handled.
///
/// Creating a lease counts the connection as open; dropping it releases the
/// admission slot and counts the connection as closed. Both happen exactly
/// once however the handler ends.
#[derive(Debug)]
pub struct ConnectionLease {
    _slot: AdmissionSlot,
    stats: Arc<Stats>,
}

impl ConnectionLease {
    pub fn new(slot: AdmissionSlot, stats: Arc<Stats>) -> Self {
        stats.connection_opened();
        Self { _slot: slot, stats }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

/// A single supervised connection.
///
/// Generic over the byte stream so the state machine can be driven by a
/// scripted stream in tests.
pub struct Connection<S> {
    reader: Option<BufReader<ReadHalf<S>>>,
    writer: Option<BufWriter<WriteHalf<S>>>,
    peer: SocketAddr,
    created_at: Instant,
    ttl_deadline: Instant,
    config: ConnectionConfig,
    state: ConnState,
    /// Tripped by the TTL watchdog.
    expired: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap a freshly accepted stream. Starts `Active`.
    pub fn new(stream: S, peer: SocketAddr, config: ConnectionConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let created_at = Instant::now();

        Self {
            reader: Some(BufReader::new(reader)),
            writer: Some(BufWriter::new(writer)),
            peer,
            created_at,
            ttl_deadline: deadline_after(created_at, config.max_conn_age),
            config,
            state: ConnState::Active,
            expired: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn ttl_deadline(&self) -> Instant {
        self.ttl_deadline
    }

    /// Token the TTL watchdog cancels to force the read deadline into the past.
    pub fn expiry_token(&self) -> CancellationToken {
        self.expired.clone()
    }

    /// Run the read/reply cycle until the connection leaves `Active`.
    pub async fn serve(&mut self) -> CloseCause {
        let mut line = Vec::with_capacity(LINE_CAPACITY);

        let cause = loop {
            line.clear();

            if let Err(cause) = self.read_request(&mut line).await {
                break cause;
            }

            let request = classify_request(&line);
            trace!(
                peer = %self.peer,
                line = %String::from_utf8_lossy(&line).trim_end(),
                "Request"
            );
            let reply = encode_reply(&request);

            if let Err(cause) = self.write_reply(&reply).await {
                break cause;
            }
        };

        self.state = ConnState::Closing(cause);
        cause
    }

    /// Close the stream. Idempotent; only the first call has an effect.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        // Dropping both halves releases the socket.
        self.reader = None;
        self.writer = None;
        self.state = ConnState::Closed;
    }

    /// Read one complete line. A fragment cut off by end of stream is not a
    /// line and is discarded.
    async fn read_request(&mut self, line: &mut Vec<u8>) -> Result<(), CloseCause> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(CloseCause::IoError);
        };
        let deadline = deadline_after(Instant::now(), self.config.read_timeout);

        tokio::select! {
            biased;

            _ = self.expired.cancelled() => Err(CloseCause::TtlExpired),

            read = tokio::time::timeout_at(deadline, reader.read_until(b'\n', line)) => match read {
                Err(_) => Err(CloseCause::IdleTimeout),
                Ok(Ok(0)) => Err(CloseCause::PeerClosed),
                Ok(Ok(_)) if !line.ends_with(b"\n") => {
                    trace!(peer = %self.peer, bytes = line.len(), "Partial line at end of stream");
                    Err(CloseCause::PeerClosed)
                }
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => {
                    trace!(peer = %self.peer, error = %e, "Read failed");
                    Err(CloseCause::IoError)
                }
            },
        }
    }

    async fn write_reply(&mut self, reply: &[u8]) -> Result<(), CloseCause> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(CloseCause::WriteError);
        };

        let write = async {
            writer.write_all(reply).await?;
            writer.flush().await
        };

        match tokio::time::timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                trace!(peer = %self.peer, error = %e, "Write failed");
                Err(CloseCause::WriteError)
            }
            Err(_) => Err(CloseCause::WriteError),
        }
    }
}

/// Start the TTL watchdog for a connection.
///
/// On expiry the watchdog cancels `expired`, unless `done` has already been
/// cancelled by the connection finishing some other way.
pub fn spawn_ttl_watchdog(
    deadline: Instant,
    expired: CancellationToken,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if !done.is_cancelled() {
                    expired.cancel();
                }
            }
        }
    })
}

/// Handle one admitted connection from `Active` through `Closed`.
pub async fn supervise<S>(
    stream: S,
    peer: SocketAddr,
    config: ConnectionConfig,
    lease: ConnectionLease,
) -> CloseCause
where
    S: AsyncRead + AsyncWrite,
{
    let mut conn = Connection::new(stream, peer, config);

    let done = CancellationToken::new();
    let watchdog = spawn_ttl_watchdog(conn.ttl_deadline(), conn.expiry_token(), done.clone());
    // Stops the watchdog even if this future is dropped mid-flight.
    let done_guard = done.drop_guard();

    let cause = conn.serve().await;
    trace!(peer = %peer, state = ?conn.state(), "Connection closing");

    match cause {
        CloseCause::IdleTimeout => lease.stats().record_idle_timeout(),
        CloseCause::TtlExpired => lease.stats().record_ttl_expiry(),
        _ => {}
    }

    conn.close();
    drop(done_guard);
    let _ = watchdog.await;

    debug!(
        peer = %peer,
        cause = %cause,
        age_ms = conn.created_at.elapsed().as_millis() as u64,
        "Connection closed"
    );

    drop(lease);
    cause
}
