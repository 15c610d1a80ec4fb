//! Client-side heartbeat sender.
//!
//! The server half of the heartbeat is passive and lives in the connection
//! supervisor (`PING` in, `PONG` out). The client half is an independent
//! task per connection that writes `PING` on a fixed cadence. It never reads:
//! the session's read loop discards the `PONG` replies and is the one that
//! notices a dead peer. A failed send simply ends the task.

use crate::connection::deadline_after;
use crate::protocol::PING_FRAME;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Heartbeat cadence and per-send deadline.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub write_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Write one frame through the shared writer, lock wait included in the
/// deadline.
pub async fn send_frame<W>(writer: &Mutex<W>, frame: &[u8], deadline: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let send = async {
        let mut writer = writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    };

    match tokio::time::timeout(deadline, send).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline elapsed",
        )),
    }
}

/// Spawn the heartbeat task for one connection.
///
/// The first `PING` goes out one interval after the call. The task ends when
/// `stop` is cancelled or a send fails.
pub fn spawn_heartbeat<W>(
    writer: Arc<Mutex<W>>,
    config: HeartbeatConfig,
    stop: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let start = deadline_after(Instant::now(), config.interval);
        let mut ticker = tokio::time::interval_at(start, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = send_frame(&writer, PING_FRAME, config.write_timeout).await {
                debug!(error = %e, "Heartbeat send failed");
                return;
            }
            trace!("Heartbeat sent");
        }
    })
}
