//! Byte pumps moving one direction of a relay session.
//!
//! Each chunk is written and flushed before the next read, so the pumps add
//! no buffering beyond their own fixed-size buffer.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to gateway.
    Upload,
    /// Gateway to client.
    Download,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Last time either pump of a session moved bytes.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_millis
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last transfer.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    direction: Direction,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        metrics::record_relay_bytes(direction.label(), n);
        total += n as u64;
    }
}

/// Client to gateway.
///
/// On end-of-stream or error only the gateway write side is shut down; the
/// download pump keeps delivering whatever the gateway still has to say.
pub async fn upload<R, W>(
    mut client: R,
    mut server: W,
    buffer_size: usize,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_chunks(&mut client, &mut server, buffer_size, Direction::Upload, activity).await;
    let _ = server.shutdown().await;
    result
}

/// Gateway to client. Shuts the client write side down when done.
pub async fn download<R, W>(
    mut server: R,
    mut client: W,
    buffer_size: usize,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_chunks(&mut server, &mut client, buffer_size, Direction::Download, activity).await;
    let _ = client.shutdown().await;
    result
}
