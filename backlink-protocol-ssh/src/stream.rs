use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// Read-deadline policy for one connection. The deadline starts out
/// generous (`timeout` minutes) so a human can type a key passphrase
/// during the handshake, and drops to `2 * timeout` seconds once
/// authentication completes. A `timeout` of zero disables it.
pub struct DeadlineControl {
    current_millis: AtomicU64,
    active_millis: u64,
}

impl DeadlineControl {
    pub fn new(timeout_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            current_millis: AtomicU64::new(timeout_secs * 60 * 1000),
            active_millis: timeout_secs * 2 * 1000,
        })
    }

    /// Switch to the post-authentication deadline.
    pub fn activate(&self) {
        self.current_millis
            .store(self.active_millis, Ordering::Relaxed);
    }

    fn current(&self) -> Option<Duration> {
        match self.current_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }
}

/// Wraps the accepted TCP stream. Every successful read re-arms an
/// absolute deadline at `now + T`; an expired deadline surfaces as a
/// `TimedOut` read error, which tears the SSH session down.
///
/// The wrapper also records the peer's `SSH-…` identification line
/// while it passes through, since the transport library does not
/// surface the client version.
pub struct DeadlineStream<S> {
    inner: S,
    control: Arc<DeadlineControl>,
    deadline: Option<Pin<Box<Sleep>>>,
    banner: BannerCapture,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, control: Arc<DeadlineControl>, banner: Arc<OnceLock<String>>) -> Self {
        Self {
            inner,
            control,
            deadline: None,
            banner: BannerCapture {
                slot: banner,
                pending: Vec::new(),
                done: false,
            },
        }
    }

    fn rearm(&mut self) {
        self.deadline = self
            .control
            .current()
            .map(|timeout| Box::pin(sleep_until(Instant::now() + timeout)));
    }
}

impl<S> std::fmt::Debug for DeadlineStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeadlineStream")
    }
}

struct BannerCapture {
    slot: Arc<OnceLock<String>>,
    pending: Vec<u8>,
    done: bool,
}

impl BannerCapture {
    fn observe(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        self.pending.extend_from_slice(bytes);

        if let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(&self.pending[..end])
                .trim_end_matches('\r')
                .to_string();
            let _ = self.slot.set(line);
            self.done = true;
            self.pending = Vec::new();
        } else if self.pending.len() > 256 {
            // Not a plausible identification line; stop buffering.
            self.done = true;
            self.pending = Vec::new();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled_before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = &buf.filled()[filled_before..];
                if !read.is_empty() {
                    self.banner.observe(read);
                    self.rearm();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if self.deadline.is_none() {
                    self.rearm();
                }
                if let Some(deadline) = self.deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection idle deadline expired",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
