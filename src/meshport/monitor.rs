use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared byte counters for one monitored stream.
///
/// Counts are monotone non-decreasing; reads never block writes.
#[derive(Debug, Default)]
pub struct MonitorCounters {
    read: AtomicU64,
    written: AtomicU64,
}

impl MonitorCounters {
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }
}

pin_project! {
    /// Wraps a duplex byte stream and counts the bytes moved through it.
    ///
    /// The counter handle stays readable after the stream moves into a copy
    /// task, which is how the per-connection sampler observes progress.
    pub struct ConnMonitor<S> {
        #[pin]
        inner: S,
        counters: Arc<MonitorCounters>,
    }
}

impl<S> ConnMonitor<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counters: Arc::new(MonitorCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<MonitorCounters> {
        self.counters.clone()
    }
}

impl<S: AsyncRead> AsyncRead for ConnMonitor<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.counters.add_read(n as u64);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for ConnMonitor<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.counters.add_written(n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
