//! # trunk-rpc-tokio
//!
//! Tokio adapter for the `trunk-rpc` runtime abstraction. Sockets are
//! handed over as non-blocking std fds and driven through
//! `tokio::io::unix::AsyncFd` readiness.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use trunk_rpc_core::io::timed;
use trunk_rpc_core::runtime::{AsyncIO, AsyncSock, TimeInterval};

/// Assign this type to the `IO` associated type. Holds an optional runtime
/// handle; without one, spawning targets the ambient tokio runtime.
pub struct TokioRT(Option<tokio::runtime::Handle>);

impl TokioRT {
    /// Spawn onto whatever tokio runtime is current at call time.
    #[inline]
    pub fn new_global() -> Self {
        Self(None)
    }

    #[inline]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self(Some(handle))
    }
}

impl AsyncIO for TokioRT {
    type Interval = TokioInterval;

    type Sock<T: AsRawFd + AsFd + Send + Sync + 'static> = TokioSock<T>;

    #[inline(always)]
    fn sleep(d: Duration) -> impl Future + Send {
        tokio::time::sleep(d)
    }

    #[inline(always)]
    fn tick(d: Duration) -> Self::Interval {
        let start = tokio::time::Instant::now() + d;
        TokioInterval(tokio::time::interval_at(start, d))
    }

    async fn connect_tcp(addr: &SocketAddr, timeout: Duration) -> io::Result<Self::Sock<TcpStream>> {
        let stream = timed::<Self, _, _>(timeout, tokio::net::TcpStream::connect(*addr)).await?;
        // into_std keeps the socket non-blocking
        Self::register_rw(stream.into_std()?)
    }

    async fn connect_unix(path: &Path, timeout: Duration) -> io::Result<Self::Sock<UnixStream>> {
        let stream = timed::<Self, _, _>(timeout, tokio::net::UnixStream::connect(path)).await?;
        Self::register_rw(stream.into_std()?)
    }

    #[inline(always)]
    fn register_read<T: AsRawFd + AsFd + Send + Sync + 'static>(
        fd: T,
    ) -> io::Result<Self::Sock<T>> {
        let inner = tokio::io::unix::AsyncFd::with_interest(fd, tokio::io::Interest::READABLE)?;
        Ok(TokioSock(inner))
    }

    #[inline(always)]
    fn register_rw<T: AsRawFd + AsFd + Send + Sync + 'static>(fd: T) -> io::Result<Self::Sock<T>> {
        let interest = tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE;
        Ok(TokioSock(tokio::io::unix::AsyncFd::with_interest(fd, interest)?))
    }

    #[inline]
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        match self.0.as_ref() {
            Some(handle) => {
                handle.spawn(f);
            }
            None => {
                tokio::spawn(f);
            }
        }
    }
}

pub struct TokioInterval(tokio::time::Interval);

impl TimeInterval for TokioInterval {
    #[inline]
    fn poll_tick(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Instant> {
        match self.get_mut().0.poll_tick(cx) {
            Poll::Ready(at) => Poll::Ready(at.into_std()),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TokioSock<T: AsRawFd + AsFd + Send + Sync + 'static>(tokio::io::unix::AsyncFd<T>);

impl<T: AsRawFd + AsFd + Send + Sync + 'static> AsyncSock<T> for TokioSock<T> {
    #[inline(always)]
    async fn readable<R>(&self, f: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.async_io(tokio::io::Interest::READABLE, f).await
    }

    #[inline(always)]
    async fn writable<R>(&self, f: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.async_io(tokio::io::Interest::WRITABLE, f).await
    }
}

impl<T: AsRawFd + AsFd + Send + Sync + 'static> Deref for TokioSock<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.0.get_ref()
    }
}
