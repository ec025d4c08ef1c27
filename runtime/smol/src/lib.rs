//! # trunk-rpc-smol
//!
//! smol / async-io adapter for the `trunk-rpc` runtime abstraction.

use async_executor::Executor;
use async_io::{Async, Timer};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use trunk_rpc_core::io::timed;
use trunk_rpc_core::runtime::{AsyncIO, AsyncSock, TimeInterval};

/// Assign this type to the `IO` associated type. Holds an optional owned
/// executor; without one, spawning targets the global smol executor.
pub struct SmolRT(Option<Arc<Executor<'static>>>);

impl SmolRT {
    #[inline]
    pub fn new_global() -> Self {
        Self(None)
    }

    #[inline]
    pub fn new(executor: Arc<Executor<'static>>) -> Self {
        Self(Some(executor))
    }
}

impl AsyncIO for SmolRT {
    type Interval = SmolInterval;

    type Sock<T: AsRawFd + AsFd + Send + Sync + 'static> = SmolSock<T>;

    #[inline(always)]
    fn sleep(d: Duration) -> impl Future + Send {
        Timer::after(d)
    }

    #[inline(always)]
    fn tick(d: Duration) -> Self::Interval {
        SmolInterval(Timer::interval_at(Instant::now() + d, d))
    }

    async fn connect_tcp(addr: &SocketAddr, timeout: Duration) -> io::Result<Self::Sock<TcpStream>> {
        let addr = *addr;
        let stream = timed::<Self, _, _>(timeout, Async::<TcpStream>::connect(addr)).await?;
        // into_inner keeps the socket non-blocking
        Self::register_rw(stream.into_inner()?)
    }

    async fn connect_unix(path: &Path, timeout: Duration) -> io::Result<Self::Sock<UnixStream>> {
        let path = path.to_path_buf();
        let stream = timed::<Self, _, _>(timeout, Async::<UnixStream>::connect(path)).await?;
        Self::register_rw(stream.into_inner()?)
    }

    #[inline(always)]
    fn register_read<T: AsRawFd + AsFd + Send + Sync + 'static>(
        fd: T,
    ) -> io::Result<Self::Sock<T>> {
        Ok(SmolSock(Async::new(fd)?))
    }

    #[inline(always)]
    fn register_rw<T: AsRawFd + AsFd + Send + Sync + 'static>(fd: T) -> io::Result<Self::Sock<T>> {
        Ok(SmolSock(Async::new(fd)?))
    }

    #[inline]
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        match self.0.as_ref() {
            Some(executor) => executor.spawn(f).detach(),
            None => smol::spawn(f).detach(),
        }
    }
}

pub struct SmolInterval(Timer);

impl TimeInterval for SmolInterval {
    #[inline]
    fn poll_tick(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Instant> {
        use futures::stream::StreamExt;
        match self.get_mut().0.poll_next_unpin(cx) {
            Poll::Ready(Some(at)) => Poll::Ready(at),
            Poll::Ready(None) => unreachable!("interval timer never terminates"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct SmolSock<T: AsRawFd + AsFd + Send + Sync + 'static>(Async<T>);

impl<T: AsRawFd + AsFd + Send + Sync + 'static> AsyncSock<T> for SmolSock<T> {
    #[inline(always)]
    async fn readable<R>(&self, f: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.read_with(f).await
    }

    #[inline(always)]
    async fn writable<R>(&self, f: impl FnMut(&T) -> io::Result<R> + Send) -> io::Result<R> {
        self.0.write_with(f).await
    }
}

impl<T: AsRawFd + AsFd + Send + Sync + 'static> Deref for SmolSock<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.0.get_ref()
    }
}
