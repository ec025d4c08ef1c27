//! The runtime seam: everything the stack needs from an async runtime.
//!
//! Adapters are provided as sub-crates:
//!
//! - [trunk-rpc-tokio](https://docs.rs/trunk-rpc-tokio)
//! - [trunk-rpc-smol](https://docs.rs/trunk-rpc-smol)
//!
//! The io model is readiness-based over non-blocking std sockets: the
//! adapter wraps an fd into [AsyncIO::Sock] and transports drive reads and
//! writes through closures, which keeps the read and write halves
//! independently usable from two tasks.

use crate::io::Cancellable;
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

/// A non-blocking fd registered with the runtime's reactor.
pub trait AsyncSock<T: AsRawFd + AsFd + Send + Sync + 'static>:
    Send + Sync + 'static + Deref<Target = T>
{
    /// Run `f` when the fd is readable, retrying on WouldBlock.
    fn readable<R>(
        &self, f: impl FnMut(&T) -> io::Result<R> + Send,
    ) -> impl Future<Output = io::Result<R>> + Send;

    /// Run `f` when the fd is writable, retrying on WouldBlock.
    fn writable<R>(
        &self, f: impl FnMut(&T) -> io::Result<R> + Send,
    ) -> impl Future<Output = io::Result<R>> + Send;
}

/// The async runtime interface.
pub trait AsyncIO: Send + Sync + Sized + 'static {
    type Interval: TimeInterval;

    type Sock<T: AsRawFd + AsFd + Send + Sync + 'static>: AsyncSock<T>;

    fn sleep(d: Duration) -> impl Future + Send;

    fn tick(d: Duration) -> Self::Interval;

    #[inline]
    fn timeout<F>(d: Duration, f: F) -> impl Future<Output = Result<F::Output, ()>> + Send
    where
        F: Future + Send,
    {
        Cancellable::new(f, Self::sleep(d))
    }

    fn connect_tcp(
        addr: &SocketAddr, timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Sock<TcpStream>>> + Send;

    fn connect_unix(
        path: &Path, timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Sock<UnixStream>>> + Send;

    /// Register an fd for read readiness only (listeners).
    /// The fd must already be non-blocking.
    fn register_read<T: AsRawFd + AsFd + Send + Sync + 'static>(fd: T)
    -> io::Result<Self::Sock<T>>;

    /// Register an fd for read and write readiness (streams).
    /// The fd must already be non-blocking.
    fn register_rw<T: AsRawFd + AsFd + Send + Sync + 'static>(fd: T) -> io::Result<Self::Sock<T>>;

    /// Spawn a task that runs to completion on its own. An adapter may
    /// target a global runtime or an owned executor handle.
    fn spawn_detach<F, R>(&self, f: F)
    where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static;
}

/// Universal ticker interface over the runtimes' interval timers.
pub trait TimeInterval: Unpin + Send {
    fn poll_tick(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Instant>;
}
