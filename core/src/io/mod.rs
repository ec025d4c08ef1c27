//! Runtime-neutral byte io.
//!
//! Transports implement [AsyncRead]/[AsyncWrite] over whatever readiness
//! mechanism their runtime offers; the exchange codec only ever sees these
//! traits plus the buffered [BufStream] wrapper.

use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use std::{fmt, io};

use crate::runtime::AsyncIO;

mod buf;
pub use buf::BufStream;

/// AsyncRead for runtime adapters.
pub trait AsyncRead: Send {
    /// On ok, returns the bytes read; 0 means EOF.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Fill `buf` completely or fail with `UnexpectedEof`.
    fn read_exact<'a>(
        &'a mut self, mut buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            while !buf.is_empty() {
                match self.read(buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let rest = buf;
                        buf = &mut rest[n..];
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            if buf.is_empty() {
                Ok(())
            } else {
                Err(io::ErrorKind::UnexpectedEof.into())
            }
        }
    }

    /// Read at least `min_len` bytes into `buf`, possibly more, and return
    /// the total.
    fn read_at_least<'a>(
        &'a mut self, buf: &'a mut [u8], min_len: usize,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move {
            let mut got = 0;
            while got < min_len {
                match self.read(&mut buf[got..]).await {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => got += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(got)
        }
    }
}

/// AsyncWrite for runtime adapters.
pub trait AsyncWrite: Send {
    /// On ok, returns the bytes written.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn write_all<'a>(
        &'a mut self, mut buf: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            while !buf.is_empty() {
                match self.write(buf).await {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => buf = &buf[n..],
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
    }
}

pin_project! {
    /// Race an io future against a cancel signal (a timer, or the recv side
    /// of a close channel). The io future wins ties.
    pub struct Cancellable<F, C> {
        #[pin]
        future: F,
        #[pin]
        cancel: C,
    }
}

impl<F: Future + Send, C: Future + Send> Cancellable<F, C> {
    pub fn new(future: F, cancel: C) -> Self {
        Self { future, cancel }
    }
}

impl<F: Future + Send, C: Future + Send> Future for Cancellable<F, C> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(out) = this.future.poll(cx) {
            return Poll::Ready(Ok(out));
        }
        if this.cancel.poll(cx).is_ready() {
            return Poll::Ready(Err(()));
        }
        Poll::Pending
    }
}

/// Run an io future under a deadline; zero disables the deadline. The timer
/// error is folded into `io::ErrorKind::TimedOut` so call sites stay on one
/// error channel.
pub async fn timed<IO, F, R>(deadline: Duration, f: F) -> io::Result<R>
where
    IO: AsyncIO,
    F: Future<Output = io::Result<R>> + Send,
{
    if deadline.is_zero() {
        return f.await;
    }
    match IO::timeout(deadline, f).await {
        Ok(r) => r,
        Err(()) => Err(io::ErrorKind::TimedOut.into()),
    }
}

/// Transport server listener.
pub trait AsyncListener: Send + Sized + 'static + fmt::Debug {
    type Conn: Send + 'static + Sized;

    fn bind(addr: &str) -> io::Result<Self>;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    fn local_addr(&self) -> io::Result<String>;
}
