use std::future::Future;
use std::{fmt, io};

use super::{AsyncRead, AsyncWrite};

/// A duplex buffered stream.
///
/// Reads are served from an internal block buffer so header-sized
/// `read_exact` calls do not hit the socket one syscall each; writes
/// accumulate until [BufStream::flush] or until a write no longer fits.
/// Oversized reads and writes bypass the buffers entirely.
pub struct BufStream<T: AsyncRead + AsyncWrite> {
    inner: T,
    rbuf: Vec<u8>,
    rpos: usize,
    rend: usize,
    wbuf: Vec<u8>,
}

impl<T: AsyncRead + AsyncWrite> BufStream<T> {
    pub fn new(inner: T, buf_size: usize) -> Self {
        assert!(buf_size > 0, "buf_size must be > 0");
        Self { inner, rbuf: vec![0; buf_size], rpos: 0, rend: 0, wbuf: Vec::with_capacity(buf_size) }
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        if !self.wbuf.is_empty() {
            self.inner.write_all(&self.wbuf).await?;
            self.wbuf.clear();
        }
        Ok(())
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.rpos = 0;
        self.rend = self.inner.read(&mut self.rbuf).await?;
        Ok(self.rend)
    }
}

impl<T: AsyncRead + AsyncWrite> AsyncRead for BufStream<T> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            if self.rpos < self.rend {
                let n = buf.len().min(self.rend - self.rpos);
                buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
                self.rpos += n;
                return Ok(n);
            }
            if buf.len() >= self.rbuf.len() {
                // large read, skip the copy
                return self.inner.read(buf).await;
            }
            let got = self.fill().await?;
            let n = buf.len().min(got);
            buf[..n].copy_from_slice(&self.rbuf[..n]);
            self.rpos = n;
            Ok(n)
        }
    }
}

impl<T: AsyncRead + AsyncWrite> AsyncWrite for BufStream<T> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            if buf.len() >= self.wbuf.capacity() {
                self.flush().await?;
                return self.inner.write(buf).await;
            }
            if self.wbuf.capacity() - self.wbuf.len() < buf.len() {
                self.flush().await?;
            }
            self.wbuf.extend_from_slice(buf);
            Ok(buf.len())
        }
    }
}

impl<T: AsyncRead + AsyncWrite + fmt::Debug> fmt::Debug for BufStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.inner.fmt(f)
    }
}
