//! # trunk-rpc-tcp
//!
//! TCP and Unix-socket frame transport for `trunk-rpc`.
//!
//! A [TcpTransport] splits one socket into a buffered read half and a
//! buffered write half. The halves sit in `UnsafeCell`s: the exchange
//! channel guarantees exactly one reading task and one writing task per
//! connection, which is the whole safety argument for the `Send`/`Sync`
//! assertions below.

#[macro_use]
extern crate captains_log;

mod net;
pub use net::{SockAddr, SockListener, SockStream};

use std::cell::UnsafeCell;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use captains_log::filter::LogFilter;
use crossfire::MAsyncRx;

use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::io::{timed, AsyncRead, AsyncWrite, BufStream, Cancellable};
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_exchange::proto::{self, Message};
use trunk_rpc_exchange::transport::{ConnOptions, FrameTransport};

/// Borrow-by-Arc view of one socket direction, giving [BufStream] the
/// owned `&mut self` io it wants while the fd itself is shared.
pub struct SockHalf<IO: AsyncIO>(Arc<SockStream<IO>>);

impl<IO: AsyncIO> AsyncRead for SockHalf<IO> {
    #[inline(always)]
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        self.0.read(buf)
    }
}

impl<IO: AsyncIO> AsyncWrite for SockHalf<IO> {
    #[inline(always)]
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        self.0.write(buf)
    }
}

impl<IO: AsyncIO> fmt::Debug for SockHalf<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub struct TcpTransport<IO: AsyncIO> {
    sock: Arc<SockStream<IO>>,
    rd: UnsafeCell<BufStream<SockHalf<IO>>>,
    wr: UnsafeCell<BufStream<SockHalf<IO>>>,
    encode_buf: UnsafeCell<Vec<u8>>,
    local: String,
    peer: String,
    write_timeout: Duration,
    payload_limit: usize,
    sid: u8,
}

// One task reads through rd, one task writes through wr + encode_buf; the
// exchange channel upholds that split.
unsafe impl<IO: AsyncIO> Send for TcpTransport<IO> {}
unsafe impl<IO: AsyncIO> Sync for TcpTransport<IO> {}

impl<IO: AsyncIO> fmt::Debug for TcpTransport<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp {}->{}", self.local, self.peer)
    }
}

impl<IO: AsyncIO> TcpTransport<IO> {
    fn wrap(sock: SockStream<IO>, opt: &ConnOptions) -> Self {
        let sock = Arc::new(sock);
        let local = sock.local_desc();
        let peer = sock.peer_desc();
        Self {
            rd: UnsafeCell::new(BufStream::new(SockHalf(sock.clone()), opt.buf_size)),
            wr: UnsafeCell::new(BufStream::new(SockHalf(sock.clone()), opt.buf_size)),
            encode_buf: UnsafeCell::new(Vec::with_capacity(512)),
            sock,
            local,
            peer,
            write_timeout: opt.write_timeout,
            payload_limit: opt.payload_limit,
            sid: opt.serialization_id,
        }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn reader_mut(&self) -> &mut BufStream<SockHalf<IO>> {
        unsafe { &mut *self.rd.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn writer_mut(&self) -> &mut BufStream<SockHalf<IO>> {
        unsafe { &mut *self.wr.get() }
    }

    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    fn encode_buf_mut(&self) -> &mut Vec<u8> {
        unsafe { &mut *self.encode_buf.get() }
    }
}

impl<IO: AsyncIO> FrameTransport<IO> for TcpTransport<IO> {
    type Listener = SockListener<IO>;

    async fn connect(addr: &str, opt: &ConnOptions) -> Result<Self, RemotingError> {
        let sock_addr = SockAddr::from_str(addr).map_err(|e| RemotingError::Connect {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let stream = match sock_addr {
            SockAddr::Ip(a) => match IO::connect_tcp(&a, opt.connect_timeout).await {
                Ok(s) => SockStream::Tcp(s),
                Err(e) => {
                    warn!("cannot connect {}: {}", addr, e);
                    return Err(RemotingError::Connect {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    });
                }
            },
            SockAddr::Unix(p) => match IO::connect_unix(&p, opt.connect_timeout).await {
                Ok(s) => SockStream::Unix(s),
                Err(e) => {
                    warn!("cannot connect {}: {}", addr, e);
                    return Err(RemotingError::Connect {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    });
                }
            },
        };
        Ok(Self::wrap(stream, opt))
    }

    fn accepted(stream: SockStream<IO>, opt: &ConnOptions) -> io::Result<Self> {
        Ok(Self::wrap(stream, opt))
    }

    #[inline]
    fn local_addr(&self) -> &str {
        &self.local
    }

    #[inline]
    fn peer_addr(&self) -> &str {
        &self.peer
    }

    async fn read_message(
        &self, logger: &Arc<LogFilter>, abort: &MAsyncRx<()>,
    ) -> Result<Option<Message>, RemotingError> {
        let reader = self.reader_mut();
        let decode = proto::read_message(reader, self.sid, self.payload_limit);
        match Cancellable::new(decode, abort.recv()).await {
            Ok(Ok(msg)) => {
                logger_trace!(logger, "{:?} recv {:?}", self, msg);
                Ok(Some(msg))
            }
            Ok(Err(e)) => {
                logger_debug!(logger, "{:?} read failed: {}", self, e);
                Err(e)
            }
            Err(()) => Ok(None),
        }
    }

    async fn write_message(
        &self, logger: &Arc<LogFilter>, msg: &Message, flush: bool,
    ) -> io::Result<()> {
        let buf = self.encode_buf_mut();
        buf.clear();
        proto::encode_into(msg, self.sid, self.payload_limit, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let writer = self.writer_mut();
        timed::<IO, _, _>(self.write_timeout, writer.write_all(buf)).await?;
        logger_trace!(logger, "{:?} sent {:?}", self, msg);
        if flush {
            self.flush(logger).await?;
        }
        Ok(())
    }

    async fn flush(&self, logger: &Arc<LogFilter>) -> io::Result<()> {
        let writer = self.writer_mut();
        if let Err(e) = timed::<IO, _, _>(self.write_timeout, writer.flush()).await {
            logger_warn!(logger, "{:?} flush failed: {}", self, e);
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let writer = self.writer_mut();
        let _ = timed::<IO, _, _>(self.write_timeout, writer.flush()).await;
        self.sock.shutdown_write();
    }
}
