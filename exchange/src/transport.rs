//! The seam between the exchange layer and byte transports.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use captains_log::filter::LogFilter;
use crossfire::MAsyncRx;

use crate::proto::Message;
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::io::AsyncListener;
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::{params, serialization_id, Endpoint};

/// Per-connection options derived once from an [Endpoint]. A resetting URL
/// update builds a fresh value; live connections keep the options they were
/// created with.
#[derive(Clone, Debug)]
pub struct ConnOptions {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub payload_limit: usize,
    pub serialization_id: u8,
    pub buf_size: usize,
}

impl ConnOptions {
    pub fn derive(url: &Endpoint) -> Result<Self, RemotingError> {
        let codec = url.codec_name();
        if codec != params::DEFAULT_CODEC {
            return Err(RemotingError::Codec(format!("unknown codec {:?}", codec)));
        }
        let serialization = url.serialization();
        let sid = serialization_id(serialization).ok_or_else(|| {
            RemotingError::Codec(format!("unknown serialization {:?}", serialization))
        })?;
        Ok(Self {
            connect_timeout: url.connect_timeout(),
            write_timeout: url.write_timeout(),
            payload_limit: url.payload_limit(),
            serialization_id: sid,
            buf_size: url.buffer_size(),
        })
    }
}

/// A framed duplex connection.
///
/// Read and write are independent halves: exactly one task may read and one
/// may write concurrently, which is how [crate::ExchangeChannel] drives it.
pub trait FrameTransport<IO: AsyncIO>: fmt::Debug + Send + Sync + Sized + 'static {
    type Listener: AsyncListener;

    fn connect(
        addr: &str, opt: &ConnOptions,
    ) -> impl Future<Output = Result<Self, RemotingError>> + Send;

    /// Wrap a stream handed out by the listener.
    fn accepted(
        stream: <Self::Listener as AsyncListener>::Conn, opt: &ConnOptions,
    ) -> io::Result<Self>;

    fn local_addr(&self) -> &str;

    fn peer_addr(&self) -> &str;

    /// Read one message; `Ok(None)` when `abort` fired first.
    fn read_message(
        &self, logger: &Arc<LogFilter>, abort: &MAsyncRx<()>,
    ) -> impl Future<Output = Result<Option<Message>, RemotingError>> + Send;

    /// Write one message into the send buffer, flushing when asked.
    fn write_message(
        &self, logger: &Arc<LogFilter>, msg: &Message, flush: bool,
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&self, logger: &Arc<LogFilter>) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush best-effort and shut the write direction down.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive() {
        let url: Endpoint = "127.0.0.1:1/svc?payload=1024&connect.timeout=100".parse().unwrap();
        let opt = ConnOptions::derive(&url).expect("derive");
        assert_eq!(opt.payload_limit, 1024);
        assert_eq!(opt.connect_timeout, Duration::from_millis(100));
        assert_eq!(opt.serialization_id, 2);
    }

    #[test]
    fn test_derive_rejects_unknown_extensions() {
        let url: Endpoint = "127.0.0.1:1/svc?serialization=hessian2".parse().unwrap();
        assert!(matches!(ConnOptions::derive(&url), Err(RemotingError::Codec(_))));
        let url: Endpoint = "127.0.0.1:1/svc?codec=telnetonly".parse().unwrap();
        assert!(matches!(ConnOptions::derive(&url), Err(RemotingError::Codec(_))));
    }
}
