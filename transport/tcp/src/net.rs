//! Unified addressing and streams for TCP and Unix sockets.

use std::net::{AddrParseError, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::{fmt, fs, io};

use trunk_rpc_core::io::AsyncListener;
use trunk_rpc_core::runtime::{AsyncIO, AsyncSock};

/// `host:port` or an absolute unix socket path.
#[derive(Clone)]
pub enum SockAddr {
    Ip(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for SockAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Ip(a)),
            // not a literal ip, try the resolver and take the first hit
            Err(e) => match s.to_socket_addrs() {
                Ok(mut addrs) => match addrs.next() {
                    Some(a) => Ok(Self::Ip(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ip(a) => write!(f, "{}", a),
            Self::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A connected stream driven through shared-reference io, so one task can
/// read while another writes.
pub enum SockStream<IO: AsyncIO> {
    Tcp(IO::Sock<TcpStream>),
    Unix(IO::Sock<UnixStream>),
}

impl<IO: AsyncIO> SockStream<IO> {
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            Self::Tcp(s) => s.readable(|mut t| t.read(buf)).await,
            Self::Unix(s) => s.readable(|mut t| t.read(buf)).await,
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            Self::Tcp(s) => s.writable(|mut t| t.write(buf)).await,
            Self::Unix(s) => s.writable(|mut t| t.write(buf)).await,
        }
    }

    pub fn shutdown_write(&self) {
        let _ = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Write),
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Write),
        };
    }

    pub fn local_desc(&self) -> String {
        match self {
            Self::Tcp(s) => {
                s.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string())
            }
            Self::Unix(s) => s
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_string()),
        }
    }

    pub fn peer_desc(&self) -> String {
        match self {
            Self::Tcp(s) => {
                s.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string())
            }
            Self::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix".to_string()),
        }
    }
}

impl<IO: AsyncIO> fmt::Debug for SockStream<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.local_desc(), self.peer_desc())
    }
}

/// Listening socket over tcp or unix.
pub enum SockListener<IO: AsyncIO> {
    Tcp(IO::Sock<TcpListener>),
    Unix(IO::Sock<UnixListener>),
}

impl<IO: AsyncIO> AsyncListener for SockListener<IO> {
    type Conn = SockStream<IO>;

    fn bind(addr: &str) -> io::Result<Self> {
        match SockAddr::from_str(addr) {
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("addr {:?} invalid: {}", addr, e),
            )),
            Ok(SockAddr::Ip(sock_addr)) => {
                let l = TcpListener::bind(sock_addr)?;
                l.set_nonblocking(true)?;
                Ok(Self::Tcp(IO::register_read(l)?))
            }
            Ok(SockAddr::Unix(path)) => {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                let l = UnixListener::bind(&path)?;
                l.set_nonblocking(true)?;
                Ok(Self::Unix(IO::register_read(l)?))
            }
        }
    }

    async fn accept(&mut self) -> io::Result<SockStream<IO>> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.readable(|l| l.accept()).await?;
                stream.set_nonblocking(true)?;
                Ok(SockStream::Tcp(IO::register_rw(stream)?))
            }
            Self::Unix(l) => {
                let (stream, _) = l.readable(|l| l.accept()).await?;
                stream.set_nonblocking(true)?;
                Ok(SockStream::Unix(IO::register_rw(stream)?))
            }
        }
    }

    fn local_addr(&self) -> io::Result<String> {
        match self {
            Self::Tcp(l) => Ok(l.local_addr()?.to_string()),
            Self::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(p) => Ok(p.display().to_string()),
                    None => Err(io::ErrorKind::AddrNotAvailable.into()),
                }
            }
        }
    }
}

impl<IO: AsyncIO> fmt::Debug for SockListener<IO> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "listener {}", addr),
            Err(_) => write!(f, "listener unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse() {
        assert!(matches!("127.0.0.1:20880".parse::<SockAddr>(), Ok(SockAddr::Ip(_))));
        assert!(matches!("/tmp/test.sock".parse::<SockAddr>(), Ok(SockAddr::Unix(_))));
        assert!(matches!("localhost:80".parse::<SockAddr>(), Ok(SockAddr::Ip(_))));
        assert!("not an addr".parse::<SockAddr>().is_err());
    }
}
