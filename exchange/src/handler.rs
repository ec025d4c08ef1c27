//! The upward-facing handler interface of a channel.

use std::fmt;
use std::future::Future;

use crate::proto::Status;
use trunk_rpc_core::Endpoint;

/// Which end of the connection this channel is. Stamped at construction,
/// never inferred from addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Immutable per-channel facts handed to every handler call.
#[derive(Clone)]
pub struct ReplyContext {
    pub url: Endpoint,
    pub local_addr: String,
    pub remote_addr: String,
    pub role: Role,
}

impl ReplyContext {
    pub fn local_port(&self) -> u16 {
        port_of(&self.local_addr)
    }

    pub fn remote_port(&self) -> u16 {
        port_of(&self.remote_addr)
    }
}

fn port_of(addr: &str) -> u16 {
    addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok()).unwrap_or(0)
}

impl fmt::Debug for ReplyContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}->{}", self.role, self.local_addr, self.remote_addr)
    }
}

/// A non-OK outcome of [ExchangeHandler::reply], mapped onto the response
/// status byte.
#[derive(Debug)]
pub struct ServiceFault {
    pub status: Status,
    pub message: String,
}

impl ServiceFault {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

/// What the protocol layer plugs into a channel. Events never reach it;
/// they are consumed by the channel itself.
pub trait ExchangeHandler: Send + Sync + Sized + 'static {
    /// Answer a two-way invocation payload with an encoded result.
    fn reply(
        &self, ctx: &ReplyContext, payload: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceFault>> + Send;

    fn connected(&self, _ctx: &ReplyContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn disconnected(&self, _ctx: &ReplyContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Optional telnet line handling; `None` swallows the line.
    fn telnet(&self, _ctx: &ReplyContext, _line: &str) -> Option<String> {
        None
    }
}
