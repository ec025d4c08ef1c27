//! # trunk-rpc-exchange
//!
//! The exchange layer of `trunk-rpc`: turns a duplex byte transport into a
//! multiplexed request/response channel with correlation by id, per-call
//! timeouts, heartbeats, readonly shutdown events and graceful close.
//!
//! Layering, bottom up:
//!
//! - [transport::FrameTransport]: a framed duplex connection provided by
//!   a transport crate such as
//!   [trunk-rpc-tcp](https://docs.rs/trunk-rpc-tcp)
//! - [ExchangeChannel]: one live connection with writer/reader/heartbeat
//!   tasks
//! - [ExchangeClient] / [ExchangeServer]: connect-with-reconnect and
//!   listen-with-accept-bound on top of channels
//! - [ExchangeHandler]: the seam the protocol layer
//!   ([trunk-rpc](https://docs.rs/trunk-rpc)) plugs into

#[macro_use]
extern crate captains_log;

pub mod proto;

pub mod pending;
pub use pending::ResponseFuture;

mod context;
pub use context::ExchangeContext;

mod facts;
pub use facts::{ExchangeDefault, ExchangeFacts};

pub mod transport;

mod handler;
pub use handler::{ExchangeHandler, ReplyContext, Role, ServiceFault};

mod channel;
pub use channel::ExchangeChannel;

mod client;
pub use client::ExchangeClient;

mod server;
pub use server::ExchangeServer;

pub use trunk_rpc_core::{error, Endpoint};

#[cfg(test)]
mod testutil;
