//! # trunk-rpc
//!
//! The protocol layer of `trunk-rpc`, a dubbo-style RPC exchange core.
//! It maps exported services to invokers by service key on the provider
//! side and manages shared, reference-counted exchange clients on the
//! consumer side.
//!
//! ## Components
//!
//! The workspace splits along the same lines as the transport stack:
//!
//! - [`trunk-rpc-core`](https://docs.rs/trunk-rpc-core): endpoint config,
//!   errors, io and runtime abstraction
//! - [`trunk-rpc-exchange`](https://docs.rs/trunk-rpc-exchange): the
//!   multiplexed request/response layer (correlation, timeouts,
//!   heartbeats, graceful close)
//! - [`trunk-rpc-codec`](https://docs.rs/trunk-rpc-codec): body
//!   serializers (msgpack)
//! - [`trunk-rpc-tcp`](https://docs.rs/trunk-rpc-tcp): TCP / Unix socket
//!   transport
//! - runtimes: [`trunk-rpc-tokio`](https://docs.rs/trunk-rpc-tokio) and
//!   [`trunk-rpc-smol`](https://docs.rs/trunk-rpc-smol)
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use trunk_rpc::{Endpoint, FnInvoker, RpcProtocol};
//! use trunk_rpc_codec::MsgpSerializer;
//! use trunk_rpc_exchange::ExchangeDefault;
//! use trunk_rpc_tcp::TcpTransport;
//! use trunk_rpc_tokio::TokioRT;
//!
//! type RT = TokioRT;
//! type Protocol = RpcProtocol<ExchangeDefault<RT>, TcpTransport<RT>, MsgpSerializer>;
//!
//! async fn run() {
//!     let facts = ExchangeDefault::new(TokioRT::new_global());
//!     let protocol: Arc<Protocol> = RpcProtocol::new(facts);
//!
//!     // provider
//!     let url: Endpoint = "127.0.0.1:20880/com.acme.Echo?version=1.0.0".parse().unwrap();
//!     let echo = FnInvoker::new(|inv, _ctx| Box::pin(async move { Ok(inv.args) }));
//!     let exporter = protocol.export(url.clone(), echo).unwrap();
//!
//!     // consumer
//!     let invoker = protocol.refer(url).await.unwrap();
//!     let reply: String = invoker.call("echo", &"hi".to_string()).await.unwrap();
//!     assert_eq!(reply, "hi");
//!
//!     exporter.unexport();
//!     protocol.destroy().await;
//! }
//! ```

#[macro_use]
extern crate captains_log;

pub mod invocation;
pub use invocation::{attachments, RpcInvocation, RpcResponse, PROTOCOL_VERSION};

mod invoker;
pub use invoker::{CallContext, FnInvoker, InvokeFuture, ProviderInvoker, RpcInvoker};

mod exporter;
pub use exporter::Exporter;

mod dispatch;
pub use dispatch::ServiceDispatcher;

mod pool;
pub use pool::{RefCountedClient, SharedClientPool};

mod lazy;
pub use lazy::LazyClient;

mod result;
pub use result::{RpcFuture, RpcReply};

mod protocol;
pub use protocol::RpcProtocol;

pub use trunk_rpc_core::{error, params, service_key, Endpoint, Serializer};
