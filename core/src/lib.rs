//! # trunk-rpc-core
//!
//! Shared foundations of the `trunk-rpc` exchange stack: the [Endpoint]
//! configuration model, error kinds, the [Serializer] seam, runtime-neutral
//! io, and the [runtime] abstraction the tokio/smol adapter crates plug
//! into.

mod endpoint;
pub use endpoint::{params, service_key, Endpoint, InvalidEndpoint};

pub mod error;
pub mod io;
pub mod runtime;
pub mod time;

mod serialize;
pub use serialize::{serialization_id, Serializer};
