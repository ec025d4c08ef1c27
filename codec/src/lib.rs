//! # trunk-rpc-codec
//!
//! Body serializers for `trunk-rpc`. Currently ships msgpack; the wire id
//! of a serializer is registered in `trunk-rpc-core::serialization_id`.

mod msgpack;
pub use msgpack::MsgpSerializer;
