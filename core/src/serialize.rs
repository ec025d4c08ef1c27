use serde::{Deserialize, Serialize};

/// Body serializer interface.
///
/// Implementations live in [trunk-rpc-codec](https://docs.rs/trunk-rpc-codec).
/// A serializer is immutable and carries a stable wire id: the id byte
/// travels in the frame flags, so a response must be decoded with the same
/// serializer the request was encoded with, and a mismatch is detected
/// before any body bytes are interpreted.
pub trait Serializer: Default + Send + Sync + Sized + 'static {
    /// Wire id, 5 bits on the frame flag byte.
    const ID: u8;
    const NAME: &'static str;

    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()>;

    /// Serialize into `buf`, returns the size written.
    fn encode_into<T: Serialize>(&self, v: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

/// The {serialize, deserialize} extension point selected by name, as the
/// `serialization` URL parameter spells it.
pub fn serialization_id(name: &str) -> Option<u8> {
    match name {
        "msgpack" => Some(2),
        _ => None,
    }
}
