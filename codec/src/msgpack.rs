use serde::{Deserialize, Serialize};
use trunk_rpc_core::Serializer;

/// Msgpack bodies via rmp-serde, named field encoding for cross-version
/// tolerance.
#[derive(Default)]
pub struct MsgpSerializer();

impl Serializer for MsgpSerializer {
    const ID: u8 = 2;
    const NAME: &'static str = "msgpack";

    #[inline(always)]
    fn encode<T: Serialize>(&self, v: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(v) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                log::error!("msgpack encode error: {:?}", e);
                Err(())
            }
        }
    }

    fn encode_into<T: Serialize>(&self, v: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, v) {
            log::error!("msgpack encode error: {:?}", e);
            return Err(());
        }
        Ok(buf.len() - pre_len)
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Ok(v) => Ok(v),
            Err(e) => {
                log::warn!("msgpack decode error: {:?}", e);
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};
    use trunk_rpc_core::serialization_id;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        seq: u64,
        tag: String,
    }

    #[test]
    fn test_roundtrip() {
        let s = MsgpSerializer::default();
        let v = Ping { seq: 7, tag: "hi".to_string() };
        let buf = s.encode(&v).expect("encode");
        let back: Ping = s.decode(&buf).expect("decode");
        assert_eq!(back, v);
    }

    #[test]
    fn test_encode_into_appends() {
        let s = MsgpSerializer::default();
        let mut buf = vec![0xffu8; 3];
        let n = s.encode_into(&1234u32, &mut buf).expect("encode");
        assert_eq!(buf.len(), 3 + n);
        let back: u32 = s.decode(&buf[3..]).expect("decode");
        assert_eq!(back, 1234);
    }

    #[test]
    fn test_wire_id_registered() {
        assert_eq!(serialization_id(MsgpSerializer::NAME), Some(MsgpSerializer::ID));
    }
}
