//! The exchange wire format.
//!
//! Fixed 16-byte frame header:
//!
//! | 2B     | 1B   | 1B     | 8B | 4B       |
//! | magic  | flag | status | id | body_len |
//!
//! Flag bits: `0x80` request, `0x40` two-way, `0x20` event; the low 5 bits
//! carry the serialization id. Multi-byte fields are big-endian, matching
//! peers that speak the classic dubbo header layout.
//!
//! Bytes that do not open with the magic are treated as a telnet text line
//! and surfaced as [Message::Text].

use std::fmt;

use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::io::AsyncRead;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const MAGIC: u16 = 0xdabb;
pub const MAGIC_HIGH: u8 = 0xda;
pub const MAGIC_LOW: u8 = 0xbb;

pub const FLAG_REQUEST: u8 = 0x80;
pub const FLAG_TWO_WAY: u8 = 0x40;
pub const FLAG_EVENT: u8 = 0x20;
pub const SERIALIZATION_MASK: u8 = 0x1f;

/// Body of the readonly event; heartbeat events carry an empty body.
pub const READONLY_EVENT_BODY: &[u8] = b"R";

/// Telnet lines longer than this are treated as garbage on the wire.
pub const TEXT_LINE_MAX: usize = 2048;

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct FrameHeader {
    pub magic: U16<BigEndian>,
    pub flag: u8,
    pub status: u8,
    pub id: U64<BigEndian>,
    pub body_len: U32<BigEndian>,
}

pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[id:{}, flag:{:#x}, status:{}, body:{}]",
            self.id.get(),
            self.flag,
            self.status,
            self.body_len.get(),
        )
    }
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Response status byte. The numeric values are the compatibility target
/// for existing dubbo 2.0 peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Status {
    #[strum(serialize = "ok")]
    Ok = 20,
    #[strum(serialize = "client_timeout")]
    ClientTimeout = 30,
    #[strum(serialize = "server_timeout")]
    ServerTimeout = 31,
    #[strum(serialize = "channel_inactive")]
    ChannelInactive = 35,
    #[strum(serialize = "bad_request")]
    BadRequest = 40,
    #[strum(serialize = "bad_response")]
    BadResponse = 50,
    #[strum(serialize = "service_not_found")]
    ServiceNotFound = 60,
    #[strum(serialize = "service_error")]
    ServiceError = 70,
    #[strum(serialize = "server_error")]
    ServerError = 80,
    #[strum(serialize = "client_error")]
    ClientError = 90,
}

impl Status {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            20 => Some(Self::Ok),
            30 => Some(Self::ClientTimeout),
            31 => Some(Self::ServerTimeout),
            35 => Some(Self::ChannelInactive),
            40 => Some(Self::BadRequest),
            50 => Some(Self::BadResponse),
            60 => Some(Self::ServiceNotFound),
            70 => Some(Self::ServiceError),
            80 => Some(Self::ServerError),
            90 => Some(Self::ClientError),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Request {
    pub id: u64,
    pub two_way: bool,
    pub event: bool,
    /// Set by the decoder when the frame arrived undecodable (wrong
    /// serialization id); a two-way broken request is answered with
    /// [Status::BadRequest].
    pub broken: bool,
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(id: u64, data: Vec<u8>) -> Self {
        Self { id, two_way: true, event: false, broken: false, data }
    }

    pub fn oneway(id: u64, data: Vec<u8>) -> Self {
        Self { id, two_way: false, event: false, broken: false, data }
    }

    /// Heartbeat probe; two-way so the peer's ack refreshes our read stamp.
    pub fn heartbeat(id: u64) -> Self {
        Self { id, two_way: true, event: true, broken: false, data: Vec::new() }
    }

    /// One-way notification that the sender stops accepting new calls.
    pub fn readonly(id: u64) -> Self {
        Self { id, two_way: false, event: true, broken: false, data: READONLY_EVENT_BODY.to_vec() }
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.event && self.data == READONLY_EVENT_BODY
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "req(id={}, two_way={}, event={}, {}B)",
            self.id,
            self.two_way,
            self.event,
            self.data.len()
        )
    }
}

#[derive(Clone)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    pub event: bool,
    /// Error text for non-OK statuses; empty on OK.
    pub err_msg: String,
    pub result: Vec<u8>,
}

impl Response {
    pub fn ok(id: u64, result: Vec<u8>) -> Self {
        Self { id, status: Status::Ok, event: false, err_msg: String::new(), result }
    }

    pub fn fault(id: u64, status: Status, msg: &str) -> Self {
        Self { id, status, event: false, err_msg: msg.to_string(), result: Vec::new() }
    }

    pub fn event_ack(id: u64) -> Self {
        Self { id, status: Status::Ok, event: true, err_msg: String::new(), result: Vec::new() }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "resp(id={}, status={}, event={}, {}B)",
            self.id,
            self.status,
            self.event,
            self.result.len()
        )
    }
}

/// Everything a channel can carry.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// A raw telnet line, newline stripped.
    Text(String),
}

fn check_payload(size: usize, limit: usize) -> Result<(), RemotingError> {
    if limit > 0 && size > limit {
        return Err(RemotingError::PayloadLimit { size, limit });
    }
    Ok(())
}

/// Encode `msg` into `buf`. Fails fast when the body exceeds `payload_limit`.
pub fn encode_into(
    msg: &Message, sid: u8, payload_limit: usize, buf: &mut Vec<u8>,
) -> Result<(), RemotingError> {
    match msg {
        Message::Request(req) => {
            check_payload(req.data.len(), payload_limit)?;
            let mut flag = FLAG_REQUEST | (sid & SERIALIZATION_MASK);
            if req.two_way {
                flag |= FLAG_TWO_WAY;
            }
            if req.event {
                flag |= FLAG_EVENT;
            }
            let header = FrameHeader {
                magic: U16::new(MAGIC),
                flag,
                status: 0,
                id: U64::new(req.id),
                body_len: U32::new(req.data.len() as u32),
            };
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(&req.data);
        }
        Message::Response(resp) => {
            let body: &[u8] = if resp.status == Status::Ok {
                &resp.result
            } else {
                resp.err_msg.as_bytes()
            };
            check_payload(body.len(), payload_limit)?;
            let mut flag = sid & SERIALIZATION_MASK;
            if resp.event {
                flag |= FLAG_EVENT;
            }
            let header = FrameHeader {
                magic: U16::new(MAGIC),
                flag,
                status: resp.status as u8,
                id: U64::new(resp.id),
                body_len: U32::new(body.len() as u32),
            };
            buf.extend_from_slice(header.as_bytes());
            buf.extend_from_slice(body);
        }
        Message::Text(line) => {
            buf.extend_from_slice(line.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
    Ok(())
}

/// Read one message off the stream.
///
/// `expected_sid` is the serialization this channel was configured with: a
/// mismatching request is delivered `broken` (the reply path answers
/// BadRequest), a mismatching response is rewritten into BadResponse so the
/// pending call still completes through the one path.
pub async fn read_message<R: AsyncRead>(
    reader: &mut R, expected_sid: u8, payload_limit: usize,
) -> Result<Message, RemotingError> {
    let mut head = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut head[..1])
        .await
        .map_err(|e| RemotingError::io("read", e))?;
    if head[0] != MAGIC_HIGH {
        return read_text_line(reader, head[0]).await;
    }
    reader
        .read_exact(&mut head[1..])
        .await
        .map_err(|e| RemotingError::io("read", e))?;
    let header = FrameHeader::read_from(&head[..])
        .ok_or_else(|| RemotingError::Codec("short frame header".to_string()))?;
    if header.magic.get() != MAGIC {
        return Err(RemotingError::Codec(format!("bad magic {:#06x}", header.magic.get())));
    }
    let body_len = header.body_len.get() as usize;
    check_payload(body_len, payload_limit)?;
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        reader.read_exact(&mut body).await.map_err(|e| RemotingError::io("read", e))?;
    }

    let sid = header.flag & SERIALIZATION_MASK;
    let event = header.flag & FLAG_EVENT != 0;
    if header.flag & FLAG_REQUEST != 0 {
        let mut req = Request {
            id: header.id.get(),
            two_way: header.flag & FLAG_TWO_WAY != 0,
            event,
            broken: false,
            data: body,
        };
        if !event && sid != expected_sid {
            warn!("request {} with serialization {} but channel expects {}", req.id, sid, expected_sid);
            req.broken = true;
        }
        return Ok(Message::Request(req));
    }

    let id = header.id.get();
    let status = match Status::from_byte(header.status) {
        Some(s) => s,
        None => {
            return Ok(Message::Response(Response::fault(
                id,
                Status::BadResponse,
                &format!("unknown status byte {}", header.status),
            )));
        }
    };
    if !event && sid != expected_sid {
        return Ok(Message::Response(Response::fault(
            id,
            Status::BadResponse,
            &format!("response with serialization {} but channel expects {}", sid, expected_sid),
        )));
    }
    let resp = if status == Status::Ok {
        Response { id, status, event, err_msg: String::new(), result: body }
    } else {
        Response {
            id,
            status,
            event,
            err_msg: String::from_utf8_lossy(&body).into_owned(),
            result: Vec::new(),
        }
    };
    Ok(Message::Response(resp))
}

async fn read_text_line<R: AsyncRead>(reader: &mut R, first: u8) -> Result<Message, RemotingError> {
    let mut line = Vec::with_capacity(64);
    let mut b = first;
    loop {
        if b == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Message::Text(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(b);
        if line.len() > TEXT_LINE_MAX {
            return Err(RemotingError::Codec("unterminated text line".to_string()));
        }
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).await.map_err(|e| RemotingError::io("read", e))?;
        b = one[0];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{block_on, Pipe};

    #[test]
    fn test_header_len() {
        assert_eq!(FRAME_HEADER_LEN, 16);
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(Status::Ok as u8, 20);
        assert_eq!(Status::ClientTimeout as u8, 30);
        assert_eq!(Status::ServerTimeout as u8, 31);
        assert_eq!(Status::ChannelInactive as u8, 35);
        assert_eq!(Status::ServiceNotFound as u8, 60);
        assert_eq!(Status::ClientError as u8, 90);
        assert_eq!(Status::from_byte(31), Some(Status::ServerTimeout));
        assert_eq!(Status::from_byte(0), None);
    }

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        encode_into(&msg, 2, 0, &mut buf).expect("encode");
        let mut pipe = Pipe::new(&buf);
        block_on(read_message(&mut pipe, 2, 0)).expect("decode")
    }

    #[test]
    fn test_request_roundtrip() {
        let m = roundtrip(Message::Request(Request::new(42, b"payload".to_vec())));
        match m {
            Message::Request(req) => {
                assert_eq!(req.id, 42);
                assert!(req.two_way);
                assert!(!req.event);
                assert!(!req.broken);
                assert_eq!(req.data, b"payload");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oneway_and_events() {
        match roundtrip(Message::Request(Request::oneway(7, b"x".to_vec()))) {
            Message::Request(req) => assert!(!req.two_way),
            other => panic!("unexpected {:?}", other),
        }
        match roundtrip(Message::Request(Request::heartbeat(8))) {
            Message::Request(req) => {
                assert!(req.event);
                assert!(req.two_way);
                assert!(req.data.is_empty());
                assert!(!req.is_readonly());
            }
            other => panic!("unexpected {:?}", other),
        }
        match roundtrip(Message::Request(Request::readonly(9))) {
            Message::Request(req) => {
                assert!(req.event);
                assert!(req.is_readonly());
            }
            other => panic!("unexpected {:?}", other),
        }
        match roundtrip(Message::Response(Response::event_ack(8))) {
            Message::Response(resp) => {
                assert!(resp.event);
                assert_eq!(resp.status, Status::Ok);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        match roundtrip(Message::Response(Response::ok(11, b"result".to_vec()))) {
            Message::Response(resp) => {
                assert_eq!(resp.id, 11);
                assert_eq!(resp.status, Status::Ok);
                assert_eq!(resp.result, b"result");
            }
            other => panic!("unexpected {:?}", other),
        }
        match roundtrip(Message::Response(Response::fault(12, Status::ServiceNotFound, "no svc"))) {
            Message::Response(resp) => {
                assert_eq!(resp.status, Status::ServiceNotFound);
                assert_eq!(resp.err_msg, "no svc");
                assert!(resp.result.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_payload_limit() {
        let msg = Message::Request(Request::new(1, vec![0u8; 100]));
        let mut buf = Vec::new();
        match encode_into(&msg, 2, 10, &mut buf) {
            Err(RemotingError::PayloadLimit { size, limit }) => {
                assert_eq!(size, 100);
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        // decode side: craft a frame announcing an oversized body
        buf.clear();
        encode_into(&msg, 2, 0, &mut buf).expect("encode unlimited");
        let mut pipe = Pipe::new(&buf);
        match block_on(read_message(&mut pipe, 2, 10)) {
            Err(RemotingError::PayloadLimit { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_serialization_mismatch() {
        let mut buf = Vec::new();
        encode_into(&Message::Request(Request::new(5, b"z".to_vec())), 3, 0, &mut buf).unwrap();
        let mut pipe = Pipe::new(&buf);
        match block_on(read_message(&mut pipe, 2, 0)).expect("decode") {
            Message::Request(req) => assert!(req.broken),
            other => panic!("unexpected {:?}", other),
        }
        buf.clear();
        encode_into(&Message::Response(Response::ok(6, b"v".to_vec())), 3, 0, &mut buf).unwrap();
        let mut pipe = Pipe::new(&buf);
        match block_on(read_message(&mut pipe, 2, 0)).expect("decode") {
            Message::Response(resp) => assert_eq!(resp.status, Status::BadResponse),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_telnet_line() {
        let mut pipe = Pipe::new(b"ls -l\r\nrest");
        match block_on(read_message(&mut pipe, 2, 0)).expect("decode") {
            Message::Text(line) => assert_eq!(line, "ls -l"),
            other => panic!("unexpected {:?}", other),
        }
        let mut buf = Vec::new();
        encode_into(&Message::Text("pong".to_string()), 2, 0, &mut buf).unwrap();
        assert_eq!(buf, b"pong\r\n");
    }
}
