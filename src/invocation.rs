//! The invocation payload model.
//!
//! An [RpcInvocation] is what travels inside a request body: method name,
//! pre-encoded arguments and a string attachment map. The service
//! coordinates (`path`, `group`, `version`) ride in the attachments, which
//! is how the provider-side dispatcher rebuilds the service key.

use std::collections::HashMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::Serializer;

/// Protocol revision carried as an attachment on every invocation.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Well-known attachment keys.
pub mod attachments {
    pub const PATH: &str = "path";
    pub const GROUP: &str = "group";
    pub const VERSION: &str = "version";
    pub const TIMEOUT: &str = "timeout";
    pub const PROTOCOL_VERSION: &str = "protocol-version";
    pub const IS_CALLBACK_INVOKE: &str = "is-callback-invoke";
    pub const NEED_MOCK: &str = "need-mock";
    pub const STUB_EVENT: &str = "stub-event";
    pub const CALLBACK_SERVICE_KEY: &str = "callback.service.key";
}

#[derive(Serialize, Deserialize, Clone)]
pub struct RpcInvocation {
    pub method: String,
    /// Arguments, already encoded with the channel's serializer.
    pub args: Vec<u8>,
    pub attachments: HashMap<String, String>,
}

impl RpcInvocation {
    pub fn new(method: &str, args: Vec<u8>) -> Self {
        Self { method: method.to_string(), args, attachments: HashMap::new() }
    }

    /// Build an invocation encoding `args` with `serializer`.
    pub fn with_args<S: Serializer, A: serde::Serialize>(
        serializer: &S, method: &str, args: &A,
    ) -> Result<Self, RemotingError> {
        let encoded = serializer
            .encode(args)
            .map_err(|_| RemotingError::Codec(format!("cannot encode args of {}", method)))?;
        Ok(Self::new(method, encoded))
    }

    pub fn decode_args<'a, S: Serializer, A: serde::Deserialize<'a>>(
        &'a self, serializer: &S,
    ) -> Result<A, RemotingError> {
        serializer
            .decode(&self.args)
            .map_err(|_| RemotingError::Codec(format!("cannot decode args of {}", self.method)))
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(|s| s.as_str())
    }

    pub fn set_attachment(&mut self, key: &str, value: &str) {
        self.attachments.insert(key.to_string(), value.to_string());
    }

    pub fn set_attachment_if_absent(&mut self, key: &str, value: &str) {
        if !self.attachments.contains_key(key) {
            self.set_attachment(key, value);
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.attachment(attachments::PATH)
    }

    pub fn group(&self) -> Option<&str> {
        self.attachment(attachments::GROUP).filter(|s| !s.is_empty())
    }

    pub fn version(&self) -> Option<&str> {
        self.attachment(attachments::VERSION).filter(|s| !s.is_empty())
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.attachment(attachments::TIMEOUT).and_then(|v| v.parse().ok())
    }

    pub fn encode<S: Serializer>(&self, serializer: &S) -> Result<Vec<u8>, RemotingError> {
        serializer
            .encode(self)
            .map_err(|_| RemotingError::Codec(format!("cannot encode invocation {:?}", self)))
    }

    pub fn decode<S: Serializer>(serializer: &S, buf: &[u8]) -> Result<Self, RemotingError> {
        serializer
            .decode(buf)
            .map_err(|_| RemotingError::Codec("cannot decode invocation".to_string()))
    }
}

impl fmt::Debug for RpcInvocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "invocation({}#{}, {}B args)",
            self.path().unwrap_or("?"),
            self.method,
            self.args.len()
        )
    }
}

/// What a provider packs into an OK response body: either the encoded
/// return value, or an application error that must reach the caller as
/// [trunk_rpc_core::error::RpcError::Biz] without any retry machinery
/// kicking in.
#[derive(Serialize, Deserialize, Debug)]
pub enum RpcResponse {
    Value(Vec<u8>),
    BizError(String),
}
