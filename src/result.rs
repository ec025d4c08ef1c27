//! The in-flight result of an invocation.
//!
//! [RpcFuture] wraps the exchange-level response future. Decoding the
//! response body happens on the task that awaits, never on the channel's
//! reader task, so the io loop stays on header routing only.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::invocation::{RpcInvocation, RpcResponse};
use crate::invoker::CallContext;
use trunk_rpc_core::error::{RemotingError, RpcError, TimeoutError, TimeoutSide};
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::Serializer;
use trunk_rpc_exchange::proto::{Response, Status};
use trunk_rpc_exchange::ResponseFuture;

/// A decoded OK response: the encoded return value.
pub struct RpcReply {
    pub value: Vec<u8>,
}

impl RpcReply {
    /// The `recreate` step: materialize the typed return value.
    pub fn decode<S: Serializer, R: DeserializeOwned>(&self, serializer: &S) -> Result<R, RpcError> {
        serializer.decode(&self.value).map_err(|_| {
            RpcError::Remoting(RemotingError::Codec("cannot decode return value".to_string()))
        })
    }
}

pub struct RpcFuture<S: Serializer> {
    inner: ResponseFuture,
    invocation: RpcInvocation,
    ctx: CallContext,
    serializer: S,
}

impl<S: Serializer> RpcFuture<S> {
    pub(crate) fn new(inner: ResponseFuture, invocation: RpcInvocation, ctx: CallContext) -> Self {
        Self { inner, invocation, ctx, serializer: S::default() }
    }

    #[inline]
    pub fn request_id(&self) -> u64 {
        self.inner.id()
    }

    #[inline]
    pub fn invocation(&self) -> &RpcInvocation {
        &self.invocation
    }

    #[inline]
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Complete locally with a client error; the peer's late reply will be
    /// dropped by the registry.
    pub fn cancel(&self) {
        self.inner.cancel()
    }

    /// Await the terminal response and decode it.
    pub async fn wait(self) -> Result<RpcReply, RpcError> {
        let resp = self.inner.wait().await;
        convert(&self.serializer, resp)
    }

    /// Await at most `limit`. Expiring here does not cancel the call, the
    /// registry timer still owns the deadline.
    pub async fn wait_timeout<IO: AsyncIO>(self, limit: Duration) -> Result<RpcReply, RpcError> {
        match self.inner.wait_timeout::<IO>(limit).await {
            Ok(resp) => convert(&self.serializer, resp),
            Err(_still_pending) => Err(RpcError::Remoting(RemotingError::Timeout(TimeoutError {
                side: TimeoutSide::Client,
                message: format!("result not ready within {} ms", limit.as_millis()),
            }))),
        }
    }

    /// Await, then run `f` with the captured call context before the
    /// outcome is returned, so callbacks observe the context of the call
    /// they belong to.
    pub async fn wait_with<C>(self, f: C) -> Result<RpcReply, RpcError>
    where
        C: FnOnce(&CallContext, &Result<RpcReply, RpcError>),
    {
        let ctx = self.ctx.clone();
        let out = self.wait().await;
        f(&ctx, &out);
        out
    }
}

fn convert<S: Serializer>(serializer: &S, resp: Response) -> Result<RpcReply, RpcError> {
    match resp.status {
        Status::Ok => match serializer.decode::<RpcResponse>(&resp.result) {
            Ok(RpcResponse::Value(value)) => Ok(RpcReply { value }),
            Ok(RpcResponse::BizError(msg)) => Err(RpcError::Biz(msg)),
            Err(_) => Err(RpcError::Remoting(RemotingError::Codec(
                "undecodable response body".to_string(),
            ))),
        },
        Status::ClientTimeout => Err(timeout(TimeoutSide::Client, resp.err_msg)),
        Status::ServerTimeout => Err(timeout(TimeoutSide::Server, resp.err_msg)),
        Status::ChannelInactive => {
            Err(RpcError::Remoting(RemotingError::ChannelInactive(resp.err_msg)))
        }
        Status::ServiceNotFound => {
            Err(RpcError::Remoting(RemotingError::ServiceNotFound(resp.err_msg)))
        }
        status => Err(RpcError::Remoting(RemotingError::Fault {
            status: status.into(),
            message: resp.err_msg,
        })),
    }
}

fn timeout(side: TimeoutSide, message: String) -> RpcError {
    RpcError::Remoting(RemotingError::Timeout(TimeoutError { side, message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunk_rpc_codec::MsgpSerializer;

    #[test]
    fn test_convert_statuses() {
        let s = MsgpSerializer::default();
        let body = s.encode(&RpcResponse::Value(b"v".to_vec())).unwrap();
        let reply = convert(&s, Response::ok(1, body)).expect("ok");
        assert_eq!(reply.value, b"v");

        let body = s.encode(&RpcResponse::BizError("db down".to_string())).unwrap();
        match convert(&s, Response::ok(2, body)) {
            Err(RpcError::Biz(m)) => assert_eq!(m, "db down"),
            other => panic!("unexpected {:?}", other.err()),
        }

        match convert(&s, Response::fault(3, Status::ServerTimeout, "late")) {
            Err(e) => assert_eq!(e.timeout_side(), Some(TimeoutSide::Server)),
            other => panic!("unexpected {:?}", other.err()),
        }

        match convert(&s, Response::fault(4, Status::ChannelInactive, "gone")) {
            Err(RpcError::Remoting(RemotingError::ChannelInactive(m))) => assert_eq!(m, "gone"),
            other => panic!("unexpected {:?}", other.err()),
        }

        match convert(&s, Response::fault(5, Status::ServiceNotFound, "no svc")) {
            Err(RpcError::Remoting(RemotingError::ServiceNotFound(_))) => {}
            other => panic!("unexpected {:?}", other.err()),
        }

        match convert(&s, Response::fault(6, Status::ServerError, "busy")) {
            Err(RpcError::Remoting(RemotingError::Fault { status, .. })) => {
                assert_eq!(status, "server_error")
            }
            other => panic!("unexpected {:?}", other.err()),
        }
    }
}
