//! Provider and consumer invokers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dispatch::ServiceDispatcher;
use crate::invocation::{attachments, RpcInvocation, PROTOCOL_VERSION};
use crate::pool::RefCountedClient;
use crate::result::RpcFuture;
use trunk_rpc_core::error::RpcError;
use trunk_rpc_core::{Endpoint, Serializer};
use trunk_rpc_exchange::transport::FrameTransport;
use trunk_rpc_exchange::ExchangeFacts;

/// Addresses of the call, captured when the call is made and carried with
/// its result so completion-time callbacks observe the right peer.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    pub remote_addr: String,
    pub local_addr: String,
}

pub type InvokeFuture = BoxFuture<'static, Result<Vec<u8>, RpcError>>;

/// The opaque callable a provider exports. Returns the encoded return
/// value; application failures travel as [RpcError::Biz].
pub trait ProviderInvoker: Send + Sync + 'static {
    fn invoke(&self, inv: RpcInvocation, ctx: CallContext) -> InvokeFuture;
}

/// Adapt a closure into a [ProviderInvoker].
pub struct FnInvoker<F>(F);

impl<F> FnInvoker<F>
where
    F: Fn(RpcInvocation, CallContext) -> InvokeFuture + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> ProviderInvoker for FnInvoker<F>
where
    F: Fn(RpcInvocation, CallContext) -> InvokeFuture + Send + Sync + 'static,
{
    #[inline]
    fn invoke(&self, inv: RpcInvocation, ctx: CallContext) -> InvokeFuture {
        (self.0)(inv, ctx)
    }
}

/// Consumer-side invoker over one referred endpoint: picks a client
/// round-robin, stamps the service attachments, sends through the exchange
/// and hands back an [RpcFuture].
pub struct RpcInvoker<F, T, S>
where
    F: ExchangeFacts,
    T: FrameTransport<F::IO>,
    S: Serializer,
{
    url: Endpoint,
    clients: Vec<Arc<RefCountedClient<F, ServiceDispatcher<S>, T>>>,
    counter: AtomicUsize,
    serializer: S,
}

impl<F, T, S> RpcInvoker<F, T, S>
where
    F: ExchangeFacts,
    T: FrameTransport<F::IO>,
    S: Serializer,
{
    pub(crate) fn new(
        url: Endpoint, clients: Vec<Arc<RefCountedClient<F, ServiceDispatcher<S>, T>>>,
    ) -> Self {
        assert!(!clients.is_empty());
        Self { url, clients, counter: AtomicUsize::new(0), serializer: S::default() }
    }

    #[inline]
    pub fn url(&self) -> &Endpoint {
        &self.url
    }

    /// The underlying (possibly shared) clients; mostly for observation.
    pub fn clients(&self) -> &[Arc<RefCountedClient<F, ServiceDispatcher<S>, T>>] {
        &self.clients
    }

    fn decorate(&self, inv: &mut RpcInvocation) {
        inv.set_attachment(attachments::PATH, self.url.path());
        if let Some(v) = self.url.version() {
            inv.set_attachment(attachments::VERSION, v);
        }
        if let Some(g) = self.url.group() {
            inv.set_attachment(attachments::GROUP, g);
        }
        if self.url.stub_event() {
            inv.set_attachment(attachments::STUB_EVENT, "true");
        }
        inv.set_attachment_if_absent(attachments::PROTOCOL_VERSION, PROTOCOL_VERSION);
        inv.set_attachment_if_absent(
            attachments::TIMEOUT,
            &self.url.timeout().as_millis().to_string(),
        );
    }

    fn call_timeout(&self, inv: &RpcInvocation) -> Duration {
        inv.timeout_ms().map(Duration::from_millis).unwrap_or_else(|| self.url.timeout())
    }

    fn pick(&self) -> &Arc<RefCountedClient<F, ServiceDispatcher<S>, T>> {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        &self.clients[idx % self.clients.len()]
    }

    /// Two-way invoke, returns the in-flight result.
    pub async fn invoke(&self, mut inv: RpcInvocation) -> Result<RpcFuture<S>, RpcError> {
        self.decorate(&mut inv);
        let timeout = self.call_timeout(&inv);
        let data = inv.encode(&self.serializer)?;
        let client = self.pick();
        let fut = client.request(data, Some(timeout)).await?;
        let ctx = CallContext {
            remote_addr: client.url().address(),
            local_addr: String::new(),
        };
        Ok(RpcFuture::new(fut, inv, ctx))
    }

    /// Fire-and-forget invoke: no pending call, nothing ever times out.
    pub async fn invoke_oneway(&self, mut inv: RpcInvocation) -> Result<(), RpcError> {
        self.decorate(&mut inv);
        let data = inv.encode(&self.serializer)?;
        self.pick().send_payload(data).await?;
        Ok(())
    }

    /// Typed call helper: encode args, invoke, wait, decode.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self, method: &str, args: &A,
    ) -> Result<R, RpcError> {
        let inv = RpcInvocation::with_args(&self.serializer, method, args)?;
        let reply = self.invoke(inv).await?.wait().await?;
        reply.decode(&self.serializer)
    }

    /// Typed one-way helper.
    pub async fn notify<A: Serialize>(&self, method: &str, args: &A) -> Result<(), RpcError> {
        let inv = RpcInvocation::with_args(&self.serializer, method, args)?;
        self.invoke_oneway(inv).await
    }

    /// Release this refer's hold on the clients; shared connections close
    /// only when the last holder lets go.
    pub async fn close(&self, timeout: Duration) {
        for client in self.clients.iter() {
            client.close(timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_invoker_adapts() {
        let f = FnInvoker::new(|inv, _ctx| {
            Box::pin(async move {
                if inv.method == "fail" {
                    Err(RpcError::Biz("nope".to_string()))
                } else {
                    Ok(inv.args)
                }
            })
        });
        let fut = f.invoke(RpcInvocation::new("ok", b"x".to_vec()), CallContext::default());
        let out = futures::executor::block_on(fut).expect("ok");
        assert_eq!(out, b"x");
        let fut = f.invoke(RpcInvocation::new("fail", vec![]), CallContext::default());
        assert!(matches!(futures::executor::block_on(fut), Err(RpcError::Biz(_))));
    }
}
