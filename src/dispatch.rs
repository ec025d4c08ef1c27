//! Provider-side dispatch: the exchange handler that resolves incoming
//! invocations to exported invokers by service key.

use std::sync::Arc;

use captains_log::filter::LogFilter;

use crate::exporter::ExporterMap;
use crate::invocation::{attachments, RpcInvocation, RpcResponse};
use crate::invoker::CallContext;
use trunk_rpc_core::error::RpcError;
use trunk_rpc_core::{service_key, Serializer};
use trunk_rpc_exchange::proto::Status;
use trunk_rpc_exchange::{ExchangeHandler, ReplyContext, Role, ServiceFault};

pub struct ServiceDispatcher<S: Serializer> {
    exporters: ExporterMap,
    serializer: S,
    logger: Arc<LogFilter>,
}

impl<S: Serializer> ServiceDispatcher<S> {
    pub(crate) fn new(exporters: ExporterMap, logger: Arc<LogFilter>) -> Arc<Self> {
        Arc::new(Self { exporters, serializer: S::default(), logger })
    }

    /// `{group/}{path}{:version}:{port}` from the invocation attachments
    /// plus the channel facts. Two special cases, per the wire contract:
    /// a stub-event invocation keys on the remote port, and an invocation
    /// arriving on a client-role channel is a callback, keyed on the
    /// dotted callback suffix.
    fn resolve_key(&self, ctx: &ReplyContext, inv: &mut RpcInvocation) -> String {
        let stub_event = inv.attachment(attachments::STUB_EVENT) == Some("true");
        let port = if stub_event { ctx.remote_port() } else { ctx.local_port() };
        let mut path = inv.path().unwrap_or("").to_string();
        if ctx.role == Role::Client && !stub_event {
            if let Some(cb) = inv.attachment(attachments::CALLBACK_SERVICE_KEY) {
                path = format!("{}.{}", path, cb);
            }
            inv.set_attachment(attachments::IS_CALLBACK_INVOKE, "true");
        }
        service_key(inv.group(), &path, inv.version(), port)
    }

    async fn dispatch(
        &self, ctx: &ReplyContext, mut inv: RpcInvocation,
    ) -> Result<Vec<u8>, ServiceFault> {
        let key = self.resolve_key(ctx, &mut inv);
        let invoker = {
            let map = self.exporters.lock().unwrap();
            match map.get(&key) {
                Some(entry) => entry.invoker.clone(),
                None => {
                    let known: Vec<String> = map.keys().cloned().collect();
                    return Err(ServiceFault::new(
                        Status::ServiceNotFound,
                        format!(
                            "not found exported service: {} in {:?}, may be version or group mismatch, channel: consumer {} -> provider {}",
                            key, known, ctx.remote_addr, ctx.local_addr
                        ),
                    ));
                }
            }
        };
        let call_ctx = CallContext {
            remote_addr: ctx.remote_addr.clone(),
            local_addr: ctx.local_addr.clone(),
        };
        let packed = match invoker.invoke(inv, call_ctx).await {
            Ok(value) => RpcResponse::Value(value),
            Err(RpcError::Biz(msg)) => RpcResponse::BizError(msg),
            Err(RpcError::Remoting(e)) => {
                return Err(ServiceFault::new(Status::ServiceError, e.to_string()));
            }
        };
        self.serializer.encode(&packed).map_err(|_| {
            ServiceFault::new(Status::ServerError, "cannot encode response".to_string())
        })
    }

    /// Synthesize and deliver a one-way event invocation declared on the
    /// URL (`onconnect`/`ondisconnect`), result discarded.
    async fn fire_url_event(&self, ctx: &ReplyContext, method: &str) {
        let mut inv = RpcInvocation::new(method, Vec::new());
        inv.set_attachment(attachments::PATH, ctx.url.path());
        if let Some(g) = ctx.url.group() {
            inv.set_attachment(attachments::GROUP, g);
        }
        if let Some(v) = ctx.url.version() {
            inv.set_attachment(attachments::VERSION, v);
        }
        if ctx.url.stub_event() {
            inv.set_attachment(attachments::STUB_EVENT, "true");
        }
        if let Err(fault) = self.dispatch(ctx, inv).await {
            logger_warn!(
                self.logger,
                "url event {}() on {:?} failed: {}",
                method,
                ctx,
                fault.message
            );
        }
    }
}

impl<S: Serializer> ExchangeHandler for ServiceDispatcher<S> {
    async fn reply(&self, ctx: &ReplyContext, payload: Vec<u8>) -> Result<Vec<u8>, ServiceFault> {
        let inv = match RpcInvocation::decode(&self.serializer, &payload) {
            Ok(inv) => inv,
            Err(_) => {
                logger_warn!(self.logger, "{:?} sent an undecodable request", ctx);
                return Err(ServiceFault::new(
                    Status::BadRequest,
                    format!(
                        "unsupported request payload, channel: consumer {} -> provider {}",
                        ctx.remote_addr, ctx.local_addr
                    ),
                ));
            }
        };
        logger_trace!(self.logger, "{:?} dispatching {:?}", ctx, inv);
        self.dispatch(ctx, inv).await
    }

    async fn connected(&self, ctx: &ReplyContext) {
        if let Some(method) = ctx.url.on_connect() {
            let method = method.to_string();
            self.fire_url_event(ctx, &method).await;
        }
    }

    async fn disconnected(&self, ctx: &ReplyContext) {
        if let Some(method) = ctx.url.on_disconnect() {
            let method = method.to_string();
            self.fire_url_event(ctx, &method).await;
        }
    }

    fn telnet(&self, _ctx: &ReplyContext, line: &str) -> Option<String> {
        match line {
            "ls" => {
                let keys: Vec<String> =
                    self.exporters.lock().unwrap().keys().cloned().collect();
                Some(keys.join("\r\n"))
            }
            "" => None,
            other => Some(format!("unsupported command: {}", other)),
        }
    }
}
