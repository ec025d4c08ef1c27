//! Lazy-connect client wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use captains_log::filter::LogFilter;

use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::{params, Endpoint};
use trunk_rpc_exchange::transport::FrameTransport;
use trunk_rpc_exchange::{
    ExchangeClient, ExchangeContext, ExchangeFacts, ExchangeHandler, ResponseFuture,
};

/// A client that does not connect until the first send or request.
///
/// Establishment is guarded by an async lock: every call racing the first
/// one serializes behind it and proceeds on the connection it produced.
/// The `connect.lazy.initial.state` parameter (default true) decides what
/// [LazyClient::is_alive] reports before any connection exists.
pub struct LazyClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    url: Endpoint,
    handler: Arc<H>,
    slot: ArcSwapOption<ExchangeClient<F, H, T>>,
    gate: futures::lock::Mutex<()>,
    closed: AtomicBool,
    initial_state: bool,
    /// Set on the stub that replaces a really-closed shared client.
    warn_on_use: bool,
    warned: AtomicBool,
    logger: Arc<LogFilter>,
}

impl<F, H, T> LazyClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    pub fn new(
        facts: Arc<F>, ctx: Arc<ExchangeContext>, url: Endpoint, handler: Arc<H>,
        warn_on_use: bool,
    ) -> Arc<Self> {
        let logger = facts.new_logger();
        let initial_state = url.bool_param(params::LAZY_INITIAL_STATE, true);
        Arc::new(Self {
            facts,
            ctx,
            url,
            handler,
            slot: ArcSwapOption::new(None),
            gate: futures::lock::Mutex::new(()),
            closed: AtomicBool::new(false),
            initial_state,
            warn_on_use,
            warned: AtomicBool::new(false),
            logger,
        })
    }

    #[inline]
    pub fn url(&self) -> &Endpoint {
        &self.url
    }

    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.slot.load().as_ref() {
            Some(client) => client.is_alive(),
            None => self.initial_state,
        }
    }

    async fn ensure(&self) -> Result<Arc<ExchangeClient<F, H, T>>, RemotingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.url.address()));
        }
        if let Some(client) = self.slot.load_full() {
            if client.is_alive() {
                return Ok(client);
            }
        }
        if self.warn_on_use && !self.warned.swap(true, Ordering::Relaxed) {
            logger_warn!(
                self.logger,
                "client to {} was closed and is being revived lazily, check the release order of shared references",
                self.url.address()
            );
        }
        let _guard = self.gate.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.url.address()));
        }
        if let Some(client) = self.slot.load_full() {
            if client.is_alive() {
                return Ok(client);
            }
        }
        let client = ExchangeClient::connect(
            self.facts.clone(),
            self.ctx.clone(),
            self.url.clone(),
            self.handler.clone(),
        )
        .await?;
        self.slot.store(Some(client.clone()));
        Ok(client)
    }

    pub async fn request(
        &self, data: Vec<u8>, timeout: Option<Duration>,
    ) -> Result<ResponseFuture, RemotingError> {
        self.ensure().await?.request(data, timeout).await
    }

    pub async fn send_payload(&self, data: Vec<u8>) -> Result<(), RemotingError> {
        self.ensure().await?.send_payload(data).await
    }

    pub async fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.slot.swap(None) {
            client.close(timeout).await;
        }
    }
}
