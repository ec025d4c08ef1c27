//! Client side of the exchange layer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use captains_log::filter::LogFilter;

use crate::channel::ExchangeChannel;
use crate::context::ExchangeContext;
use crate::facts::ExchangeFacts;
use crate::handler::{ExchangeHandler, Role};
use crate::pending::ResponseFuture;
use crate::proto::Message;
use crate::transport::{ConnOptions, FrameTransport};
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::Endpoint;

/// A connected exchange endpoint with background reconnect.
///
/// The current channel sits behind an arc-swap slot; a reconnect task
/// probes at the URL's `reconnect` interval (floor 2s) and replaces a dead
/// or readonly channel with a fresh connection. Requests issued while the
/// slot is empty or unhealthy fail fast with a closed-channel error, they
/// never queue behind the reconnect.
pub struct ExchangeClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    url: Endpoint,
    opt: ConnOptions,
    handler: Arc<H>,
    chan: ArcSwapOption<ExchangeChannel<F, H, T>>,
    closed: AtomicBool,
    logger: Arc<LogFilter>,
}

impl<F, H, T> std::fmt::Debug for ExchangeClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "exchange client to {}", self.url.address())
    }
}

impl<F, H, T> ExchangeClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    pub async fn connect(
        facts: Arc<F>, ctx: Arc<ExchangeContext>, url: Endpoint, handler: Arc<H>,
    ) -> Result<Arc<Self>, RemotingError> {
        ctx.start_ticker(facts.as_ref());
        let opt = ConnOptions::derive(&url)?;
        let logger = facts.new_logger();
        let client = Arc::new(Self {
            facts,
            ctx,
            url,
            opt,
            handler,
            chan: ArcSwapOption::new(None),
            closed: AtomicBool::new(false),
            logger,
        });
        let chan = client.establish().await?;
        client.chan.store(Some(chan));
        client.spawn_reconnect();
        Ok(client)
    }

    async fn establish(&self) -> Result<Arc<ExchangeChannel<F, H, T>>, RemotingError> {
        let transport = T::connect(&self.url.address(), &self.opt).await?;
        Ok(ExchangeChannel::spawn(
            self.facts.clone(),
            self.ctx.clone(),
            self.handler.clone(),
            transport,
            self.url.clone(),
            Role::Client,
            None,
            Arc::new(AtomicUsize::new(self.url.inflight_limit())),
        ))
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.url.reconnect_interval();
        let warn_period = self.url.reconnect_warn_period();
        self.facts.spawn_detach(async move {
            let mut failures: u64 = 0;
            loop {
                <F::IO as AsyncIO>::sleep(interval).await;
                let Some(client) = weak.upgrade() else { return };
                if client.closed.load(Ordering::Acquire) {
                    return;
                }
                let healthy =
                    client.chan.load().as_ref().map(|c| c.is_alive()).unwrap_or(false);
                if healthy {
                    failures = 0;
                    continue;
                }
                match client.establish().await {
                    Ok(chan) => {
                        logger_info!(client.logger, "{:?} reconnected", client);
                        if let Some(old) = client.chan.swap(Some(chan)) {
                            old.force_close().await;
                        }
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures % warn_period == 1 || warn_period == 1 {
                            logger_warn!(
                                client.logger,
                                "{:?} reconnect failed {} times: {}",
                                client,
                                failures,
                                e
                            );
                        } else {
                            logger_debug!(client.logger, "{:?} reconnect failed: {}", client, e);
                        }
                    }
                }
            }
        });
    }

    /// Replace the current channel with a fresh connection right now,
    /// without waiting for the background probe.
    pub async fn reconnect(&self) -> Result<(), RemotingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.url.address()));
        }
        let chan = self.establish().await?;
        if let Some(old) = self.chan.swap(Some(chan)) {
            old.force_close().await;
        }
        logger_info!(self.logger, "{:?} reconnected on demand", self);
        Ok(())
    }

    fn channel(&self) -> Result<Arc<ExchangeChannel<F, H, T>>, RemotingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.url.address()));
        }
        match self.chan.load_full() {
            Some(c) if c.is_alive() => Ok(c),
            _ => Err(RemotingError::closed(&self.url.address())),
        }
    }

    /// The live channel, if any. Mostly for observation.
    pub fn current_channel(&self) -> Option<Arc<ExchangeChannel<F, H, T>>> {
        self.chan.load_full()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.chan.load().as_ref().map(|c| c.is_alive()).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn url(&self) -> &Endpoint {
        &self.url
    }

    pub async fn request(
        &self, data: Vec<u8>, timeout: Option<Duration>,
    ) -> Result<ResponseFuture, RemotingError> {
        self.channel()?.request(data, timeout).await
    }

    pub async fn send(&self, msg: Message) -> Result<(), RemotingError> {
        self.channel()?.send(msg).await
    }

    pub async fn send_payload(&self, data: Vec<u8>) -> Result<(), RemotingError> {
        self.channel()?.send_payload(data).await
    }

    /// Graceful close; also stops the reconnect task.
    pub async fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(chan) = self.chan.swap(None) {
            chan.close(timeout).await;
        }
    }
}

impl<F, H, T> Drop for ExchangeClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(chan) = self.chan.swap(None) {
            chan.abort();
        }
    }
}
