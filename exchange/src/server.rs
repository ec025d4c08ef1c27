//! Server side of the exchange layer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use captains_log::filter::LogFilter;
use crossfire::mpsc;
use futures::future::{AbortHandle, Abortable};

use crate::channel::ExchangeChannel;
use crate::context::ExchangeContext;
use crate::facts::ExchangeFacts;
use crate::handler::{ExchangeHandler, Role};
use crate::proto::{Message, Request};
use crate::transport::{ConnOptions, FrameTransport};
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::io::AsyncListener;
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::{params, Endpoint};

const CLOSE_POLL: Duration = Duration::from_millis(10);

/// A listening exchange server.
///
/// Accepting is bounded by the URL's `accepts` (0 = unlimited, counted
/// through the strong count of a shared guard each channel holds).
/// [ExchangeServer::close] is a single drain-then-force operation: abort
/// the listener, broadcast the readonly event, wait for in-flight
/// invocations and pending calls up to the deadline, then tear every
/// channel down.
pub struct ExchangeServer<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    shared: Arc<ServerShared<F, H, T>>,
    local_addr: String,
}

struct ServerShared<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    handler: Arc<H>,
    logger: Arc<LogFilter>,
    url: Mutex<Endpoint>,
    opt: ConnOptions,
    conn_count: Arc<()>,
    conns: Mutex<Vec<Weak<ExchangeChannel<F, H, T>>>>,
    accepts: AtomicUsize,
    inflight_limit: Arc<AtomicUsize>,
    closing: AtomicBool,
    closed: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl<F, H, T> ServerShared<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn live_count(&self) -> usize {
        Arc::strong_count(&self.conn_count) - 1
    }

    fn live_channels(&self) -> Vec<Arc<ExchangeChannel<F, H, T>>> {
        let mut conns = self.conns.lock().unwrap();
        conns.retain(|w| w.strong_count() > 0);
        conns.iter().filter_map(|w| w.upgrade()).collect()
    }

    fn on_accept(self: &Arc<Self>, stream: <T::Listener as AsyncListener>::Conn) {
        if self.closing.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            logger_warn!(self.logger, "reject new channel, server is shutting down");
            return;
        }
        let accepts = self.accepts.load(Ordering::Relaxed);
        if accepts > 0 && self.live_count() >= accepts {
            logger_error!(
                self.logger,
                "close new channel, {} live connections reached the accepts limit {}",
                self.live_count(),
                accepts
            );
            return;
        }
        let url = self.url.lock().unwrap().clone();
        match T::accepted(stream, &self.opt) {
            Err(e) => {
                logger_warn!(self.logger, "failed to wrap accepted stream: {}", e);
            }
            Ok(transport) => {
                let chan = ExchangeChannel::spawn(
                    self.facts.clone(),
                    self.ctx.clone(),
                    self.handler.clone(),
                    transport,
                    url,
                    Role::Server,
                    Some(self.conn_count.clone()),
                    self.inflight_limit.clone(),
                );
                self.conns.lock().unwrap().push(Arc::downgrade(&chan));
            }
        }
    }
}

impl<F, H, T> ExchangeServer<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    /// Open the listening socket at the URL's bind address and start
    /// accepting.
    pub fn bind(
        facts: Arc<F>, ctx: Arc<ExchangeContext>, url: Endpoint, handler: Arc<H>,
    ) -> Result<Self, RemotingError> {
        ctx.start_ticker(facts.as_ref());
        let opt = ConnOptions::derive(&url)?;
        let bind_addr = url.bind_addr();
        let mut listener = <T::Listener as AsyncListener>::bind(&bind_addr)
            .map_err(|e| RemotingError::Bind { addr: bind_addr.clone(), source: e })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RemotingError::Bind { addr: bind_addr.clone(), source: e })?;
        let logger = facts.new_logger();
        let shared = Arc::new(ServerShared {
            accepts: AtomicUsize::new(url.accepts()),
            inflight_limit: Arc::new(AtomicUsize::new(url.inflight_limit())),
            facts,
            ctx,
            handler,
            logger,
            url: Mutex::new(url),
            opt,
            conn_count: Arc::new(()),
            conns: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            abort: Mutex::new(None),
        });
        logger_info!(shared.logger, "listening on {}", local_addr);

        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        *shared.abort.lock().unwrap() = Some(abort_handle);
        let accept_shared = shared.clone();
        let accept_loop = Abortable::new(
            async move {
                loop {
                    match listener.accept().await {
                        Err(e) => {
                            logger_warn!(accept_shared.logger, "accept error: {}", e);
                            return;
                        }
                        Ok(stream) => accept_shared.on_accept(stream),
                    }
                }
            },
            abort_reg,
        );
        shared.facts.spawn_detach(accept_loop);
        Ok(Self { shared, local_addr })
    }

    #[inline]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok()).unwrap_or(0)
    }

    pub fn conn_count(&self) -> usize {
        self.shared.live_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shared.url.lock().unwrap().shutdown_timeout()
    }

    /// Update the live tunables (`accepts`, `inflights`) without
    /// restarting; other parameters only affect channels accepted after a
    /// rebind.
    pub fn reset(&self, patch: &Endpoint) {
        if let Some(v) = patch.param(params::ACCEPTS).and_then(|v| v.parse::<usize>().ok()) {
            self.shared.accepts.store(v, Ordering::Relaxed);
        }
        if let Some(v) = patch.param(params::INFLIGHTS).and_then(|v| v.parse::<usize>().ok()) {
            self.shared.inflight_limit.store(v, Ordering::Relaxed);
        }
        let mut url = self.shared.url.lock().unwrap();
        *url = url.with_params_of(patch);
    }

    /// Broadcast a message to every live channel.
    pub async fn send(&self, msg: Message) {
        for chan in self.shared.live_channels() {
            if chan.send(msg.clone()).await.is_err() {
                logger_debug!(self.shared.logger, "broadcast skipped dead {:?}", chan);
            }
        }
    }

    async fn broadcast_readonly(&self, deadline: Instant) {
        let mut acks = Vec::new();
        for chan in self.shared.live_channels() {
            let req = Request::readonly(self.shared.ctx.next_request_id());
            let (ack_tx, ack_rx) = mpsc::bounded_async::<()>(1);
            if chan.enqueue(Message::Request(req), Some(ack_tx.into())).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        // block the shutdown until the events hit the sockets, within the
        // overall deadline
        for ack in acks {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            let _ = <F::IO as AsyncIO>::timeout(left, ack.recv()).await;
        }
    }

    /// Graceful close: one drain-then-force operation.
    pub async fn close(&self, timeout: Duration) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        logger_info!(self.shared.logger, "closing server {}", self.local_addr);
        if let Some(handle) = self.shared.abort.lock().unwrap().take() {
            handle.abort();
        }
        let deadline = Instant::now() + timeout;
        let readonly_sent = { self.shared.url.lock().unwrap().readonly_sent() };
        if readonly_sent {
            self.broadcast_readonly(deadline).await;
        }
        loop {
            let busy = self
                .shared
                .live_channels()
                .iter()
                .any(|c| c.inflight_count() > 0 || c.has_pending());
            if !busy || Instant::now() >= deadline {
                break;
            }
            <F::IO as AsyncIO>::sleep(CLOSE_POLL).await;
        }
        let leftover = self.shared.live_count();
        if leftover > 0 {
            logger_warn!(
                self.shared.logger,
                "forcing {} channels closed at shutdown deadline",
                leftover
            );
        }
        for chan in self.shared.live_channels() {
            chan.force_close().await;
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        logger_info!(self.shared.logger, "server {} closed", self.local_addr);
    }
}

impl<F, H, T> Drop for ExchangeServer<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn drop(&mut self) {
        if let Some(handle) = self.shared.abort.lock().unwrap().take() {
            handle.abort();
        }
        for chan in self.shared.live_channels() {
            chan.abort();
        }
    }
}
