//! One live connection wrapped as a message-oriented exchange channel.
//!
//! A channel owns three tasks: a writer draining the bounded outbound
//! queue (batching frames between flushes), a reader routing inbound
//! messages, and a heartbeat watcher. Requests correlate through the
//! context's pending registry; events are consumed right here and never
//! reach the registry or the handler.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use captains_log::filter::LogFilter;
use crossfire::{mpmc, MAsyncRx, MAsyncTx, MTx};

use crate::context::ExchangeContext;
use crate::facts::ExchangeFacts;
use crate::handler::{ExchangeHandler, ReplyContext, Role};
use crate::pending::ResponseFuture;
use crate::proto::{Message, Request, Response, Status};
use crate::transport::FrameTransport;
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::io::Cancellable;
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::time::now_millis;

/// How long a graceful close sleeps between drain checks.
const CLOSE_POLL: Duration = Duration::from_millis(10);

pub(crate) struct Outbound {
    pub msg: Message,
    /// Fired after the message was flushed to the socket.
    pub ack: Option<MTx<()>>,
}

pub struct ExchangeChannel<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    conn_id: u64,
    info: ReplyContext,
    transport: Arc<T>,
    ctx: Arc<ExchangeContext>,
    facts: Arc<F>,
    handler: Arc<H>,
    logger: Arc<LogFilter>,
    out_tx: MAsyncTx<Outbound>,
    close_tx: Mutex<Option<MTx<()>>>,
    close_rx: MAsyncRx<()>,
    /// No new requests accepted.
    closed: AtomicBool,
    /// The io below is torn down.
    dead: AtomicBool,
    readonly: AtomicBool,
    last_read: AtomicU64,
    last_write: AtomicU64,
    inflight: AtomicUsize,
    inflight_limit: Arc<AtomicUsize>,
    disconnect_fired: AtomicBool,
    _conn_guard: Option<Arc<()>>,
}

impl<F, H, T> std::fmt::Debug for ExchangeChannel<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "channel#{}({:?})", self.conn_id, self.info)
    }
}

impl<F, H, T> ExchangeChannel<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    pub(crate) fn spawn(
        facts: Arc<F>, ctx: Arc<ExchangeContext>, handler: Arc<H>, transport: T,
        url: trunk_rpc_core::Endpoint, role: Role, conn_guard: Option<Arc<()>>,
        inflight_limit: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let conn_id = ctx.next_conn_id();
        let logger = facts.new_logger();
        let (out_tx, out_rx) = mpmc::bounded_async::<Outbound>(url.queues());
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        let info = ReplyContext {
            local_addr: transport.local_addr().to_string(),
            remote_addr: transport.peer_addr().to_string(),
            url,
            role,
        };
        let now = now_millis();
        let chan = Arc::new(Self {
            conn_id,
            info,
            transport: Arc::new(transport),
            ctx,
            facts,
            handler,
            logger,
            out_tx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            readonly: AtomicBool::new(false),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            inflight: AtomicUsize::new(0),
            inflight_limit,
            disconnect_fired: AtomicBool::new(false),
            _conn_guard: conn_guard,
        });
        logger_debug!(chan.logger, "{:?} established", chan);

        let writer = chan.clone();
        chan.facts.spawn_detach(async move { writer.writer_loop(out_rx).await });
        let reader = chan.clone();
        chan.facts.spawn_detach(async move { reader.reader_loop().await });
        if !chan.info.url.heartbeat().is_zero() {
            let beat = chan.clone();
            chan.facts.spawn_detach(async move { beat.heartbeat_loop().await });
        }
        let connected = chan.clone();
        chan.facts.spawn_detach(async move {
            connected.handler.connected(&connected.info).await;
        });
        chan
    }

    #[inline]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    #[inline]
    pub fn info(&self) -> &ReplyContext {
        &self.info
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.info.role
    }

    /// Usable for new calls: io up, not closing, peer not readonly.
    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
            && !self.closed.load(Ordering::Acquire)
            && !self.readonly.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    #[inline]
    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_read_ms(&self) -> u64 {
        self.last_read.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_write_ms(&self) -> u64 {
        self.last_write.load(Ordering::Relaxed)
    }

    pub fn has_pending(&self) -> bool {
        self.ctx.pending.has_conn(self.conn_id)
    }

    /// Issue a two-way request; never blocks on the network, the returned
    /// future completes with exactly one terminal response.
    pub async fn request(
        &self, data: Vec<u8>, timeout: Option<Duration>,
    ) -> Result<ResponseFuture, RemotingError> {
        if !self.is_alive() {
            return Err(RemotingError::closed(&self.info.remote_addr));
        }
        self.check_payload(data.len())?;
        let id = self.ctx.next_request_id();
        let req = Request::new(id, data);
        let timeout = timeout.unwrap_or_else(|| self.info.url.timeout());
        let fut = self.ctx.pending.register(self.conn_id, &self.info.remote_addr, &req, timeout);
        if self.enqueue(Message::Request(req), None).await.is_err() {
            // surface the send failure and tear the entry down
            fut.cancel();
            return Err(RemotingError::closed(&self.info.remote_addr));
        }
        Ok(fut)
    }

    /// Forward a message as-is. Payloads that are not already a message
    /// should go through [ExchangeChannel::send_payload].
    pub async fn send(&self, msg: Message) -> Result<(), RemotingError> {
        if self.closed.load(Ordering::Acquire) || self.dead.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.info.remote_addr));
        }
        self.enqueue(msg, None).await
    }

    /// Wrap raw payload bytes in a one-way request, fire and forget. No
    /// pending entry is created and nothing ever times out.
    pub async fn send_payload(&self, data: Vec<u8>) -> Result<(), RemotingError> {
        self.check_payload(data.len())?;
        let req = Request::oneway(self.ctx.next_request_id(), data);
        self.send(Message::Request(req)).await
    }

    /// Fail fast before anything is queued or registered.
    fn check_payload(&self, size: usize) -> Result<(), RemotingError> {
        let limit = self.info.url.payload_limit();
        if limit > 0 && size > limit {
            return Err(RemotingError::PayloadLimit { size, limit });
        }
        Ok(())
    }

    pub(crate) async fn enqueue(
        &self, msg: Message, ack: Option<MTx<()>>,
    ) -> Result<(), RemotingError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(RemotingError::closed(&self.info.remote_addr));
        }
        self.out_tx
            .send(Outbound { msg, ack })
            .await
            .map_err(|_| RemotingError::closed(&self.info.remote_addr))
    }

    /// Graceful close: stop accepting calls, wait for in-flight calls to
    /// drain in 10ms steps up to `timeout`, then tear down. Stragglers
    /// complete with CHANNEL_INACTIVE.
    pub async fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + timeout;
        while self.has_pending() && Instant::now() < deadline {
            <F::IO as AsyncIO>::sleep(CLOSE_POLL).await;
        }
        self.force_close().await;
    }

    /// Immediate teardown, idempotent. The socket itself is shut down by
    /// the writer task when it wakes on the close signal, so no other task
    /// ever touches the write stream.
    pub(crate) async fn force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.dead.swap(true, Ordering::SeqCst) {
            logger_debug!(self.logger, "{:?} closing", self);
        }
        self.close_tx.lock().unwrap().take();
        self.ctx.pending.close_conn(self.conn_id, &self.info.remote_addr);
        if !self.disconnect_fired.swap(true, Ordering::SeqCst) {
            self.handler.disconnected(&self.info).await;
        }
    }

    /// Synchronous poison: wakes the reader which finishes the teardown.
    pub(crate) fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_tx.lock().unwrap().take();
    }

    async fn writer_loop(self: Arc<Self>, out_rx: MAsyncRx<Outbound>) {
        loop {
            let first = match Cancellable::new(out_rx.recv(), self.close_rx.recv()).await {
                Ok(Ok(ob)) => ob,
                // close signal or all senders gone: flush what is queued,
                // then hang up the write direction
                _ => {
                    let mut tail = Vec::new();
                    while let Ok(ob) = out_rx.try_recv() {
                        tail.push(ob);
                    }
                    if !tail.is_empty() {
                        let _ = self.write_batch(tail).await;
                    }
                    self.transport.shutdown().await;
                    return;
                }
            };
            let mut batch = vec![first];
            while let Ok(ob) = out_rx.try_recv() {
                batch.push(ob);
            }
            if self.write_batch(batch).await.is_err() {
                self.force_close().await;
                self.transport.shutdown().await;
                return;
            }
        }
    }

    async fn write_batch(&self, batch: Vec<Outbound>) -> Result<(), ()> {
        for ob in batch.iter() {
            if let Err(e) = self.transport.write_message(&self.logger, &ob.msg, false).await {
                logger_warn!(self.logger, "{:?} write failed: {}", self, e);
                return Err(());
            }
        }
        if let Err(e) = self.transport.flush(&self.logger).await {
            logger_warn!(self.logger, "{:?} flush failed: {}", self, e);
            return Err(());
        }
        self.last_write.store(now_millis(), Ordering::Relaxed);
        for ob in batch {
            if let Message::Request(ref req) = ob.msg {
                if req.two_way && !req.event {
                    self.ctx.pending.sent(req.id);
                }
            }
            if let Some(ack) = ob.ack {
                let _ = ack.send(());
            }
        }
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>) {
        loop {
            match self.transport.read_message(&self.logger, &self.close_rx).await {
                Ok(None) => break,
                Err(e) => {
                    logger_debug!(self.logger, "{:?} read loop ends: {}", self, e);
                    break;
                }
                Ok(Some(msg)) => {
                    self.last_read.store(now_millis(), Ordering::Relaxed);
                    self.on_message(msg).await;
                }
            }
        }
        self.force_close().await;
    }

    async fn on_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Response(resp) => {
                if resp.event {
                    logger_trace!(self.logger, "{:?} heartbeat ack id={}", self, resp.id);
                    return;
                }
                self.ctx.pending.received(self.conn_id, resp, false);
            }
            Message::Request(req) if req.event => {
                if req.is_readonly() {
                    logger_info!(self.logger, "{:?} peer went readonly", self);
                    self.readonly.store(true, Ordering::SeqCst);
                } else if req.two_way {
                    let _ = self.enqueue(Message::Response(Response::event_ack(req.id)), None).await;
                }
            }
            Message::Request(req) => self.on_invocation(req).await,
            Message::Text(line) => {
                if let Some(reply) = self.handler.telnet(&self.info, line.trim()) {
                    let _ = self.enqueue(Message::Text(reply), None).await;
                }
            }
        }
    }

    async fn on_invocation(self: &Arc<Self>, req: Request) {
        let (id, two_way) = (req.id, req.two_way);
        if req.broken {
            logger_warn!(self.logger, "{:?} broken request id={}", self, id);
            if two_way {
                let resp = Response::fault(id, Status::BadRequest, "undecodable request");
                let _ = self.enqueue(Message::Response(resp), None).await;
            }
            return;
        }
        let limit = self.inflight_limit.load(Ordering::Relaxed);
        if limit > 0 && self.inflight.load(Ordering::Acquire) >= limit {
            logger_warn!(self.logger, "{:?} rejects id={}, {} invocations in flight", self, id, limit);
            if two_way {
                let resp = Response::fault(
                    id,
                    Status::ServerError,
                    &format!("in-flight invocation limit {} exceeded", limit),
                );
                let _ = self.enqueue(Message::Response(resp), None).await;
            }
            return;
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let chan = self.clone();
        self.facts.spawn_detach(async move {
            let outcome = chan.handler.reply(&chan.info, req.data).await;
            if two_way {
                let resp = match outcome {
                    Ok(result) => match chan.check_payload(result.len()) {
                        Ok(()) => Response::ok(id, result),
                        Err(e) => Response::fault(id, Status::ServerError, &e.to_string()),
                    },
                    Err(fault) => Response::fault(id, fault.status, &fault.message),
                };
                let _ = chan.enqueue(Message::Response(resp), None).await;
            }
            chan.inflight.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let hb = self.info.url.heartbeat();
        let hb_ms = hb.as_millis() as u64;
        let period = (hb / 3).max(Duration::from_millis(100));
        loop {
            let _ = self.close_rx.recv_with_timer(<F::IO as AsyncIO>::sleep(period)).await;
            if self.closed.load(Ordering::Acquire) || self.dead.load(Ordering::Acquire) {
                return;
            }
            let now = now_millis();
            let idle_read = now.saturating_sub(self.last_read.load(Ordering::Relaxed));
            if idle_read >= hb_ms.saturating_mul(3) {
                match self.info.role {
                    Role::Server => {
                        logger_warn!(
                            self.logger,
                            "{:?} no reads for {} ms, closing idle channel",
                            self,
                            idle_read
                        );
                    }
                    Role::Client => {
                        logger_warn!(
                            self.logger,
                            "{:?} no reads for {} ms, tearing down for reconnect",
                            self,
                            idle_read
                        );
                    }
                }
                self.force_close().await;
                return;
            }
            if self.info.role == Role::Client
                && now.saturating_sub(self.last_write.load(Ordering::Relaxed)) >= hb_ms
            {
                let req = Request::heartbeat(self.ctx.next_request_id());
                logger_trace!(self.logger, "{:?} heartbeat probe id={}", self, req.id);
                let _ = self.enqueue(Message::Request(req), None).await;
            }
        }
    }
}
