//! Reference-counted clients and the shared per-endpoint pool.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use captains_log::filter::LogFilter;
use crossfire::{mpmc, MAsyncRx, MTx};
use rustc_hash::FxHashMap;

use crate::lazy::LazyClient;
use trunk_rpc_core::error::RemotingError;
use trunk_rpc_core::Endpoint;
use trunk_rpc_exchange::transport::FrameTransport;
use trunk_rpc_exchange::{
    ExchangeClient, ExchangeContext, ExchangeFacts, ExchangeHandler, ResponseFuture,
};

/// A client wrapper that defers the real close until the last referring
/// consumer releases it.
///
/// The refcount starts at 1 for the builder; every additional consumer of
/// the same endpoint increments. [RefCountedClient::close] decrements and
/// only tears the connection down at zero, after which the wrapper swaps
/// in a lazy-connect stub that warns when something still uses it. Closed
/// stays closed: the pool replaces, never revives, a drained wrapper.
pub struct RefCountedClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    url: Endpoint,
    handler: Arc<H>,
    count: AtomicI64,
    closed: AtomicBool,
    inner: Mutex<ClientHandle<F, H, T>>,
    logger: Arc<LogFilter>,
}

enum ClientHandle<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    Eager(Arc<ExchangeClient<F, H, T>>),
    Lazy(Arc<LazyClient<F, H, T>>),
}

impl<F, H, T> Clone for ClientHandle<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    fn clone(&self) -> Self {
        match self {
            Self::Eager(c) => Self::Eager(c.clone()),
            Self::Lazy(c) => Self::Lazy(c.clone()),
        }
    }
}

impl<F, H, T> RefCountedClient<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    /// Build with refcount 1, honoring the URL's `lazy` flag.
    pub(crate) async fn build(
        facts: Arc<F>, ctx: Arc<ExchangeContext>, handler: Arc<H>, url: Endpoint,
    ) -> Result<Arc<Self>, RemotingError> {
        let logger = facts.new_logger();
        let inner = if url.lazy() {
            ClientHandle::Lazy(LazyClient::new(
                facts.clone(),
                ctx.clone(),
                url.clone(),
                handler.clone(),
                false,
            ))
        } else {
            ClientHandle::Eager(
                ExchangeClient::connect(facts.clone(), ctx.clone(), url.clone(), handler.clone())
                    .await?,
            )
        };
        Ok(Arc::new(Self {
            facts,
            ctx,
            url,
            handler,
            count: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            inner: Mutex::new(inner),
            logger,
        }))
    }

    #[inline]
    pub fn url(&self) -> &Endpoint {
        &self.url
    }

    #[inline]
    pub fn ref_count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Healthy for sharing: someone still holds it and it never really
    /// closed.
    pub(crate) fn healthy(&self) -> bool {
        self.ref_count() > 0 && !self.is_closed()
    }

    /// One more consumer; fails once the wrapper drained to zero.
    pub(crate) fn incr(&self) -> bool {
        loop {
            let c = self.count.load(Ordering::Acquire);
            if c <= 0 || self.is_closed() {
                return false;
            }
            if self
                .count
                .compare_exchange(c, c + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn handle(&self) -> ClientHandle<F, H, T> {
        self.inner.lock().unwrap().clone()
    }

    pub async fn request(
        &self, data: Vec<u8>, timeout: Option<Duration>,
    ) -> Result<ResponseFuture, RemotingError> {
        match self.handle() {
            ClientHandle::Eager(c) => c.request(data, timeout).await,
            ClientHandle::Lazy(c) => c.request(data, timeout).await,
        }
    }

    pub async fn send_payload(&self, data: Vec<u8>) -> Result<(), RemotingError> {
        match self.handle() {
            ClientHandle::Eager(c) => c.send_payload(data).await,
            ClientHandle::Lazy(c) => c.send_payload(data).await,
        }
    }

    pub fn is_alive(&self) -> bool {
        if !self.healthy() {
            return false;
        }
        match &*self.inner.lock().unwrap() {
            ClientHandle::Eager(c) => c.is_alive(),
            ClientHandle::Lazy(c) => c.is_alive(),
        }
    }

    /// Release one reference; the underlying close happens only when the
    /// count drains to zero, and never twice.
    pub async fn close(&self, timeout: Duration) {
        loop {
            let c = self.count.load(Ordering::Acquire);
            if c <= 0 {
                logger_warn!(
                    self.logger,
                    "close of already drained client to {}",
                    self.url.address()
                );
                return;
            }
            if self
                .count
                .compare_exchange(c, c - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if c == 1 {
                    self.really_close(timeout).await;
                }
                return;
            }
        }
    }

    async fn really_close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        logger_debug!(self.logger, "last reference gone, closing client to {}", self.url.address());
        let ghost = ClientHandle::Lazy(LazyClient::new(
            self.facts.clone(),
            self.ctx.clone(),
            self.url.clone(),
            self.handler.clone(),
            true,
        ));
        let old = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut *inner, ghost)
        };
        match old {
            ClientHandle::Eager(c) => c.close(timeout).await,
            ClientHandle::Lazy(c) => c.close(timeout).await,
        }
    }
}

enum PoolEntry<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    /// Someone is building the list; wait until the channel closes.
    Building(MAsyncRx<()>),
    Ready(Vec<Arc<RefCountedClient<F, H, T>>>),
}

/// Outcome of a single (synchronous) claim attempt on the pool map.
enum ClaimStep<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    /// A healthy published list was handed out already.
    Ready(Vec<Arc<RefCountedClient<F, H, T>>>),
    /// We published a building sentinel and claimed the build; carries the
    /// claim's sender (drop wakes waiters) and the previous list, if any.
    Claimed(MTx<()>, Option<Vec<Arc<RefCountedClient<F, H, T>>>>),
    /// Someone else is building; wait on this receiver.
    Wait(MAsyncRx<()>),
}

/// Shared clients keyed by endpoint `host:port`.
///
/// The getter protocol: a healthy published list is handed out with every
/// refcount incremented; otherwise the getter publishes a building
/// sentinel, builds or repairs outside the lock, republishes and wakes the
/// waiters parked on the sentinel's channel.
pub struct SharedClientPool<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    facts: Arc<F>,
    ctx: Arc<ExchangeContext>,
    handler: Arc<H>,
    map: Mutex<FxHashMap<String, PoolEntry<F, H, T>>>,
    logger: Arc<LogFilter>,
}

impl<F, H, T> SharedClientPool<F, H, T>
where
    F: ExchangeFacts,
    H: ExchangeHandler,
    T: FrameTransport<F::IO>,
{
    pub(crate) fn new(facts: Arc<F>, ctx: Arc<ExchangeContext>, handler: Arc<H>) -> Self {
        let logger = facts.new_logger();
        Self { facts, ctx, handler, map: Mutex::new(FxHashMap::default()), logger }
    }

    /// Fetch (building if needed) the shared clients of `url`'s endpoint,
    /// incrementing every refcount on behalf of the caller.
    pub async fn get(
        &self, url: &Endpoint, count: usize,
    ) -> Result<Vec<Arc<RefCountedClient<F, H, T>>>, RemotingError> {
        let key = url.address();
        let count = count.max(1);
        // the sender half is our claim; dropping it wakes the waiters
        let (_claim, prev) = loop {
            match self.claim_or_wait(&key) {
                ClaimStep::Ready(list) => return Ok(list),
                ClaimStep::Claimed(claim, prev) => break (claim, prev),
                ClaimStep::Wait(rx) => {
                    // wakes by channel close when the builder publishes
                    let _ = rx.recv().await;
                    continue;
                }
            }
        };

        let built = self.build_or_repair(url, count, prev).await;
        let mut map = self.map.lock().unwrap();
        match built {
            Ok(list) => {
                map.insert(key, PoolEntry::Ready(list.clone()));
                Ok(list)
            }
            Err(e) => {
                map.remove(&key);
                Err(e)
            }
        }
    }

    /// Synchronous (non-async) decision step so the mutex guard never
    /// needs to coexist with an `.await` point in `get`'s state machine.
    fn claim_or_wait(&self, key: &str) -> ClaimStep<F, H, T> {
        let mut map = self.map.lock().unwrap();
        match map.get(key) {
            Some(PoolEntry::Ready(list)) if list.iter().all(|c| c.healthy()) => {
                for client in list.iter() {
                    client.incr();
                }
                ClaimStep::Ready(list.clone())
            }
            Some(PoolEntry::Ready(list)) => {
                let prev = list.clone();
                let (tx, rx) = mpmc::unbounded_async::<()>();
                map.insert(key.to_string(), PoolEntry::Building(rx));
                ClaimStep::Claimed(tx, Some(prev))
            }
            Some(PoolEntry::Building(rx)) => ClaimStep::Wait(rx.clone()),
            None => {
                let (tx, rx) = mpmc::unbounded_async::<()>();
                map.insert(key.to_string(), PoolEntry::Building(rx));
                ClaimStep::Claimed(tx, None)
            }
        }
    }

    async fn build_or_repair(
        &self, url: &Endpoint, count: usize,
        prev: Option<Vec<Arc<RefCountedClient<F, H, T>>>>,
    ) -> Result<Vec<Arc<RefCountedClient<F, H, T>>>, RemotingError> {
        match prev {
            None => {
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.build_one(url).await {
                        Ok(client) => list.push(client),
                        Err(e) => {
                            for built in list {
                                built.close(Duration::ZERO).await;
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(list)
            }
            Some(prev) => {
                let mut list = Vec::with_capacity(prev.len());
                for client in prev {
                    if client.healthy() && client.incr() {
                        list.push(client);
                    } else {
                        logger_debug!(
                            self.logger,
                            "replacing drained shared client to {}",
                            url.address()
                        );
                        list.push(self.build_one(url).await?);
                    }
                }
                Ok(list)
            }
        }
    }

    async fn build_one(
        &self, url: &Endpoint,
    ) -> Result<Arc<RefCountedClient<F, H, T>>, RemotingError> {
        RefCountedClient::build(
            self.facts.clone(),
            self.ctx.clone(),
            self.handler.clone(),
            url.clone(),
        )
        .await
    }

    /// Release one reference on every published client (idempotent, the
    /// real close still waits for the last holder) and forget the
    /// bookkeeping.
    pub(crate) async fn close_all(&self) {
        let entries: Vec<PoolEntry<F, H, T>> = {
            let mut map = self.map.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            if let PoolEntry::Ready(list) = entry {
                for client in list {
                    client.close(client.url().shutdown_timeout()).await;
                }
            }
        }
    }
}
