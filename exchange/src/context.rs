//! Explicit process context of the exchange layer.
//!
//! Holds the request-id and conn-id allocators and the pending-call
//! registry. Nothing here is a global: every [crate::ExchangeClient] and
//! [crate::ExchangeServer] is built against a context instance, and tests
//! run isolated ones.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::facts::ExchangeFacts;
use crate::pending::PendingCalls;
use trunk_rpc_core::runtime::AsyncIO;

/// Wheel granularity; coarse on purpose, deadlines re-check on pop.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

pub struct ExchangeContext {
    request_id: AtomicU64,
    conn_id: AtomicU64,
    pub pending: Arc<PendingCalls>,
    ticker_started: AtomicBool,
}

impl ExchangeContext {
    pub fn new() -> Arc<Self> {
        Self::with_tick(DEFAULT_TICK)
    }

    pub fn with_tick(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            request_id: AtomicU64::new(1),
            conn_id: AtomicU64::new(1),
            pending: PendingCalls::new(tick),
            ticker_started: AtomicBool::new(false),
        })
    }

    /// Monotone per-process request id, wraparound safe over 64 bits.
    #[inline]
    pub fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn next_conn_id(&self) -> u64 {
        self.conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the wheel ticker once; every subsequent call is a noop. The
    /// task holds only a weak reference and dies with the context.
    pub fn start_ticker<F: ExchangeFacts>(self: &Arc<Self>, facts: &F) {
        if self.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let tick = self.pending.tick_interval();
        facts.spawn_detach(async move {
            loop {
                <F::IO as AsyncIO>::sleep(tick).await;
                match weak.upgrade() {
                    Some(ctx) => ctx.pending.advance(Instant::now()),
                    None => return,
                }
            }
        });
    }
}
