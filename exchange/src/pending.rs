//! The pending-call registry.
//!
//! Every outbound two-way request has exactly one entry here until its
//! terminal event: the matching response arrives, the timeout wheel fires,
//! or the owning channel dies. All three paths converge on the same
//! completion slot, so a caller awaiting a [ResponseFuture] always receives
//! exactly one [Response], synthesized or real.
//!
//! Timeouts run on a coarse bucket wheel advanced by the context ticker.
//! Each call is parked `ceil(timeout / tick)` buckets ahead; on expiry the
//! deadline is re-checked so early pops (wheel jitter, clamped long
//! timeouts) re-park instead of firing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossfire::{mpsc, AsyncRx, MTx};
use rustc_hash::FxHashMap;

use crate::proto::{Request, Response, Status};
use trunk_rpc_core::runtime::AsyncIO;
use trunk_rpc_core::time::now_millis;

/// Upper bound of wheel buckets kept in memory; longer timeouts re-park.
const WHEEL_CAP: usize = 512;

pub struct PendingCalls {
    tick: Duration,
    inner: Mutex<Registry>,
}

struct Registry {
    calls: FxHashMap<u64, PendingCall>,
    wheel: VecDeque<Vec<u64>>,
}

struct PendingCall {
    id: u64,
    conn_id: u64,
    peer: String,
    deadline: Instant,
    timeout: Duration,
    start_ms: u64,
    sent_ms: u64,
    summary: String,
    slot: MTx<Response>,
}

/// Completion handle of one outstanding request.
pub struct ResponseFuture {
    id: u64,
    rx: AsyncRx<Response>,
    calls: Weak<PendingCalls>,
}

impl ResponseFuture {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the terminal response. Never hangs forever: the timeout
    /// wheel or a channel close always completes the slot.
    pub async fn wait(self) -> Response {
        match self.rx.recv().await {
            Ok(resp) => resp,
            // the registry dropped the slot without completing, treat as a
            // local fault
            Err(_) => Response::fault(self.id, Status::ClientError, "completion slot gone"),
        }
    }

    /// Wait up to `limit`; hands the future back on expiry so the caller
    /// may keep waiting or cancel.
    pub async fn wait_timeout<IO: AsyncIO>(self, limit: Duration) -> Result<Response, Self> {
        let got = IO::timeout(limit, self.rx.recv()).await;
        match got {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => {
                Ok(Response::fault(self.id, Status::ClientError, "completion slot gone"))
            }
            Err(()) => Err(self),
        }
    }

    /// Complete the call locally with CLIENT_ERROR and drop the registry
    /// entries. In-flight bytes are not retracted; a late reply is dropped.
    pub fn cancel(&self) {
        if let Some(calls) = self.calls.upgrade() {
            calls.cancel(self.id);
        }
    }
}

impl PendingCalls {
    pub fn new(tick: Duration) -> Arc<Self> {
        assert!(!tick.is_zero());
        Arc::new(Self {
            tick,
            inner: Mutex::new(Registry { calls: FxHashMap::default(), wheel: VecDeque::new() }),
        })
    }

    #[inline]
    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    fn bucket_for(&self, reg: &mut Registry, remaining: Duration) -> usize {
        let mut ticks = remaining.as_micros().div_ceil(self.tick.as_micros().max(1)) as usize;
        ticks = ticks.clamp(1, WHEEL_CAP);
        while reg.wheel.len() < ticks {
            reg.wheel.push_back(Vec::new());
        }
        ticks - 1
    }

    /// Insert the call and arm its wheel slot.
    pub fn register(
        self: &Arc<Self>, conn_id: u64, peer: &str, req: &Request, timeout: Duration,
    ) -> ResponseFuture {
        let (tx, rx) = mpsc::bounded_async::<Response>(1);
        let call = PendingCall {
            id: req.id,
            conn_id,
            peer: peer.to_string(),
            deadline: Instant::now() + timeout,
            timeout,
            start_ms: now_millis(),
            sent_ms: 0,
            summary: format!("{:?}", req),
            slot: tx.into(),
        };
        let mut reg = self.inner.lock().unwrap();
        let idx = self.bucket_for(&mut reg, timeout);
        reg.wheel[idx].push(req.id);
        reg.calls.insert(req.id, call);
        ResponseFuture { id: req.id, rx, calls: Arc::downgrade(self) }
    }

    /// Deliver a response. Unknown ids are logged and dropped; the entry
    /// removal also clears the id→conn association.
    pub fn received(&self, conn_id: u64, resp: Response, timed_out: bool) {
        let call = { self.inner.lock().unwrap().calls.remove(&resp.id) };
        match call {
            Some(call) => {
                if timed_out {
                    logged_complete(call, resp);
                } else {
                    complete(call, resp);
                }
            }
            None => {
                warn!(
                    "response id {} status {} on conn {} matches no pending call (late, canceled or duplicate), dropped",
                    resp.id, resp.status, conn_id
                );
            }
        }
    }

    /// Stamp the moment the request left the send buffer, deciding
    /// server-vs-client attribution if the call later times out.
    pub fn sent(&self, id: u64) {
        let mut reg = self.inner.lock().unwrap();
        if let Some(call) = reg.calls.get_mut(&id) {
            if call.sent_ms == 0 {
                call.sent_ms = now_millis();
            }
        }
    }

    /// Complete every call owned by `conn_id` with CHANNEL_INACTIVE.
    pub fn close_conn(&self, conn_id: u64, peer: &str) {
        let drained: Vec<PendingCall> = {
            let mut reg = self.inner.lock().unwrap();
            let ids: Vec<u64> = reg
                .calls
                .iter()
                .filter(|(_, c)| c.conn_id == conn_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| reg.calls.remove(&id)).collect()
        };
        for call in drained {
            let msg = format!(
                "channel {} is inactive, directly return the unfinished request: {}",
                peer, call.summary
            );
            let id = call.id;
            complete(call, Response::fault(id, Status::ChannelInactive, &msg));
        }
    }

    pub fn cancel(&self, id: u64) {
        let call = { self.inner.lock().unwrap().calls.remove(&id) };
        if let Some(call) = call {
            complete(call, Response::fault(id, Status::ClientError, "the call was canceled"));
        }
    }

    pub fn has_conn(&self, conn_id: u64) -> bool {
        self.inner.lock().unwrap().calls.values().any(|c| c.conn_id == conn_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotate the wheel one tick: fire due calls, re-park early pops.
    pub fn advance(&self, now: Instant) {
        let due: Vec<u64> = {
            let mut reg = self.inner.lock().unwrap();
            let bucket = match reg.wheel.pop_front() {
                Some(b) => b,
                None => return,
            };
            reg.wheel.push_back(Vec::new());
            let mut due = Vec::new();
            for id in bucket {
                match reg.calls.get(&id) {
                    None => {} // already completed
                    Some(call) if call.deadline <= now => due.push(id),
                    Some(call) => {
                        let remaining = call.deadline - now;
                        let idx = self.bucket_for(&mut reg, remaining);
                        reg.wheel[idx].push(id);
                    }
                }
            }
            due
        };
        for id in due {
            self.expire(id);
        }
    }

    fn expire(&self, id: u64) {
        let call = { self.inner.lock().unwrap().calls.remove(&id) };
        let Some(call) = call else { return };
        let now = now_millis();
        let status =
            if call.sent_ms > 0 { Status::ServerTimeout } else { Status::ClientTimeout };
        let elapsed = if call.sent_ms > 0 {
            format!(
                "client elapsed: {} ms, server elapsed: {} ms",
                call.sent_ms.saturating_sub(call.start_ms),
                now.saturating_sub(call.sent_ms),
            )
        } else {
            format!("elapsed: {} ms", now.saturating_sub(call.start_ms))
        };
        let msg = format!(
            "{} by scan timer. start time: {}, end time: {}, {}, timeout: {} ms, request: {}, channel: {}",
            if call.sent_ms > 0 {
                "waiting server-side response timeout"
            } else {
                "sending request timeout in client-side"
            },
            call.start_ms,
            now,
            elapsed,
            call.timeout.as_millis(),
            call.summary,
            call.peer,
        );
        logged_complete(call, Response::fault(id, status, &msg));
    }
}

fn complete(call: PendingCall, resp: Response) {
    // single completion: the entry was removed under the lock before we
    // got here, so only one path can hold it
    let _ = call.slot.send(resp);
}

fn logged_complete(call: PendingCall, resp: Response) {
    warn!("call to {} reached terminal {}: {}", call.peer, resp.status, resp.err_msg);
    complete(call, resp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::block_on;

    const TICK: Duration = Duration::from_millis(10);

    fn reg() -> Arc<PendingCalls> {
        PendingCalls::new(TICK)
    }

    fn drive(calls: &Arc<PendingCalls>, upto: Duration) {
        // simulate the ticker without a runtime
        let steps = (upto.as_millis() / TICK.as_millis()) as u32 + 2;
        let base = Instant::now();
        for i in 1..=steps {
            calls.advance(base + TICK * i);
        }
    }

    #[test]
    fn test_received_completes_and_removes() {
        let calls = reg();
        let req = Request::new(1, b"a".to_vec());
        let fut = calls.register(9, "peer", &req, Duration::from_millis(100));
        assert!(calls.has_conn(9));
        calls.received(9, Response::ok(1, b"r".to_vec()), false);
        assert!(!calls.has_conn(9));
        let resp = block_on(fut.wait());
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.result, b"r");
        // a second response with the same id is a drop, not a panic
        calls.received(9, Response::ok(1, vec![]), false);
    }

    #[test]
    fn test_timeout_client_side_when_unsent() {
        let calls = reg();
        let req = Request::new(2, vec![]);
        let fut = calls.register(1, "peer", &req, Duration::from_millis(30));
        drive(&calls, Duration::from_millis(40));
        let resp = block_on(fut.wait());
        assert_eq!(resp.status, Status::ClientTimeout);
        assert!(resp.err_msg.contains("client-side"));
        assert!(calls.is_empty());
    }

    #[test]
    fn test_timeout_server_side_after_sent() {
        let calls = reg();
        let req = Request::new(3, vec![]);
        let fut = calls.register(1, "peer", &req, Duration::from_millis(30));
        calls.sent(3);
        drive(&calls, Duration::from_millis(40));
        let resp = block_on(fut.wait());
        assert_eq!(resp.status, Status::ServerTimeout);
        assert!(resp.err_msg.contains("server elapsed"));
    }

    #[test]
    fn test_receive_beats_timer() {
        let calls = reg();
        let req = Request::new(4, vec![]);
        let fut = calls.register(1, "peer", &req, Duration::from_millis(30));
        calls.received(1, Response::ok(4, vec![]), false);
        // the timer pops later and must find nothing
        drive(&calls, Duration::from_millis(60));
        let resp = block_on(fut.wait());
        assert_eq!(resp.status, Status::Ok);
    }

    #[test]
    fn test_close_conn_fanout() {
        let calls = reg();
        let mut futs = Vec::new();
        for id in 10..13u64 {
            let req = Request::new(id, vec![]);
            futs.push(calls.register(7, "peer7", &req, Duration::from_secs(5)));
        }
        let other = calls.register(8, "peer8", &Request::new(99, vec![]), Duration::from_secs(5));
        calls.close_conn(7, "peer7");
        for fut in futs {
            let resp = block_on(fut.wait());
            assert_eq!(resp.status, Status::ChannelInactive);
        }
        assert!(calls.has_conn(8));
        other.cancel();
        let resp = block_on(other.wait());
        assert_eq!(resp.status, Status::ClientError);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_long_timeout_reparks_past_wheel_cap() {
        let calls = reg();
        let long = TICK * (WHEEL_CAP as u32 * 3);
        let fut = calls.register(1, "peer", &Request::new(5, vec![]), long);
        // run past the clamped bucket but short of the deadline
        drive(&calls, TICK * (WHEEL_CAP as u32 + 4));
        assert_eq!(calls.len(), 1);
        drive(&calls, long + TICK * 4);
        let resp = block_on(fut.wait());
        assert_eq!(resp.status, Status::ClientTimeout);
    }
}
