//! Helpers shared by the in-crate unit tests.

use std::future::Future;
use std::io;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use trunk_rpc_core::io::AsyncRead;

/// In-memory byte source; never returns Pending.
pub struct Pipe {
    data: Vec<u8>,
    pos: usize,
}

impl Pipe {
    pub fn new(data: &[u8]) -> Self {
        Self { data: data.to_vec(), pos: 0 }
    }
}

impl AsyncRead for Pipe {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    RawWaker::new(std::ptr::null(), &RawWakerVTable::new(clone, noop, noop, noop))
}

/// Busy-poll a future that never parks (Pipe-backed io, channel try paths).
pub fn block_on<F: Future>(f: F) -> F::Output {
    let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut f = std::pin::pin!(f);
    loop {
        if let Poll::Ready(out) = f.as_mut().poll(&mut cx) {
            return out;
        }
    }
}
