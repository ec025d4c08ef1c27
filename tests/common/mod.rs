//! Shared wiring of the integration tests: tokio over the TCP transport
//! with msgpack bodies.

#![allow(dead_code)]

use std::sync::Arc;

use captains_log::*;
use rstest::*;

use trunk_rpc::{FnInvoker, ProviderInvoker, RpcProtocol};
use trunk_rpc_exchange::ExchangeDefault;

pub type RT = trunk_rpc_tokio::TokioRT;
pub type Facts = ExchangeDefault<RT>;
pub type Transport = trunk_rpc_tcp::TcpTransport<RT>;
pub type Ser = trunk_rpc_codec::MsgpSerializer;
pub type Protocol = RpcProtocol<Facts, Transport, Ser>;

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

pub struct TestRunner {
    rt: tokio::runtime::Runtime,
}

impl std::fmt::Debug for TestRunner {
    fn fmt(&self, _f: &mut std::fmt::Formatter) -> std::fmt::Result {
        Ok(())
    }
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/trunk_rpc_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: std::future::Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

pub fn new_protocol() -> Arc<Protocol> {
    let facts = ExchangeDefault::new(RT::new_global());
    facts.set_log_level(log::Level::Trace);
    RpcProtocol::new(facts)
}

/// Echo provider: the encoded args come straight back as the value, after
/// an optional artificial delay.
pub fn echo_invoker(delay_ms: u64) -> Arc<dyn ProviderInvoker> {
    FnInvoker::new(move |inv, _ctx| {
        Box::pin(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            Ok(inv.args)
        })
    })
}

/// Provider that fails with a biz error for the `div0` method.
pub fn faulty_invoker() -> Arc<dyn ProviderInvoker> {
    FnInvoker::new(|inv, _ctx| {
        Box::pin(async move {
            if inv.method == "div0" {
                Err(trunk_rpc::error::RpcError::Biz("division by zero".to_string()))
            } else {
                Ok(inv.args)
            }
        })
    })
}
