//! onconnect / ondisconnect invocations declared on the endpoint URL.

mod common;

use common::*;
use rstest::rstest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trunk_rpc::{Endpoint, FnInvoker, ProviderInvoker};

struct Counters {
    up: AtomicUsize,
    down: AtomicUsize,
    calls: AtomicUsize,
}

fn counting_invoker(counters: Arc<Counters>) -> Arc<dyn ProviderInvoker> {
    FnInvoker::new(move |inv, _ctx| {
        let counters = counters.clone();
        Box::pin(async move {
            match inv.method.as_str() {
                "onPeerUp" => {
                    counters.up.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
                "onPeerDown" => {
                    counters.down.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
                _ => {
                    counters.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(inv.args)
                }
            }
        })
    })
}

#[rstest]
fn test_connect_and_disconnect_events_fire(runner: TestRunner) {
    runner.block_on(async {
        let counters =
            Arc::new(Counters { up: AtomicUsize::new(0), down: AtomicUsize::new(0), calls: AtomicUsize::new(0) });
        let provider = new_protocol();
        let url: Endpoint =
            "127.0.0.1:0/com.acme.Watched?onconnect=onPeerUp&ondisconnect=onPeerDown"
                .parse()
                .unwrap();
        let exporter = provider.export(url, counting_invoker(counters.clone())).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");
        let out: String = invoker.call("echo", &"x".to_string()).await.expect("call");
        assert_eq!(out, "x");

        // the accepted channel fired the one-way connect invocation
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.up.load(Ordering::SeqCst), 1);
        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.down.load(Ordering::SeqCst), 0);

        // closing the consumer side fires the disconnect invocation
        consumer.destroy().await;
        let mut seen = 0;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            seen = counters.down.load(Ordering::SeqCst);
            if seen > 0 {
                break;
            }
        }
        assert_eq!(seen, 1);

        provider.destroy().await;
    });
}
