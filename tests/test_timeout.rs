mod common;

use common::*;
use rstest::rstest;
use std::time::Duration;

use trunk_rpc::error::{RpcError, TimeoutSide};
use trunk_rpc::Endpoint;

#[rstest]
fn test_slow_provider_times_out(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Slow".parse().unwrap();
        // provider sleeps well past the consumer deadline
        let exporter = provider.export(url, echo_invoker(2000)).expect("export");

        let consumer = new_protocol();
        let referred = exporter.url().clone().with_param("timeout", "500");
        let invoker = consumer.refer(referred).await.expect("refer");

        let start = std::time::Instant::now();
        let out = invoker.call::<_, String>("nap", &"zzz".to_string()).await;
        let elapsed = start.elapsed();
        match out {
            Err(e) if e.is_timeout() => {
                // the request left the socket, so the provider side is at fault
                assert_eq!(e.timeout_side(), Some(TimeoutSide::Server));
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        // fired near the deadline, far before the provider answers
        assert!(elapsed >= Duration::from_millis(450), "too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1800), "too late: {:?}", elapsed);

        // registry is empty after the timer fired
        assert!(consumer.context().pending.is_empty());

        // the late response from the provider is dropped silently and the
        // channel keeps working
        tokio::time::sleep(Duration::from_millis(1800)).await;
        let quick = exporter.url().clone();
        let invoker2 = consumer.refer(quick).await.expect("refer again");
        let _ = invoker2;

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_per_call_timeout_attachment(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Slow2".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(800)).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");

        // URL default is 1000ms; the invocation attachment shortens it
        let ser = Ser::default();
        let mut inv =
            trunk_rpc::RpcInvocation::with_args(&ser, "nap", &"z".to_string()).expect("inv");
        inv.set_attachment(trunk_rpc::attachments::TIMEOUT, "200");
        let fut = invoker.invoke(inv).await.expect("invoke");
        match fut.wait().await {
            Err(e) if e.is_timeout() => {}
            other => panic!("unexpected {:?}", other.err()),
        }

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_wait_timeout_leaves_call_pending(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Slow3".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(600)).expect("export");

        let consumer = new_protocol();
        let referred = exporter.url().clone().with_param("timeout", "5000");
        let invoker = consumer.refer(referred).await.expect("refer");

        let ser = Ser::default();
        let inv = trunk_rpc::RpcInvocation::with_args(&ser, "nap", &"z".to_string()).unwrap();
        let fut = invoker.invoke(inv).await.expect("invoke");
        // give up waiting early; the call itself stays in flight
        match fut.wait_timeout::<RT>(Duration::from_millis(100)).await {
            Err(RpcError::Remoting(trunk_rpc::error::RemotingError::Timeout(t))) => {
                assert_eq!(t.side, TimeoutSide::Client);
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        // the provider finishes and the registry drains on delivery
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(consumer.context().pending.is_empty());

        consumer.destroy().await;
        provider.destroy().await;
    });
}
