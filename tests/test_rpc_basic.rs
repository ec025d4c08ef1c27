mod common;

use common::*;
use rstest::rstest;
use std::time::Duration;

use trunk_rpc::error::{RemotingError, RpcError};
use trunk_rpc::Endpoint;

#[rstest]
fn test_echo_happy_path(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint =
            "127.0.0.1:0/com.acme.Echo?version=1.0.0&timeout=1000".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");

        let reply: String = invoker.call("echo", &"hi".to_string()).await.expect("call");
        assert_eq!(reply, "hi");
        // the pending registry must be clean again
        assert!(consumer.context().pending.is_empty());

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_biz_error_passthrough(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Math".parse().unwrap();
        let exporter = provider.export(url, faulty_invoker()).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");

        match invoker.call::<_, u32>("div0", &(1u32, 0u32)).await {
            Err(RpcError::Biz(msg)) => assert_eq!(msg, "division by zero"),
            other => panic!("unexpected {:?}", other.err()),
        }
        // an ok method on the same invoker still works
        let back: (u32, u32) = invoker.call("pass", &(1u32, 2u32)).await.expect("pass");
        assert_eq!(back, (1, 2));

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_oneway_registers_nothing(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Log".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");

        invoker.notify("append", &"line one".to_string()).await.expect("notify");
        assert!(consumer.context().pending.is_empty());
        // nothing ever times out for a one-way send
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(consumer.context().pending.is_empty());

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_duplicate_export_rejected(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Echo?version=2.0.0".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        match provider.export(exporter.url().clone(), echo_invoker(0)) {
            Err(RemotingError::DuplicateExport(key)) => {
                assert_eq!(key, exporter.service_key());
            }
            other => panic!("unexpected {:?}", other.err()),
        }

        // a different group on the same server is a different service
        let grouped = exporter.url().clone().with_param("group", "g2");
        let second = provider.export(grouped, echo_invoker(0)).expect("second export");
        assert_ne!(second.service_key(), exporter.service_key());

        provider.destroy().await;
    });
}

#[rstest]
fn test_unexported_service_not_found(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Gone".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        let consumer = new_protocol();
        let invoker = consumer.refer(exporter.url().clone()).await.expect("refer");
        let ok: String = invoker.call("m", &"x".to_string()).await.expect("first call");
        assert_eq!(ok, "x");

        exporter.unexport();
        match invoker.call::<_, String>("m", &"x".to_string()).await {
            Err(RpcError::Remoting(RemotingError::ServiceNotFound(msg))) => {
                assert!(msg.contains("com.acme.Gone"));
            }
            other => panic!("unexpected {:?}", other.err()),
        }

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_version_mismatch_not_found(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Echo?version=1.0.0".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        let consumer = new_protocol();
        let wrong = exporter.url().clone().with_param("version", "9.9.9");
        let invoker = consumer.refer(wrong).await.expect("refer");
        match invoker.call::<_, String>("m", &"x".to_string()).await {
            Err(RpcError::Remoting(RemotingError::ServiceNotFound(msg))) => {
                assert!(msg.contains("9.9.9"));
            }
            other => panic!("unexpected {:?}", other.err()),
        }

        consumer.destroy().await;
        provider.destroy().await;
    });
}

#[rstest]
fn test_payload_limit_fails_fast(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Blob".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");

        let consumer = new_protocol();
        let small = exporter.url().clone().with_param("payload", "128");
        let invoker = consumer.refer(small).await.expect("refer");

        let big = vec![7u8; 4096];
        match invoker.call::<_, Vec<u8>>("put", &big).await {
            Err(RpcError::Remoting(RemotingError::PayloadLimit { size, limit })) => {
                assert!(size > limit);
                assert_eq!(limit, 128);
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        // the failed call left nothing behind
        assert!(consumer.context().pending.is_empty());

        consumer.destroy().await;
        provider.destroy().await;
    });
}
