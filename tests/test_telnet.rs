//! Raw text lines on a provider port are treated as telnet commands.

mod common;

use common::*;
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use trunk_rpc::Endpoint;

#[rstest]
fn test_ls_lists_service_keys(runner: TestRunner) {
    runner.block_on(async {
        let provider = new_protocol();
        let url: Endpoint = "127.0.0.1:0/com.acme.Echo?version=1.0.0".parse().unwrap();
        let exporter = provider.export(url, echo_invoker(0)).expect("export");
        let port = exporter.url().port();

        let mut sock =
            tokio::net::TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        sock.write_all(b"ls\r\n").await.expect("write");

        let mut buf = vec![0u8; 512];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), sock.read(&mut buf))
            .await
            .expect("reply in time")
            .expect("read");
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(
            reply.contains(exporter.service_key()),
            "reply {:?} misses {}",
            reply,
            exporter.service_key()
        );

        sock.write_all(b"frobnicate\r\n").await.expect("write");
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), sock.read(&mut buf))
            .await
            .expect("reply in time")
            .expect("read");
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.contains("unsupported command"));

        drop(sock);
        provider.destroy().await;
    });
}
