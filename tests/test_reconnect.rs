//! Background reconnect of the exchange client.

mod common;

use common::*;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

use trunk_rpc_exchange::{
    Endpoint, ExchangeClient, ExchangeContext, ExchangeDefault, ExchangeHandler, ExchangeServer,
    ReplyContext, ServiceFault,
};

struct EchoHandler;

impl ExchangeHandler for EchoHandler {
    async fn reply(&self, _ctx: &ReplyContext, payload: Vec<u8>) -> Result<Vec<u8>, ServiceFault> {
        Ok(payload)
    }
}

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
    l.local_addr().expect("addr").port()
}

#[rstest]
fn test_client_revives_after_server_restart(runner: TestRunner) {
    runner.block_on(async {
        let facts = ExchangeDefault::new(RT::new_global());
        facts.set_log_level(log::Level::Trace);
        let port = free_port();
        let url: Endpoint = format!("127.0.0.1:{}/revive", port).parse().unwrap();

        let server: ExchangeServer<Facts, EchoHandler, Transport> = ExchangeServer::bind(
            facts.clone(),
            ExchangeContext::new(),
            url.clone(),
            Arc::new(EchoHandler),
        )
        .expect("bind");

        let ctx = ExchangeContext::new();
        let client: Arc<ExchangeClient<Facts, EchoHandler, Transport>> =
            ExchangeClient::connect(facts.clone(), ctx.clone(), url.clone(), Arc::new(EchoHandler))
                .await
                .expect("connect");
        assert!(client.is_alive());

        // take the server away; the client notices the dead channel
        drop(server);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_alive());
        assert!(client.request(b"lost".to_vec(), None).await.is_err());

        // bring a server back on the same port; the reconnect task
        // (2 second floor) replaces the channel
        let server2: ExchangeServer<Facts, EchoHandler, Transport> = ExchangeServer::bind(
            facts.clone(),
            ExchangeContext::new(),
            url,
            Arc::new(EchoHandler),
        )
        .expect("rebind");

        let mut revived = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if client.is_alive() {
                revived = true;
                break;
            }
        }
        assert!(revived, "client did not reconnect in time");

        let fut = client.request(b"back".to_vec(), None).await.expect("request");
        let resp = fut.wait().await;
        assert_eq!(resp.status, trunk_rpc_exchange::proto::Status::Ok);
        assert_eq!(resp.result, b"back");

        client.close(Duration::from_millis(500)).await;
        server2.close(Duration::from_millis(500)).await;
    });
}

#[rstest]
fn test_explicit_reconnect(runner: TestRunner) {
    runner.block_on(async {
        let facts = ExchangeDefault::new(RT::new_global());
        let port = free_port();
        let url: Endpoint = format!("127.0.0.1:{}/renew", port).parse().unwrap();

        let server: ExchangeServer<Facts, EchoHandler, Transport> = ExchangeServer::bind(
            facts.clone(),
            ExchangeContext::new(),
            url.clone(),
            Arc::new(EchoHandler),
        )
        .expect("bind");

        let client: Arc<ExchangeClient<Facts, EchoHandler, Transport>> = ExchangeClient::connect(
            facts.clone(),
            ExchangeContext::new(),
            url,
            Arc::new(EchoHandler),
        )
        .await
        .expect("connect");

        let first = client.current_channel().expect("channel").conn_id();
        client.reconnect().await.expect("reconnect");
        let second = client.current_channel().expect("channel").conn_id();
        assert_ne!(first, second);
        assert!(client.is_alive());

        let fut = client.request(b"fresh".to_vec(), None).await.expect("request");
        assert_eq!(fut.wait().await.result, b"fresh");

        client.close(Duration::from_millis(500)).await;
        server.close(Duration::from_millis(500)).await;
    });
}
