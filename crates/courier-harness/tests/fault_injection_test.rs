//! Broker behavior under degraded network conditions.
//!
//! - Latency longer than a request's timeout
//! - Links held and released while a client keeps sending

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use courier_client::{Client, ClientConfig};
use courier_core::{ReplyOutcome, TokenVerifier};
use courier_harness::{BROKER_HOST, SimConnector, broker_addr, serve_broker};
use courier_proto::{Credentials, Message};
use courier_server::ServerConfig;

const KEY: &str = "fault-key";

fn creds(name: &str) -> Credentials {
    TokenVerifier::new(KEY).credentials(name, "default")
}

#[test]
fn latency_beyond_timeout_times_out() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(30))
        .min_message_latency(Duration::from_millis(50))
        .max_message_latency(Duration::from_millis(60))
        .build();

    sim.host(BROKER_HOST, || async {
        let server = serve_broker(TokenVerifier::new(KEY), ServerConfig::default()).await?;
        server.on_message("ping", |event| async move {
            let _ = event.reply("pong").await;
        });
        server.closed().await;
        Ok(())
    });

    sim.client("alice", async {
        let client =
            Client::with_connector(SimConnector, broker_addr(), creds("alice"), ClientConfig::default()).await?;

        // A round trip takes at least 100ms.
        let outcome = client.request(Message::to_server("ping"), Duration::from_millis(60)).await?;
        assert_eq!(outcome, ReplyOutcome::TimedOut);

        let outcome = client.request(Message::to_server("ping"), Duration::from_secs(1)).await?;
        assert!(outcome.is_received());

        client.close();
        Ok(())
    });

    sim.run().expect("latency scenario should finish");
}

#[test]
fn held_link_delivers_in_order_on_release() {
    let mut sim = turmoil::Builder::new().simulation_duration(Duration::from_secs(30)).build();
    let seen: Arc<Mutex<Vec<i64>>> = Arc::default();

    let log = Arc::clone(&seen);
    sim.host(BROKER_HOST, move || {
        let log = Arc::clone(&log);
        async move {
            let server = serve_broker(TokenVerifier::new(KEY), ServerConfig::default()).await?;
            server.on_message("seq", move |event| {
                let log = Arc::clone(&log);
                async move {
                    if let Ok(n) = event.content_as::<i64>() {
                        log.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(n);
                    }
                }
            });
            server.on_message("done", |event| async move {
                let _ = event.reply(true).await;
            });
            server.closed().await;
            Ok(())
        }
    });

    sim.client("alice", async {
        let client =
            Client::with_connector(SimConnector, broker_addr(), creds("alice"), ClientConfig::default()).await?;

        turmoil::hold("alice", BROKER_HOST);
        for n in 0..10i64 {
            client.send_message(Message::to_server("seq").with_content(n)).await?;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        turmoil::release("alice", BROKER_HOST);

        let outcome = client.request(Message::to_server("done"), Duration::from_secs(2)).await?;
        assert!(outcome.is_received());
        client.close();
        Ok(())
    });

    sim.run().expect("held scenario should finish");
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
}
