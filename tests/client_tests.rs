// ABOUTME: End-to-end tests for AgentClient over in-memory transports.
// ABOUTME: Covers echo round trips, streaming, rejection, reconnect, and abandonment.

use perch::config::{Config, GatewayConfig};
use perch::envelope::EnvelopeKind;
use perch::testing::MockGateway;
use perch::transport::MockConnector;
use perch::{AgentClient, HandlerRegistry};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> Config {
    Config {
        gateway: GatewayConfig {
            url: "ws://localhost:9000/ws".to_string(),
            agent_key: "key-123".to_string(),
            agent_name: Some("test-agent".to_string()),
        },
        ..Config::default()
    }
}

fn client_with(
    connector: &MockConnector,
    registry: HandlerRegistry,
) -> AgentClient {
    AgentClient::with_connector(&test_config(), Arc::new(connector.clone()), registry)
        .expect("valid test config")
}

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip() {
    let connector = MockConnector::new();
    let (mut gateway, transport) = MockGateway::new();
    connector.push(Box::new(transport)).await;

    let registry = HandlerRegistry::new(perch::reply_fn(|ctx| async move {
        Ok(format!("echo: {}", ctx.prompt))
    }));
    let client = client_with(&connector, registry);
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    gateway.accept_auth().await.unwrap();
    let id = gateway.send_invocation("chat-1", "hello").await.unwrap();

    let reply = gateway.recv_envelope().await.unwrap();
    assert_eq!(reply.kind, EnvelopeKind::ResponseFinal);
    assert_eq!(reply.id.as_deref(), Some(&id[..]));
    assert_eq!(reply.final_payload().unwrap().text, "echo: hello");

    shutdown.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_streaming_round_trip() {
    let connector = MockConnector::new();
    let (mut gateway, transport) = MockGateway::new();
    connector.push(Box::new(transport)).await;

    let registry = HandlerRegistry::new(perch::stream_fn(|ctx| {
        futures::stream::iter(vec![
            Ok("thinking".to_string()),
            Ok(" about ".to_string()),
            Ok(ctx.prompt),
        ])
    }));
    let client = client_with(&connector, registry);
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    gateway.accept_auth().await.unwrap();
    let id = gateway.send_invocation("chat-1", "birds").await.unwrap();

    let mut chunks = Vec::new();
    let final_reply = loop {
        let envelope = gateway.recv_envelope().await.unwrap();
        assert_eq!(envelope.id.as_deref(), Some(&id[..]));
        match envelope.kind {
            EnvelopeKind::ResponseChunk => {
                chunks.push(envelope.chunk_payload().unwrap().text)
            }
            EnvelopeKind::ResponseFinal => break envelope,
            other => panic!("unexpected envelope kind {}", other),
        }
    };

    assert_eq!(chunks, vec!["thinking", " about ", "birds"]);
    assert_eq!(
        final_reply.final_payload().unwrap().text,
        "thinking about birds"
    );

    shutdown.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_surface_as_error() {
    let connector = MockConnector::new();
    let (mut gateway, transport) = MockGateway::new();
    connector.push(Box::new(transport)).await;

    let registry = HandlerRegistry::new(perch::reply_fn(|_ctx| async move {
        Ok("never".to_string())
    }));
    let client = client_with(&connector, registry);
    let run = tokio::spawn(client.run());

    gateway.reject_auth("unknown agent").await.unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(format!("{:#}", err).contains("unknown agent"));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invocations_served_after_reconnect() {
    let connector = MockConnector::new();
    let (mut gateway1, transport1) = MockGateway::new();
    let (mut gateway2, transport2) = MockGateway::new();
    connector.push(Box::new(transport1)).await;
    connector.push(Box::new(transport2)).await;

    let registry = HandlerRegistry::new(perch::reply_fn(|ctx| async move {
        Ok(format!("echo: {}", ctx.prompt))
    }));
    let client = client_with(&connector, registry);
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    gateway1.accept_auth().await.unwrap();
    drop(gateway1);

    gateway2.accept_auth().await.unwrap();
    let id = gateway2.send_invocation("chat-1", "back again").await.unwrap();
    let reply = gateway2.recv_envelope().await.unwrap();
    assert_eq!(reply.id.as_deref(), Some(&id[..]));
    assert_eq!(reply.final_payload().unwrap().text, "echo: back again");

    shutdown.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_work_is_abandoned_on_disconnect() {
    let connector = MockConnector::new();
    let (mut gateway1, transport1) = MockGateway::new();
    let (mut gateway2, transport2) = MockGateway::new();
    connector.push(Box::new(transport1)).await;
    connector.push(Box::new(transport2)).await;

    // Slow handler so the first invocation is still running when its
    // connection dies
    let registry = HandlerRegistry::new(perch::reply_fn(|ctx| async move {
        if ctx.prompt == "slow" {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(format!("done: {}", ctx.prompt))
    }));
    let client = client_with(&connector, registry);
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    gateway1.accept_auth().await.unwrap();
    gateway1
        .send_invocation_with_id("inv-old", "chat-1", "slow")
        .await
        .unwrap();
    drop(gateway1);

    gateway2.accept_auth().await.unwrap();
    let new_id = gateway2.send_invocation("chat-2", "fresh").await.unwrap();

    // Only the new invocation's reply arrives; the old one was abandoned
    // with its session
    let reply = gateway2.recv_envelope().await.unwrap();
    assert_eq!(reply.id.as_deref(), Some(&new_id[..]));
    assert_eq!(reply.final_payload().unwrap().text, "done: fresh");

    shutdown.shutdown();
    assert!(run.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_hooks_run_around_connection_loop() {
    use anyhow::Result;
    use async_trait::async_trait;
    use perch::{AgentContext, AgentHandler, AgentReply};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Hooked {
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AgentHandler for Hooked {
        async fn on_message(&self, _ctx: AgentContext) -> Result<AgentReply> {
            Ok(AgentReply::text("ok"))
        }
        async fn on_start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn on_stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));

    let connector = MockConnector::new();
    let (mut gateway, transport) = MockGateway::new();
    connector.push(Box::new(transport)).await;

    let registry = HandlerRegistry::new(Hooked {
        started: Arc::clone(&started),
        stopped: Arc::clone(&stopped),
    });
    let client = client_with(&connector, registry);
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    gateway.accept_auth().await.unwrap();
    shutdown.shutdown();
    assert!(run.await.unwrap().is_ok());

    assert!(started.load(Ordering::SeqCst));
    assert!(stopped.load(Ordering::SeqCst));
}
