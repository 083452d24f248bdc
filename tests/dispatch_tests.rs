// ABOUTME: Integration tests for invocation dispatch: ordering, streaming, failures.
// ABOUTME: Exercises the dispatcher against a ready in-memory session handle.

use anyhow::Result;
use async_trait::async_trait;
use perch::dispatch::{DispatchConfig, Dispatcher};
use perch::envelope::{Envelope, EnvelopeKind, InvocationPayload};
use perch::session::{SessionHandle, SessionState};
use perch::{AgentContext, AgentHandler, AgentReply, ChatInfo, UserInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

struct Harness {
    inbound_tx: mpsc::Sender<Envelope>,
    outbound_rx: mpsc::Receiver<Envelope>,
    task: tokio::task::JoinHandle<()>,
    _state_tx: watch::Sender<SessionState>,
}

fn start(handler: impl AgentHandler + 'static, cfg: DispatchConfig) -> Harness {
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(SessionState::Ready);
    let session = SessionHandle::new(outbound_tx, state_rx);
    let dispatcher = Dispatcher::new(Arc::new(handler), session, &cfg);

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let task = tokio::spawn(dispatcher.run(inbound_rx));

    Harness {
        inbound_tx,
        outbound_rx,
        task,
        _state_tx: state_tx,
    }
}

fn invocation(id: &str, chat_id: &str, prompt: &str) -> Envelope {
    Envelope::invocation(
        id,
        &InvocationPayload {
            chat: ChatInfo {
                id: chat_id.to_string(),
                name: None,
                participants: Vec::new(),
            },
            user: UserInfo::new("u1", "harper"),
            prompt: prompt.to_string(),
            history: Vec::new(),
            created_at: None,
        },
    )
}

/// Drain all remaining outbound envelopes after intake is closed
async fn finish(mut harness: Harness) -> Vec<Envelope> {
    drop(harness.inbound_tx);
    harness.task.await.unwrap();
    let mut envelopes = Vec::new();
    while let Some(envelope) = harness.outbound_rx.recv().await {
        envelopes.push(envelope);
    }
    envelopes
}

#[tokio::test]
async fn test_streaming_reply_chunks_then_concatenated_final() {
    let handler = perch::stream_fn(|_ctx| {
        futures::stream::iter(vec![
            Ok("Hello".to_string()),
            Ok(", ".to_string()),
            Ok("world".to_string()),
        ])
    });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-1", "chat-1", "greet"))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    assert_eq!(envelopes.len(), 4);
    for (i, expected) in ["Hello", ", ", "world"].iter().enumerate() {
        assert_eq!(envelopes[i].kind, EnvelopeKind::ResponseChunk);
        assert_eq!(&envelopes[i].chunk_payload().unwrap().text, expected);
    }
    let last = &envelopes[3];
    assert_eq!(last.kind, EnvelopeKind::ResponseFinal);
    assert_eq!(last.final_payload().unwrap().text, "Hello, world");
}

#[tokio::test]
async fn test_mid_stream_error_ends_with_error_envelope() {
    let handler = perch::stream_fn(|_ctx| {
        futures::stream::iter(vec![
            Ok("partial".to_string()),
            Err(anyhow::anyhow!("model backend died")),
        ])
    });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-1", "chat-1", "go"))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].kind, EnvelopeKind::ResponseChunk);
    assert_eq!(envelopes[1].kind, EnvelopeKind::Error);
    assert!(envelopes[1]
        .error_payload()
        .unwrap()
        .message
        .contains("model backend died"));
}

#[tokio::test]
async fn test_handler_error_becomes_error_envelope() {
    let handler = perch::reply_fn(|_ctx| async move {
        anyhow::bail!("no model configured")
    });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-1", "chat-1", "hi"))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, EnvelopeKind::Error);
    assert_eq!(envelopes[0].id.as_deref(), Some("inv-1"));
    assert!(envelopes[0]
        .error_payload()
        .unwrap()
        .message
        .contains("no model configured"));
}

struct PanickyHandler;

#[async_trait]
impl AgentHandler for PanickyHandler {
    async fn on_message(&self, ctx: AgentContext) -> Result<AgentReply> {
        if ctx.prompt == "boom" {
            panic!("handler bug");
        }
        Ok(AgentReply::text("survived"))
    }
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let harness = start(PanickyHandler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-1", "chat-1", "boom"))
        .await
        .unwrap();
    harness
        .inbound_tx
        .send(invocation("inv-2", "chat-1", "hello"))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    assert_eq!(envelopes.len(), 2);
    assert_eq!(envelopes[0].kind, EnvelopeKind::Error);
    assert_eq!(envelopes[0].id.as_deref(), Some("inv-1"));
    assert!(envelopes[0]
        .error_payload()
        .unwrap()
        .message
        .contains("panicked"));
    // The next invocation on the same chat still runs
    assert_eq!(envelopes[1].kind, EnvelopeKind::ResponseFinal);
    assert_eq!(envelopes[1].id.as_deref(), Some("inv-2"));
}

#[tokio::test(start_paused = true)]
async fn test_same_chat_invocations_run_in_order() {
    // First invocation is slow; ordering must hold anyway
    let handler = perch::reply_fn(|ctx| async move {
        if ctx.prompt == "slow" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(ctx.prompt.clone())
    });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-1", "chat-1", "slow"))
        .await
        .unwrap();
    harness
        .inbound_tx
        .send(invocation("inv-2", "chat-1", "fast"))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    let ids: Vec<_> = envelopes.iter().filter_map(|e| e.id.as_deref()).collect();
    assert_eq!(ids, vec!["inv-1", "inv-2"]);
}

#[tokio::test]
async fn test_different_chats_run_concurrently() {
    // chat-a blocks until chat-b completes; only cross-chat concurrency
    // lets this finish
    let released = Arc::new(Notify::new());
    let release_on_b = Arc::clone(&released);
    let handler = perch::reply_fn(move |ctx| {
        let released = Arc::clone(&released);
        let release_on_b = Arc::clone(&release_on_b);
        async move {
            if ctx.chat.id == "chat-a" {
                released.notified().await;
                Ok("a done".to_string())
            } else {
                release_on_b.notify_one();
                Ok("b done".to_string())
            }
        }
    });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(invocation("inv-a", "chat-a", "wait"))
        .await
        .unwrap();
    harness
        .inbound_tx
        .send(invocation("inv-b", "chat-b", "release"))
        .await
        .unwrap();

    // Completing at all proves chat-a did not block chat-b
    let envelopes = tokio::time::timeout(Duration::from_secs(5), finish(harness))
        .await
        .expect("cross-chat invocations deadlocked");
    let mut ids: Vec<_> = envelopes.iter().filter_map(|e| e.id.as_deref()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["inv-a", "inv-b"]);
}

#[tokio::test]
async fn test_non_invocation_envelopes_are_ignored() {
    let handler = perch::reply_fn(|_ctx| async move { Ok("never".to_string()) });
    let harness = start(handler, DispatchConfig::default());

    harness
        .inbound_tx
        .send(Envelope::final_reply("inv-x", "stray"))
        .await
        .unwrap();
    harness
        .inbound_tx
        .send(Envelope::auth_ack(true, None))
        .await
        .unwrap();

    let envelopes = finish(harness).await;
    assert!(envelopes.is_empty());
}

#[tokio::test]
async fn test_responses_after_session_death_are_discarded() {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(SessionState::Ready);
    let session = SessionHandle::new(outbound_tx, state_rx);

    let handler = perch::reply_fn(|_ctx| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok("too late".to_string())
    });
    let dispatcher = Dispatcher::new(Arc::new(handler), session, &DispatchConfig::default());

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let task = tokio::spawn(dispatcher.run(inbound_rx));

    inbound_tx
        .send(invocation("inv-1", "chat-1", "hi"))
        .await
        .unwrap();
    // Session dies while the handler is still working
    state_tx.send(SessionState::Disconnected).unwrap();

    drop(inbound_tx);
    task.await.unwrap();
    assert!(outbound_rx.recv().await.is_none());
}
