// ABOUTME: Routes inbound invocations to the registered handler and streams replies back.
// ABOUTME: Invocations for the same chat run in arrival order; different chats run concurrently.

use crate::envelope::{Envelope, EnvelopeKind};
use crate::session::SessionHandle;
use chrono::Utc;
use futures_util::StreamExt;
use perch_agent::{AgentContext, AgentHandler, AgentReply};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, warn};

/// Dispatch tuning knobs
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Cap on invocations running at once across all chats (None = unbounded)
    pub max_concurrency: Option<usize>,
    /// Buffered invocations per chat before backpressure on intake
    pub chat_queue_depth: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            chat_queue_depth: 64,
        }
    }
}

struct Invocation {
    id: String,
    ctx: AgentContext,
}

/// Per-session dispatcher.
///
/// Lives exactly as long as its session: the reconnector creates a fresh one
/// per connection and its intake channel closes when the session ends. Work
/// still in flight at that point completes against a closed session handle
/// and its output is discarded.
///
/// Chat workers are never evicted: one idle task and one queue entry remain
/// per distinct `chat_id` seen, torn down with the session. Acceptable while
/// dispatchers are per-session; an eviction policy would be needed if one
/// dispatcher ever outlived its session.
pub struct Dispatcher {
    handler: Arc<dyn AgentHandler>,
    session: SessionHandle,
    limiter: Option<Arc<Semaphore>>,
    chat_queue_depth: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn AgentHandler>,
        session: SessionHandle,
        cfg: &DispatchConfig,
    ) -> Self {
        Self {
            handler,
            session,
            limiter: cfg.max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
            chat_queue_depth: cfg.chat_queue_depth,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume inbound envelopes until the channel closes.
    ///
    /// Per-chat worker tasks drain their queues sequentially, which keeps
    /// invocations for one chat in arrival order while chats proceed
    /// independently of each other.
    pub async fn run(self, mut inbound: mpsc::Receiver<Envelope>) {
        let mut chat_queues: HashMap<String, mpsc::Sender<Invocation>> = HashMap::new();

        while let Some(envelope) = inbound.recv().await {
            if envelope.kind != EnvelopeKind::Invocation {
                debug!(kind = %envelope.kind, "Ignoring non-invocation envelope");
                continue;
            }
            let Some(id) = envelope.id.clone() else {
                warn!("Dropping invocation without an id");
                continue;
            };
            let payload = match envelope.invocation_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(invocation_id = %id, error = %e, "Dropping malformed invocation");
                    continue;
                }
            };

            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(id.clone()) {
                    warn!(invocation_id = %id, "Dropping duplicate in-flight invocation id");
                    continue;
                }
            }

            let chat_id = payload.chat.id.clone();
            let ctx = AgentContext {
                invocation_id: id.clone(),
                prompt: payload.prompt,
                user: payload.user,
                chat: payload.chat,
                history: payload.history,
                created_at: payload.created_at.unwrap_or_else(Utc::now),
            };

            let queue = chat_queues
                .entry(chat_id.clone())
                .or_insert_with(|| self.spawn_chat_worker(chat_id));
            if queue.send(Invocation { id: id.clone(), ctx }).await.is_err() {
                // Worker task died; nothing to do but drop the invocation
                warn!(invocation_id = %id, "Chat worker gone; dropping invocation");
                self.in_flight.lock().await.remove(&id);
            }
        }

        debug!("Dispatcher intake closed");
    }

    /// Spawn the worker that serializes invocations for one chat
    fn spawn_chat_worker(&self, chat_id: String) -> mpsc::Sender<Invocation> {
        let (tx, mut rx) = mpsc::channel::<Invocation>(self.chat_queue_depth);
        let handler = Arc::clone(&self.handler);
        let session = self.session.clone();
        let limiter = self.limiter.clone();
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            while let Some(invocation) = rx.recv().await {
                let permit = match &limiter {
                    Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        // Semaphore is never closed while workers run
                        Err(_) => None,
                    },
                    None => None,
                };

                let id = invocation.id.clone();
                let handler = Arc::clone(&handler);
                let session_for_run = session.clone();

                // Each invocation runs in its own task so a panicking handler
                // takes down only that invocation
                let run = tokio::spawn(run_invocation(
                    handler,
                    session_for_run,
                    invocation.id,
                    invocation.ctx,
                ));
                if let Err(join_err) = run.await {
                    if join_err.is_panic() {
                        error!(invocation_id = %id, chat_id = %chat_id, "Handler panicked");
                        send_terminal(&session, Envelope::error(&id, "handler panicked")).await;
                    }
                }

                drop(permit);
                in_flight.lock().await.remove(&id);
            }
        });

        tx
    }
}

/// Run one invocation to completion, emitting exactly one terminal envelope
/// (or none when the session died underneath it).
async fn run_invocation(
    handler: Arc<dyn AgentHandler>,
    session: SessionHandle,
    id: String,
    ctx: AgentContext,
) {
    let reply = match handler.on_message(ctx).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(invocation_id = %id, error = %e, "Handler returned an error");
            send_terminal(&session, Envelope::error(&id, &e.to_string())).await;
            return;
        }
    };

    match reply {
        AgentReply::Text(text) => {
            send_terminal(&session, Envelope::final_reply(&id, &text)).await;
        }
        AgentReply::Stream(mut chunks) => {
            let mut full_text = String::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(text) => {
                        if let Err(e) = session.send(Envelope::chunk(&id, &text)).await {
                            // Session is gone; the gateway has already
                            // abandoned this invocation
                            debug!(invocation_id = %id, error = %e, "Discarding chunk for dead session");
                            return;
                        }
                        full_text.push_str(&text);
                    }
                    Err(e) => {
                        debug!(invocation_id = %id, error = %e, "Stream failed mid-response");
                        send_terminal(&session, Envelope::error(&id, &e.to_string())).await;
                        return;
                    }
                }
            }
            // The final envelope carries the whole response so chunk-blind
            // consumers still get the complete answer
            send_terminal(&session, Envelope::final_reply(&id, &full_text)).await;
        }
    }
}

async fn send_terminal(session: &SessionHandle, envelope: Envelope) {
    if let Err(e) = session.send(envelope).await {
        debug!(error = %e, "Discarding terminal envelope for dead session");
    }
}

// =============================================================================
// Tests
// =============================================================================
