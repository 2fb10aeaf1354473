//! The WebSocket control plane.
//!
//! The first frame after connection must be the typed handshake; anything
//! else closes the connection.  Requests are one JSON frame each and are
//! answered with a correlated response frame; `agent` submissions
//! additionally stream their run's events until the terminal lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use sb_protocol::{ClientFrame, Method, RunEvent, ServerFrame};
use sb_sessions::TurnKind;

use crate::api::IdempotencyCache;
use crate::inbound::InboundDecision;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // Handshake: first frame must be a typed hello.
    let hello_ok = match stream.next().await {
        Some(Ok(Message::Text(raw))) => matches!(
            serde_json::from_str::<ClientFrame>(&raw),
            Ok(ClientFrame::Hello { .. })
        ),
        _ => false,
    };
    if !hello_ok {
        tracing::warn!("control connection closed: first frame was not a handshake");
        let _ = sink.close().await;
        return;
    }

    let welcome = ServerFrame::Welcome {
        server: "switchboard".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    if send_frame(&mut sink, &welcome).await.is_err() {
        return;
    }

    // All outbound frames (responses + streamed events) funnel through one
    // writer so event interleaving stays ordered per sender.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if send_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    });

    let idempotency = Arc::new(IdempotencyCache::new(Duration::from_secs(
        state.config.server.idempotency_ttl_secs,
    )));

    while let Some(Ok(message)) = stream.next().await {
        let raw = match message {
            Message::Text(raw) => raw,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable control frame");
                continue;
            }
        };

        let ClientFrame::Request { id, idempotency_key, method } = frame else {
            // A second hello is harmless.
            continue;
        };

        if let Some(cached) = idempotency.get(&idempotency_key) {
            let _ = out_tx
                .send(ServerFrame::Response { id, ok: true, result: Some(cached), error: None })
                .await;
            continue;
        }

        let response = match handle_method(&state, &out_tx, method).await {
            Ok(result) => {
                idempotency.put(&idempotency_key, result.clone());
                ServerFrame::Response { id, ok: true, result: Some(result), error: None }
            }
            Err(error) => ServerFrame::Response { id, ok: false, result: None, error: Some(error) },
        };
        if out_tx.send(response).await.is_err() {
            break;
        }
    }

    writer.abort();
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn handle_method(
    state: &AppState,
    out_tx: &mpsc::Sender<ServerFrame>,
    method: Method,
) -> Result<serde_json::Value, String> {
    match method {
        Method::Agent { envelope } => {
            let decision = state.pipeline.process(envelope);
            match decision {
                InboundDecision::Submitted { session_key, run_id } => {
                    spawn_event_forwarder(state, out_tx.clone(), run_id);
                    Ok(serde_json::json!({
                        "run_id": run_id,
                        "accepted_at": chrono::Utc::now(),
                        "session_key": session_key,
                    }))
                }
                InboundDecision::PolicyDenied(reason) => Err(format!("denied: {reason}")),
                InboundDecision::CommandHandled(cmd) => {
                    Ok(serde_json::json!({ "command": cmd }))
                }
                InboundDecision::CommandDenied => Err("command not authorized".into()),
                other => Err(format!("not accepted: {other:?}")),
            }
        }

        Method::AgentWait { run_id, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_secs(state.config.context.wait_timeout_secs));
            match state.events.wait(run_id, timeout).await {
                Some(result) => {
                    Ok(serde_json::to_value(result).map_err(|e| e.to_string())?)
                }
                None => Err("wait timed out".into()),
            }
        }

        Method::SessionsList { agent_id } => {
            let agent = agent_id.unwrap_or_else(|| state.config.default_agent.clone());
            let entries = state.sessions.list(&agent);
            Ok(serde_json::to_value(entries).map_err(|e| e.to_string())?)
        }

        Method::SessionsHistory { session_key, limit, include_tools } => {
            let agent = session_key
                .split(':')
                .nth(1)
                .ok_or_else(|| "malformed session key".to_owned())?
                .to_owned();
            let entry = state
                .sessions
                .get(&agent, &session_key)
                .ok_or_else(|| "unknown session".to_owned())?;
            let turns = state
                .runner
                .transcripts(&agent)
                .read(&entry.session_id, None)
                .map_err(|e| e.to_string())?;
            let filtered: Vec<_> = turns
                .into_iter()
                .filter(|t| include_tools || !matches!(t.kind, TurnKind::ToolResult { .. }))
                .collect();
            let limited = match limit {
                Some(limit) if filtered.len() > limit => {
                    filtered[filtered.len() - limit..].to_vec()
                }
                _ => filtered,
            };
            Ok(serde_json::to_value(limited).map_err(|e| e.to_string())?)
        }

        Method::SessionsSend { session_key, message, timeout_seconds } => {
            let run_id = state
                .pipeline
                .send_to_session(&session_key, &message)
                .ok_or_else(|| "session send not accepted".to_owned())?;
            let timeout = Duration::from_secs(timeout_seconds.unwrap_or(30));
            let result = state
                .events
                .wait(run_id, timeout)
                .await
                .ok_or_else(|| "wait timed out".to_owned())?;
            let reply = state
                .events
                .run_store()
                .get(&run_id)
                .and_then(|r| r.final_text);
            Ok(serde_json::json!({
                "run_id": run_id,
                "status": result.status,
                "reply": reply,
            }))
        }

        Method::Health => Ok(serde_json::json!({ "ok": true })),

        Method::Status => Ok(serde_json::json!({
            "runs": state.events.run_store().status_counts(),
            "active_sessions": state.scheduler.active_sessions(),
        })),

        Method::SystemPresence => Ok(serde_json::json!({
            "agents": state.config.agents.keys().collect::<Vec<_>>(),
            "channels": state.shaper.connector_names(),
        })),
    }
}

/// Mirror one run's events onto the connection until the terminal
/// lifecycle event tears the subscription down.
fn spawn_event_forwarder(state: &AppState, out_tx: mpsc::Sender<ServerFrame>, run_id: uuid::Uuid) {
    let mut rx = state.events.subscribe(run_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    // Reasoning/compaction stay internal to the bus.
                    let forward = matches!(
                        event,
                        RunEvent::Lifecycle { .. } | RunEvent::Assistant { .. } | RunEvent::Tool { .. }
                    );
                    if forward
                        && out_tx.send(ServerFrame::Event { event }).await.is_err()
                    {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
