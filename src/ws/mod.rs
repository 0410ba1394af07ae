// SPDX-License-Identifier: MIT
//! WebSocket server and per-connection pump.
//!
//! One accept loop for the whole process (shared with a plain HTTP `/health`
//! probe on the same port), then one reader task and one writer task per
//! connection. The reader enforces the idle deadline and the malformed-frame
//! allowance and feeds decoded envelopes into the session hub; the writer
//! drains the participant's bounded outbound queue with a write deadline and
//! keeps the heartbeat going.
//!
//! Connections authenticate during the upgrade: the request path names the
//! `(threat_model, diagram)` pair and the `Authorization` header carries the
//! bearer credential.

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol;
use crate::session::registry::HubHandle;
use crate::session::{HubInput, SessionKey};
use crate::AppContext;

/// Malformed frames tolerated per connection before it is closed.
const MAX_MALFORMED_FRAMES: u32 = 8;

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "collaboration server listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining sessions and stopping server");
                ctx.registry.drain().await;
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("collaboration server stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares its port for both WebSocket upgrades and a plain HTTP
/// health endpoint so orchestrators can check liveness without a WS library.
async fn handle_health_check(mut stream: TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request headers (stack buffer — we don't inspect the body).
    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let active = ctx.registry.active_count().await;
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "active_sessions": active,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from
    // WebSocket upgrades; both share the same port. Checking for
    // "GET /health " (with trailing space, 12 bytes) prevents false matches
    // on paths like "GET /healthz"; everything else falls through to the
    // WS handshake.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_frame_bytes),
        max_frame_size: Some(ctx.config.max_frame_bytes),
        ..Default::default()
    };

    // The upgrade callback runs synchronously: it can refuse the HTTP
    // upgrade outright (bad path, no credential) but cannot await the
    // resolver — credential validation happens right after the handshake.
    let mut captured: Option<(SessionKey, String)> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let key = match parse_session_path(req.uri().path()) {
            Some(key) => key,
            None => return Err(reject(StatusCode::NOT_FOUND, "unknown path")),
        };
        let token = match bearer_token(req) {
            Some(token) => token,
            None => {
                return Err(reject(
                    StatusCode::UNAUTHORIZED,
                    "missing bearer credential",
                ))
            }
        };
        captured = Some((key, token));
        Ok(resp)
    };

    let mut ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (key, token) = captured.expect("upgrade callback ran on successful handshake");

    let identity = match ctx.identity.resolve(&token, key.threat_model_id).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(diagram = %key.diagram_id, err = %e, "refusing connection — authentication failed");
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "authentication failed".into(),
                }))
                .await;
            return Ok(());
        }
    };

    let connection_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::channel::<Arc<str>>(ctx.config.outbound_queue_capacity);
    let hub = match ctx
        .registry
        .join(key, connection_id, identity.clone(), out_tx)
        .await
    {
        Ok(hub) => hub,
        Err(e) => {
            warn!(diagram = %key.diagram_id, err = %e, "join refused");
            let reason = match e {
                crate::session::JoinError::ShuttingDown => "server shutting down",
                _ => "diagram_not_found",
            };
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: reason.into(),
                }))
                .await;
            return Ok(());
        }
    };

    info!(
        diagram = %key.diagram_id,
        user = %identity.user_id,
        connection = %connection_id,
        "connection established"
    );

    let (sink, stream) = ws.split();
    let mut writer = tokio::spawn(run_writer(sink, out_rx, ctx.clone(), connection_id));
    run_reader(stream, &hub, connection_id, &ctx).await;

    // Tell the hub the participant is gone (idempotent if it already evicted
    // us), then let the writer observe its closed queue and finish.
    let _ = hub
        .ingress
        .send(HubInput::Disconnect { connection_id })
        .await;
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    debug!(connection = %connection_id, "connection closed");
    Ok(())
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Parse `/threat_models/{uuid}/diagrams/{uuid}/ws`.
fn parse_session_path(path: &str) -> Option<SessionKey> {
    let mut parts = path.trim_matches('/').split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("threat_models"), Some(tm), Some("diagrams"), Some(d), Some("ws"), None) => {
            Some(SessionKey {
                threat_model_id: Uuid::parse_str(tm).ok()?,
                diagram_id: Uuid::parse_str(d).ok()?,
            })
        }
        _ => None,
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

// ─── Pump ────────────────────────────────────────────────────────────────────

/// Reader half: idle deadline, frame decode, malformed-frame allowance.
/// Returns when the connection is done for any reason; the caller posts the
/// disconnect notice.
async fn run_reader(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    hub: &HubHandle,
    connection_id: Uuid,
    ctx: &AppContext,
) {
    let mut malformed_count: u32 = 0;
    loop {
        let msg = match tokio::time::timeout(ctx.config.read_idle(), stream.next()).await {
            Err(_) => {
                debug!(connection = %connection_id, "read idle deadline exceeded — closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection = %connection_id, err = %e, "read error — closing");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    malformed_count += 1;
                    if malformed_count > MAX_MALFORMED_FRAMES {
                        warn!(connection = %connection_id, "malformed frame threshold exceeded — closing");
                        break;
                    }
                    continue;
                }
            },
            // tungstenite answers pings itself; any inbound frame (pongs
            // included) resets the idle deadline by reaching this loop.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
            Message::Frame(_) => continue,
        };

        let input = match protocol::decode_client(&text) {
            Ok(message) => HubInput::Frame {
                connection_id,
                message,
            },
            Err(e) => {
                malformed_count += 1;
                if malformed_count > MAX_MALFORMED_FRAMES {
                    warn!(connection = %connection_id, "malformed frame threshold exceeded — closing");
                    break;
                }
                HubInput::Malformed {
                    connection_id,
                    operation_id: e.operation_id,
                    detail: e.message,
                }
            }
        };
        if hub.ingress.send(input).await.is_err() {
            // Session is gone; nothing left to feed.
            break;
        }
    }
}

/// Writer half: drains the outbound queue with a write deadline and sends
/// periodic pings. Exits when the queue closes (the hub dropped us) or a
/// write fails.
async fn run_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Arc<str>>,
    ctx: Arc<AppContext>,
    connection_id: Uuid,
) {
    let deadline = ctx.config.write_deadline();
    let mut ping = tokio::time::interval(ctx.config.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = out_rx.recv() => match maybe {
                Some(frame) => {
                    let send = sink.send(Message::Text(frame.to_string()));
                    match tokio::time::timeout(deadline, send).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(connection = %connection_id, err = %e, "write error — closing");
                            break;
                        }
                        Err(_) => {
                            warn!(connection = %connection_id, "write deadline exceeded — closing");
                            break;
                        }
                    }
                }
                None => {
                    // The hub dropped its send capability: session over or
                    // we were force-closed as a slow consumer.
                    let close = sink.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "session closed".into(),
                    })));
                    let _ = tokio::time::timeout(deadline, close).await;
                    break;
                }
            },
            _ = ping.tick() => {
                match tokio::time::timeout(deadline, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(connection = %connection_id, "ping write failed — closing");
                        break;
                    }
                }
            }
        }
    }
}
