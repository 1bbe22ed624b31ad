//! Device-facing WebSocket listener
//!
//! Charge points connect to `ws://<ws_bind>/ws/ocpp/<identity>/`. Each
//! accepted connection gets a [`Session`] registered under its identity, a
//! reader loop feeding `route_inbound` and a single writer task that owns the
//! socket sink. A connection that stays silent for `IDLE_PING_PERIODS` ping
//! periods (pongs included) is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use csms_core::session::CloseReason;
use csms_core::{ConnectionRegistry, FallbackPolicy, HandlerRegistry, OcppMessage, Session};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::ServerError;

/// OCPP 1.6-J WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

const MAX_IDENTITY_LEN: usize = 64;

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

/// Ping periods without any inbound frame before a connection is dropped
const IDLE_PING_PERIODS: u32 = 3;

/// State shared by every connection
struct ConnectionContext {
    config: Arc<ServerConfig>,
    path_prefix: String,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<HandlerRegistry>,
    fallback: Arc<FallbackPolicy>,
}

/// Accept loop for charge point connections
pub struct DeviceListener {
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
}

impl DeviceListener {
    /// Bind the WebSocket listener on `config.ws_bind`
    pub async fn bind(
        config: Arc<ServerConfig>,
        registry: Arc<ConnectionRegistry>,
        handlers: Arc<HandlerRegistry>,
        fallback: Arc<FallbackPolicy>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.ws_bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.ws_bind,
                source,
            })?;

        let ctx = ConnectionContext {
            path_prefix: config.normalized_path_prefix(),
            config,
            registry,
            handlers,
            fallback,
        };

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Accepting charge points on ws://{}{}<identity>/",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into()),
            self.ctx.path_prefix
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx, shutdown).await {
                                debug!("{}: handshake failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                }
            }
        }

        debug!("WebSocket listener stopped");
    }
}

/// Extract the charge point identity from a request path.
///
/// `prefix` must start and end with `/`. A single trailing slash after the
/// identity is optional.
pub fn identity_from_path(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    let identity = rest.strip_suffix('/').unwrap_or(rest);

    let valid = (1..=MAX_IDENTITY_LEN).contains(&identity.len())
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !identity.chars().all(|c| c == '.');

    valid.then(|| identity.to_string())
}

fn offers_ocpp(headers: &HeaderMap) -> Option<bool> {
    let offered = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    Some(offered.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_message_size),
        max_frame_size: Some(ctx.config.max_frame_size),
        ..Default::default()
    };

    let mut identity = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let Some(id) = identity_from_path(req.uri().path(), &ctx.path_prefix) else {
            warn!("{}: rejecting connection to {}", peer, req.uri().path());
            let mut reject = ErrorResponse::new(Some("Unknown charge point path".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            return Err(reject);
        };

        match offers_ocpp(req.headers()) {
            Some(true) => {
                resp.headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
            }
            Some(false) => warn!("{}: {} not offered, accepting anyway", id, OCPP_SUBPROTOCOL),
            None => debug!("{}: no subprotocol offered", id),
        }

        identity = Some(id);
        Ok(resp)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let Some(identity) = identity else {
        return Ok(());
    };

    if shutdown.is_cancelled() {
        debug!("{}: shutting down, dropping connection from {}", identity, peer);
        return Ok(());
    }

    let span = info_span!("charger", identity = %identity);
    run_connection(ws, identity, peer, &ctx, &shutdown).instrument(span).await;
    Ok(())
}

async fn run_connection(
    ws: WebSocketStream<TcpStream>,
    identity: String,
    peer: SocketAddr,
    ctx: &ConnectionContext,
    shutdown: &CancellationToken,
) {
    let (session, outgoing) = Session::new(identity, ctx.handlers.clone(), ctx.fallback.clone());
    let session = Arc::new(session.with_call_timeout(ctx.config.call_timeout));
    debug!("{}: connection from {}", session.identity(), peer);
    ctx.registry.register(session.clone());

    // Registered after the registry was drained: nobody else will close it
    if shutdown.is_cancelled() {
        session.close(CloseReason::Shutdown);
        ctx.registry.remove_session(&session);
        return;
    }

    let ping_interval = ctx.config.ping_interval.max(MIN_PING_INTERVAL);
    let idle_timeout = ping_interval * IDLE_PING_PERIODS;

    // Fires on session close (including replacement) and on writer failure
    let connection = session.cancellation().child_token();
    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(
        write_loop(sink, outgoing, connection.clone(), ping_interval).in_current_span(),
    );

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = connection.cancelled() => break CloseReason::Disconnected,
            _ = shutdown.cancelled() => break CloseReason::Shutdown,
            _ = &mut idle => {
                warn!("{}: nothing received for {:?}, dropping connection", session.identity(), idle_timeout);
                break CloseReason::Disconnected;
            }
            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!("<- {}", text);
                        let _ = session.route_inbound(text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = session.route_inbound(&data);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Close frame: {:?}", frame);
                        break CloseReason::Disconnected;
                    }
                    // Ping and pong only keep the connection alive
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("{}: read failed: {}", session.identity(), e);
                        break CloseReason::Disconnected;
                    }
                    None => break CloseReason::Disconnected,
                }
            }
        }
    };

    session.close(reason);
    ctx.registry.remove_session(&session);
    connection.cancel();
    if let Err(e) = writer.await {
        error!("{}: writer task failed: {}", session.identity(), e);
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outgoing: mpsc::Receiver<OcppMessage>,
    connection: CancellationToken,
    ping_interval: Duration,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = connection.cancelled() => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize {}: {}", msg.message_id(), e);
                        continue;
                    }
                };
                debug!("-> {}", text);
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Send failed: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    warn!("Ping failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    connection.cancel();
}
