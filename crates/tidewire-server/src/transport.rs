//! Per-connection WebSocket task: upgrade, frame loop, idle timers, close.
//!
//! Everything that happens on one connection runs on one task, so the
//! manager sees that connection's events strictly in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::{HeaderValue, StatusCode};
use metrics::counter;
use tidewire_core::metrics::WS_TRANSPORT_FAULTS_TOTAL;
use tidewire_core::{
    Connection, ConnectionManager, EndpointDescriptor, FaultKind, Handshake, IdleEvent,
    OutboundFrame, TransportFault,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::idle::{IdleThresholds, IdleTimers};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Transport settings shared by every connection of one endpoint.
#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    path: String,
    subprotocols: Vec<String>,
    max_payload_bytes: usize,
    idle: IdleThresholds,
}

impl TransportConfig {
    pub(crate) fn from_descriptor(descriptor: &EndpointDescriptor) -> Self {
        Self {
            path: descriptor.path.clone(),
            subprotocols: descriptor.subprotocols.clone(),
            max_payload_bytes: descriptor.max_payload_bytes,
            idle: IdleThresholds::from_descriptor(descriptor),
        }
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_payload_bytes);
        config.max_frame_size = Some(self.max_payload_bytes);
        config
    }

    /// Check the upgrade request and pick a subprotocol.
    ///
    /// Requests on any other path are answered `404`.
    fn negotiate(
        &self,
        request: &Request,
        mut response: Response,
    ) -> Result<(Response, Handshake), ErrorResponse> {
        if request.uri().path() != self.path {
            let mut rejection = ErrorResponse::new(Some("no endpoint at this path".into()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }

        let subprotocol = self.select_subprotocol(request);
        if let Some(chosen) = subprotocol.as_deref() {
            if let Ok(value) = HeaderValue::from_str(chosen) {
                let _ = response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        let path = request
            .uri()
            .path_and_query()
            .map_or_else(|| request.uri().path().to_owned(), |pq| pq.as_str().to_owned());
        let handshake = Handshake {
            headers: request.headers().clone(),
            path,
            subprotocol,
        };
        Ok((response, handshake))
    }

    /// First client-offered protocol the endpoint accepts.
    fn select_subprotocol(&self, request: &Request) -> Option<String> {
        if self.subprotocols.is_empty() {
            return None;
        }
        request
            .headers()
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find(|offered| self.subprotocols.iter().any(|p| p == offered))
            .map(str::to_owned)
    }
}

fn classify(err: &WsError) -> TransportFault {
    let kind = match err {
        WsError::Capacity(_) => FaultKind::Capacity,
        WsError::Protocol(_) | WsError::Utf8 | WsError::AttackAttempt => FaultKind::Protocol,
        WsError::Io(_) => FaultKind::Io,
        _ => FaultKind::Other,
    };
    TransportFault::new(kind, err.to_string())
}

fn report_fault<H: Send + Sync + 'static>(
    manager: &ConnectionManager<H>,
    conn: &Connection,
    err: &WsError,
) {
    let fault = classify(err);
    counter!(
        WS_TRANSPORT_FAULTS_TOTAL,
        "endpoint" => manager.endpoint().to_owned(),
        "kind" => fault.kind.to_string()
    )
    .increment(1);
    manager.fault(conn, fault);
}

fn is_normal_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(data) => Message::Binary(data),
    }
}

/// Drive one accepted TCP connection until it closes.
///
/// Admission, upgrade, frame dispatch, idle detection, and the final
/// disconnect all happen here. `shutdown` cancels every connection of the
/// endpoint at once.
#[instrument(skip_all, fields(endpoint = manager.endpoint(), remote = %remote))]
pub(crate) async fn serve_connection<H: Send + Sync + 'static>(
    stream: TcpStream,
    remote: SocketAddr,
    manager: Arc<ConnectionManager<H>>,
    config: Arc<TransportConfig>,
    shutdown: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to set TCP_NODELAY");
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let conn = Arc::new(Connection::new(remote, outbound_tx, shutdown.child_token()));
    if manager.accept(&conn).is_err() {
        return;
    }

    let mut captured: Option<Handshake> = None;
    let upgrade = accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let (response, handshake) = config.negotiate(request, response)?;
            captured = Some(handshake);
            Ok(response)
        },
        Some(config.websocket_config()),
    );
    let upgraded = tokio::select! {
        result = upgrade => result,
        () = conn.close_token().cancelled() => {
            debug!("closed before handshake completed");
            manager.disconnect(&conn);
            return;
        }
    };
    let ws = match upgraded {
        Ok(ws) => ws,
        Err(err) => {
            debug!(error = %err, "upgrade failed");
            manager.disconnect(&conn);
            return;
        }
    };
    let Some(handshake) = captured.take() else {
        manager.disconnect(&conn);
        return;
    };
    manager.handshake_complete(&conn, &handshake);

    let (mut sink, mut frames) = ws.split();
    let mut idle = IdleTimers::new(config.idle, Instant::now());

    loop {
        let next_idle = idle.next_deadline();
        let idle_at = next_idle.map_or_else(Instant::now, |(_, at)| at);

        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    idle.on_read(Instant::now());
                    manager.text(&conn, text.as_str());
                }
                Some(Ok(Message::Binary(data))) => {
                    idle.on_read(Instant::now());
                    manager.binary(&conn, &data);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    idle.on_read(Instant::now());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) if is_normal_close(&err) => break,
                Some(Err(err)) => {
                    warn!(error = %err, "websocket read failed");
                    report_fault(&manager, &conn, &err);
                    break;
                }
            },
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(to_message(frame)).await {
                    if !is_normal_close(&err) {
                        report_fault(&manager, &conn, &err);
                    }
                    break;
                }
                idle.on_write(Instant::now());
            }
            () = time::sleep_until(idle_at), if next_idle.is_some() => {
                if let Some((kind, _)) = next_idle {
                    idle.mark_fired(kind);
                    manager.idle(&conn, IdleEvent::new(kind));
                }
            }
            () = conn.close_token().cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    manager.disconnect(&conn);
    let _ = sink.close().await;
}
