use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cookie::SameSite;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::middleware::{is_secure_headers, CurrentSession};
use crate::state::AppState;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_CAP: Duration = Duration::from_secs(5 * 60);
const UPSTREAM_ERROR_CLOSE: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct TicketQuery {
    pub node: String,
}

#[derive(Debug, Serialize)]
struct ConsoleTicket {
    port: u64,
    vncticket: String,
    node: String,
    vmid: u64,
    user: Option<String>,
}

/// Phase one: broker a VNC ticket on the user's behalf. Requires a session
/// that captured the upstream ticket at login; the ticket call must be
/// cookie-authenticated so PVE binds the VNC ticket to the user principal.
pub async fn ticket(
    State(state): State<AppState>,
    Path(vmid): Path<u64>,
    Query(query): Query<TicketQuery>,
    session: CurrentSession,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !session.data.authenticated {
        return Err(ApiError::Unauthorized);
    }
    let upstream_cookie = session
        .data
        .pve_auth_cookie
        .clone()
        .ok_or(ApiError::Unauthorized)?;
    let upstream_csrf = session
        .data
        .csrf_prevention_token
        .clone()
        .unwrap_or_default();

    let client = state.proxmox.for_ticket(&upstream_cookie, &upstream_csrf);
    let vnc = client.vncproxy(&query.node, vmid).await?;
    info!(vmid, node = %query.node, port = vnc.port, "vnc ticket brokered");

    let body = ConsoleTicket {
        port: vnc.port,
        vncticket: vnc.ticket,
        node: query.node,
        vmid,
        user: vnc.user,
    };

    // The browser needs the upstream ticket as a cookie so subsequent
    // noVNC asset fetches against the PVE host succeed.
    let secure = is_secure_headers(&headers);
    let mut upstream = cookie::Cookie::new("PVEAuthCookie", upstream_cookie);
    upstream.set_path("/");
    upstream.set_secure(secure);
    // SameSite=None requires Secure; fall back to Lax on plain HTTP.
    upstream.set_same_site(if secure { SameSite::None } else { SameSite::Lax });
    match (&state.config.cookie_domain, state.proxmox.host_is_ip()) {
        (Some(domain), _) => upstream.set_domain(domain.clone()),
        // IP-literal hosts must not carry a Domain attribute.
        (None, true) => {}
        (None, false) => upstream.set_domain(state.proxmox.host().to_string()),
    }

    let mut response = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(&upstream.to_string()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct WebsocketQuery {
    pub node: String,
    pub port: u64,
    pub vncticket: String,
}

/// Phase two: upgrade the browser connection and shuttle VNC frames to the
/// upstream `vncwebsocket`. The upstream is dialled before the upgrade so
/// a dial failure still surfaces as a plain 502.
pub async fn websocket(
    State(state): State<AppState>,
    Path(vmid): Path<u64>,
    Query(query): Query<WebsocketQuery>,
    session: CurrentSession,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !session.data.authenticated {
        return ApiError::Unauthorized.into_response();
    }
    let Some(upstream_cookie) = session.data.pve_auth_cookie.clone() else {
        return ApiError::Unauthorized.into_response();
    };

    // `binary` is negotiated by default; a client that offered an explicit
    // protocol set gets that set honoured and forwarded upstream instead.
    let offered = offered_protocols(&headers);

    let url = state
        .proxmox
        .websocket_url(&query.node, vmid, query.port, &query.vncticket);
    debug!(%url, "dialling upstream vnc websocket");

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "invalid upstream websocket url");
            return ApiError::Internal("bad upstream url".into()).into_response();
        }
    };
    // Only the ticket cookie crosses; the Origin must be the upstream's
    // own, or PVE refuses the upgrade.
    let request_headers = request.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("PVEAuthCookie={}", upstream_cookie)) {
        request_headers.insert("Cookie", value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.proxmox.origin()) {
        request_headers.insert("Origin", value);
    }
    let upstream_protocols = if offered.is_empty() {
        "binary".to_string()
    } else {
        offered.join(", ")
    };
    if let Ok(value) = HeaderValue::from_str(&upstream_protocols) {
        request_headers.insert("Sec-WebSocket-Protocol", value);
    }

    let connector = if state.proxmox.verify_ssl() {
        None
    } else {
        match native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
        {
            Ok(tls) => Some(Connector::NativeTls(tls)),
            Err(e) => {
                warn!(error = %e, "tls connector construction failed");
                return ApiError::Internal("tls setup failed".into()).into_response();
            }
        }
    };

    let dialled = timeout(
        DIAL_TIMEOUT,
        connect_async_tls_with_config(request, None, false, connector),
    )
    .await;
    let upstream = match dialled {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!(vmid, error = %e, "upstream vnc websocket dial failed");
            return (StatusCode::BAD_GATEWAY, "upstream console unavailable").into_response();
        }
        Err(_) => {
            warn!(vmid, "upstream vnc websocket dial timed out");
            return (StatusCode::BAD_GATEWAY, "upstream console unavailable").into_response();
        }
    };

    let ticket = query.vncticket.clone();
    let ws = if offered.is_empty() {
        ws.protocols(["binary".to_string()])
    } else {
        ws.protocols(offered)
    };
    ws.on_upgrade(move |client| bridge(client, upstream, ticket, vmid))
}

/// Subprotocols the browser listed on its upgrade request.
fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Two copy tasks with a shared termination signal: either side's read
/// error, a normal close, or the idle cap tears both directions down.
async fn bridge(
    client: WebSocket,
    upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ticket: String,
    vmid: u64,
) {
    info!(vmid, "console bridge established");
    let (mut client_sink, mut client_stream) = client.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    // Local replies (auth_confirm) are merged into the upstream→client
    // direction so the client sink has a single writer.
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsMessage>(4);
    let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(2);

    let client_to_upstream = tokio::spawn({
        let done = done_tx.clone();
        async move {
            loop {
                let message = match timeout(IDLE_CAP, client_stream.next()).await {
                    Err(_) => {
                        let _ = done.try_send("client idle");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => {
                        let _ = done.try_send("client gone");
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                };
                let forward = match message {
                    WsMessage::Text(text) => {
                        if is_auth_request(&text) {
                            let reply = serde_json::json!({
                                "type": "auth_confirm",
                                "ticket": ticket,
                            });
                            let _ = reply_tx.send(WsMessage::Text(reply.to_string())).await;
                            continue;
                        }
                        UpstreamMessage::Text(text)
                    }
                    WsMessage::Binary(bytes) => UpstreamMessage::Binary(bytes),
                    WsMessage::Ping(bytes) => UpstreamMessage::Ping(bytes),
                    WsMessage::Pong(bytes) => UpstreamMessage::Pong(bytes),
                    WsMessage::Close(_) => {
                        let _ = done.try_send("client closed");
                        break;
                    }
                };
                if upstream_sink.send(forward).await.is_err() {
                    let _ = done.try_send("upstream write failed");
                    break;
                }
            }
            let _ = upstream_sink.close().await;
        }
    });

    let upstream_to_client = tokio::spawn({
        let done = done_tx.clone();
        async move {
            loop {
                tokio::select! {
                    reply = reply_rx.recv() => {
                        if let Some(message) = reply {
                            if client_sink.send(message).await.is_err() {
                                let _ = done.try_send("client write failed");
                                break;
                            }
                        }
                    }
                    upstream = timeout(IDLE_CAP, upstream_stream.next()) => {
                        let message = match upstream {
                            Err(_) => {
                                let _ = done.try_send("upstream idle");
                                break;
                            }
                            Ok(None) | Ok(Some(Err(_))) => {
                                let _ = client_sink
                                    .send(WsMessage::Close(Some(CloseFrame {
                                        code: UPSTREAM_ERROR_CLOSE,
                                        reason: "upstream closed".into(),
                                    })))
                                    .await;
                                let _ = done.try_send("upstream gone");
                                break;
                            }
                            Ok(Some(Ok(message))) => message,
                        };
                        let forward = match message {
                            UpstreamMessage::Text(text) => WsMessage::Text(text),
                            UpstreamMessage::Binary(bytes) => WsMessage::Binary(bytes),
                            UpstreamMessage::Ping(bytes) => WsMessage::Ping(bytes),
                            UpstreamMessage::Pong(bytes) => WsMessage::Pong(bytes),
                            UpstreamMessage::Close(_) => {
                                let _ = client_sink.send(WsMessage::Close(None)).await;
                                let _ = done.try_send("upstream closed");
                                break;
                            }
                            UpstreamMessage::Frame(_) => continue,
                        };
                        if client_sink.send(forward).await.is_err() {
                            let _ = done.try_send("client write failed");
                            break;
                        }
                    }
                }
            }
        }
    });
    drop(done_tx);

    let reason = done_rx.recv().await.unwrap_or("bridge torn down");
    client_to_upstream.abort();
    upstream_to_client.abort();
    info!(vmid, reason, "console bridge closed");
}

/// The embedded console client asks the portal (not PVE) to confirm its
/// ticket; the probe is answered locally and never forwarded.
fn is_auth_request(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed == "auth_request" {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "auth_request"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offered_protocols_parsed_from_header() {
        let mut headers = HeaderMap::new();
        assert!(offered_protocols(&headers).is_empty());

        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_static("chat, binary"),
        );
        assert_eq!(offered_protocols(&headers), vec!["chat", "binary"]);

        headers.append(
            "sec-websocket-protocol",
            HeaderValue::from_static("base64"),
        );
        assert_eq!(
            offered_protocols(&headers),
            vec!["chat", "binary", "base64"]
        );
    }

    #[test]
    fn auth_request_detection() {
        assert!(is_auth_request("auth_request"));
        assert!(is_auth_request("  auth_request "));
        assert!(is_auth_request(r#"{"type":"auth_request"}"#));
        assert!(!is_auth_request(r#"{"type":"ping"}"#));
        assert!(!is_auth_request("RFB 003.008"));
    }
}
