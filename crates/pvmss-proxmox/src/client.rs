use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::cache::{ResponseCache, DEFAULT_CACHE_TTL};
use crate::error::{ProxmoxError, ProxmoxResult};
use crate::types::{ApiResponse, TicketData, VncProxyData};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const GET_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// How a request authenticates against the upstream API.
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    /// `Authorization: PVEAPIToken=<id>=<secret>`.
    ApiToken { id: String, secret: String },
    /// `Cookie: PVEAuthCookie=<ticket>` plus `CSRFPreventionToken` on
    /// unsafe methods. Required for vncproxy so the resulting VNC ticket is
    /// bound to a user principal PVE's console recognizes.
    Ticket { cookie: String, csrf: String },
}

/// Authenticated HTTPS adapter for the Proxmox API.
///
/// The process-wide instance carries the API token and the response cache.
/// Per-user instances made with [`ProxmoxClient::for_ticket`] share the
/// pooled transport but authenticate with the session's captured ticket and
/// carry no cache, so user-scoped responses are never replayed across
/// principals.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base: Url,
    auth: RwLock<Auth>,
    cache: Option<Arc<ResponseCache>>,
    verify_ssl: bool,
}

impl ProxmoxClient {
    /// Builds the shared client. `raw_url` may omit the scheme (https is
    /// assumed) and the `/api2/json` suffix (it is appended).
    pub fn new(raw_url: &str, verify_ssl: bool) -> ProxmoxResult<Self> {
        let base = normalize_base_url(raw_url)?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProxmoxError::Build(e.to_string()))?;
        Ok(Self {
            http,
            base,
            auth: RwLock::new(Auth::None),
            cache: Some(Arc::new(ResponseCache::new(DEFAULT_CACHE_TTL))),
            verify_ssl,
        })
    }

    pub fn with_api_token(self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            auth: RwLock::new(Auth::ApiToken {
                id: id.into(),
                secret: secret.into(),
            }),
            ..self
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Some(Arc::new(ResponseCache::new(ttl)));
        self
    }

    /// Cache-less sibling that authenticates with a session's captured
    /// upstream ticket, sharing this client's pooled transport.
    pub fn for_ticket(&self, cookie: impl Into<String>, csrf: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base: self.base.clone(),
            auth: RwLock::new(Auth::Ticket {
                cookie: cookie.into(),
                csrf: csrf.into(),
            }),
            cache: None,
            verify_ssl: self.verify_ssl,
        }
    }

    /// Cache-less, credential-less sibling used to drive `/access/ticket`
    /// logins on behalf of a browser user.
    pub fn detached(&self) -> Self {
        Self {
            http: self.http.clone(),
            base: self.base.clone(),
            auth: RwLock::new(Auth::None),
            cache: None,
            verify_ssl: self.verify_ssl,
        }
    }

    pub fn verify_ssl(&self) -> bool {
        self.verify_ssl
    }

    pub fn host(&self) -> &str {
        self.base.host_str().unwrap_or_default()
    }

    /// True when the upstream host is an IP literal, in which case the
    /// console cookie must not carry a Domain attribute.
    pub fn host_is_ip(&self) -> bool {
        matches!(self.base.host(), Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)))
    }

    /// `scheme://host[:port]` of the upstream, used as the Origin header
    /// and cookie scope for the console path.
    pub fn origin(&self) -> String {
        let mut origin = format!("{}://{}", self.base.scheme(), self.host());
        if let Some(port) = self.base.port() {
            origin.push_str(&format!(":{}", port));
        }
        origin
    }

    /// Upstream URL the console bridge dials for frame shuttling.
    pub fn websocket_url(&self, node: &str, vmid: u64, port: u64, ticket: &str) -> String {
        let scheme = if self.base.scheme() == "http" { "ws" } else { "wss" };
        let encoded: String = url::form_urlencoded::byte_serialize(ticket.as_bytes()).collect();
        let mut hostport = self.host().to_string();
        if let Some(p) = self.base.port() {
            hostport.push_str(&format!(":{}", p));
        }
        format!(
            "{}://{}/api2/json/nodes/{}/qemu/{}/vncwebsocket?port={}&vncticket={}",
            scheme, hostport, node, vmid, port, encoded
        )
    }

    /// Cache-aware GET. Within the TTL the transport is hit exactly once
    /// per path; transient failures are retried up to three times with a
    /// bounded backoff. 4xx are final, 401/403 map to `AuthFailed`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ProxmoxResult<T> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(path) {
                debug!(path, "proxmox cache hit");
                return Ok(serde_json::from_value(hit)?);
            }
        }

        let value = self.get_fresh(path, None).await?;
        if let Some(cache) = &self.cache {
            cache.put(path, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    /// GET that bypasses and does not populate the cache.
    pub async fn get_json_uncached<T: DeserializeOwned>(&self, path: &str) -> ProxmoxResult<T> {
        let value = self.get_fresh(path, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_fresh(
        &self,
        path: &str,
        timeout: Option<Duration>,
    ) -> ProxmoxResult<serde_json::Value> {
        let mut last_err = None;
        for attempt in 1..=GET_ATTEMPTS {
            let request = self.request(Method::GET, path, timeout).await;
            match self.dispatch(request).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < GET_ATTEMPTS => {
                    warn!(path, attempt, error = %e, "retrying proxmox GET");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ProxmoxError::Transport("request never dispatched".into())))
    }

    /// Form-encoded POST. Never cached, never retried; on success the
    /// target path and its parent collection fall out of the cache.
    pub async fn post_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> ProxmoxResult<serde_json::Value> {
        self.write(Method::POST, path, Some(form), None).await
    }

    pub async fn post_form_with_timeout(
        &self,
        path: &str,
        form: &[(&str, String)],
        timeout: Duration,
    ) -> ProxmoxResult<serde_json::Value> {
        self.write(Method::POST, path, Some(form), Some(timeout)).await
    }

    pub async fn put_form(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> ProxmoxResult<serde_json::Value> {
        self.write(Method::PUT, path, Some(form), None).await
    }

    pub async fn delete(&self, path: &str) -> ProxmoxResult<serde_json::Value> {
        self.write(Method::DELETE, path, None, None).await
    }

    async fn write(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
        timeout: Option<Duration>,
    ) -> ProxmoxResult<serde_json::Value> {
        let mut request = self.request(method, path, timeout).await;
        if let Some(form) = form {
            request = request.form(form);
        }
        let value = self.dispatch(request).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate_with_parent(path);
        }
        Ok(value)
    }

    /// `POST /access/ticket`. On success the ticket and CSRF prevention
    /// token are stored on this instance for subsequent requests.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        realm: &str,
    ) -> ProxmoxResult<TicketData> {
        let form = [
            ("username", username.to_string()),
            ("password", password.to_string()),
            ("realm", realm.to_string()),
        ];
        let request = self
            .http
            .post(self.url_for("/access/ticket"))
            .form(&form);
        let value = self.dispatch(request).await?;
        let ticket: TicketData = data_from(value)?;
        let cookie = ticket.ticket.clone().ok_or(ProxmoxError::MissingTicket)?;
        let csrf = ticket.csrf_prevention_token.clone().unwrap_or_default();
        *self.auth.write().await = Auth::Ticket { cookie, csrf };
        Ok(ticket)
    }

    /// `POST /nodes/{node}/qemu/{vmid}/vncproxy?websocket=1`. Must run on a
    /// ticket-authenticated instance so PVE binds the VNC ticket to the
    /// user principal.
    pub async fn vncproxy(&self, node: &str, vmid: u64) -> ProxmoxResult<VncProxyData> {
        let path = format!("/nodes/{}/qemu/{}/vncproxy", node, vmid);
        let value = self
            .post_form(&path, &[("websocket", "1".to_string())])
            .await?;
        data_from(value)
    }

    /// Cheap reachability probe: `GET /nodes` with a short timeout,
    /// bypassing the cache.
    pub async fn check_connection(&self) -> ProxmoxResult<()> {
        let request = self.request(Method::GET, "/nodes", Some(PROBE_TIMEOUT)).await;
        self.dispatch(request).await.map(|_| ())
    }

    /// Drops every cache entry under `prefix`.
    pub fn invalidate_cache(&self, prefix: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_prefix(prefix);
        }
    }

    /// Fetches a non-API asset (the noVNC payload under `/pve2/...`)
    /// straight off the upstream host, optionally presenting a user's
    /// ticket cookie. Never cached.
    pub async fn fetch_asset(
        &self,
        absolute_path: &str,
        ticket_cookie: Option<&str>,
    ) -> ProxmoxResult<AssetResponse> {
        let url = format!("{}{}", self.origin(), absolute_path);
        let mut request = self.http.get(&url);
        if let Some(ticket) = ticket_cookie {
            request = request.header("Cookie", format!("PVEAuthCookie={}", ticket));
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProxmoxError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxmoxError::Transport(e.to_string()))?;
        Ok(AssetResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path
        )
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        timeout: Option<Duration>,
    ) -> RequestBuilder {
        let unsafe_method = method != Method::GET && method != Method::HEAD;
        let mut request = self.http.request(method, self.url_for(path));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        match &*self.auth.read().await {
            Auth::None => {}
            Auth::ApiToken { id, secret } => {
                request = request.header("Authorization", format!("PVEAPIToken={}={}", id, secret));
            }
            Auth::Ticket { cookie, csrf } => {
                request = request.header("Cookie", format!("PVEAuthCookie={}", cookie));
                if unsafe_method && !csrf.is_empty() {
                    request = request.header("CSRFPreventionToken", csrf.clone());
                }
            }
        }
        request
    }

    async fn dispatch(&self, request: RequestBuilder) -> ProxmoxResult<serde_json::Value> {
        let response = request
            .send()
            .await
            .map_err(|e| ProxmoxError::Transport(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProxmoxError::AuthFailed {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ProxmoxError::Status {
                status: status.as_u16(),
                message: error_text(response).await,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ProxmoxError::Transport(format!("reading response body: {}", e)))
    }
}

/// Reverse-proxied upstream asset.
#[derive(Debug, Clone)]
pub struct AssetResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Pulls `data` out of the `{"data": ...}` envelope.
pub fn data_from<T: DeserializeOwned>(value: serde_json::Value) -> ProxmoxResult<T> {
    let envelope: ApiResponse<T> = serde_json::from_value(value)?;
    envelope.data.ok_or(ProxmoxError::EmptyData)
}

async fn error_text(response: Response) -> String {
    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or("unknown")
        .to_string();
    match response.text().await {
        Ok(body) if !body.trim().is_empty() => {
            let mut body = body.trim().to_string();
            if body.len() > 300 {
                body.truncate(300);
            }
            body
        }
        _ => reason,
    }
}

fn normalize_base_url(raw: &str) -> ProxmoxResult<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ProxmoxError::InvalidUrl {
            url: raw.to_string(),
            reason: "empty".into(),
        });
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let mut url = Url::parse(&candidate).map_err(|e| ProxmoxError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxmoxError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ProxmoxError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".into(),
        });
    }
    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/api2/json") {
        url.set_path(&format!("{}/api2/json", path));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClusterResource, NodeItem};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ProxmoxClient {
        ProxmoxClient::new(&server.uri(), true)
            .unwrap()
            .with_api_token("svc@pve!portal", "secret-uuid")
    }

    #[test]
    fn base_url_normalization() {
        let url = normalize_base_url("pve.example:8006").unwrap();
        assert_eq!(url.as_str(), "https://pve.example:8006/api2/json");

        let url = normalize_base_url("https://pve.example:8006/").unwrap();
        assert_eq!(url.as_str(), "https://pve.example:8006/api2/json");

        let url = normalize_base_url("https://pve.example:8006/api2/json").unwrap();
        assert_eq!(url.as_str(), "https://pve.example:8006/api2/json");

        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("ftp://pve.example").is_err());
    }

    #[test]
    fn websocket_url_encodes_ticket() {
        let client = ProxmoxClient::new("https://pve.example:8006", true).unwrap();
        let url = client.websocket_url("pve1", 42, 5900, "PVEVNC:AB+/=");
        assert_eq!(
            url,
            "wss://pve.example:8006/api2/json/nodes/pve1/qemu/42/vncwebsocket?port=5900&vncticket=PVEVNC%3AAB%2B%2F%3D"
        );
    }

    #[test]
    fn ip_literal_detection() {
        let client = ProxmoxClient::new("https://192.168.1.10:8006", true).unwrap();
        assert!(client.host_is_ip());
        let client = ProxmoxClient::new("https://pve.example:8006", true).unwrap();
        assert!(!client.host_is_ip());
        assert_eq!(client.origin(), "https://pve.example:8006");
    }

    #[tokio::test]
    async fn get_is_cached_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .and(header("Authorization", "PVEAPIToken=svc@pve!portal=secret-uuid"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [{"node": "pve1"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        for _ in 0..3 {
            let nodes: ApiResponse<Vec<NodeItem>> = client.get_json("/nodes").await.unwrap();
            assert_eq!(nodes.data.unwrap()[0].node, "pve1");
        }
    }

    #[tokio::test]
    async fn write_invalidates_cached_path() {
        let server = MockServer::start().await;
        let vm_path = "/api2/json/nodes/pve1/qemu/101/status/current";
        Mock::given(method("GET"))
            .and(path(vm_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": {"status": "stopped"}})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/qemu/101/status/current"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": null})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let api_path = "/nodes/pve1/qemu/101/status/current";
        let _: serde_json::Value = client.get_json(api_path).await.unwrap();
        client.post_form(api_path, &[]).await.unwrap();
        // Post invalidated the entry, so this GET hits the transport again.
        let _: serde_json::Value = client.get_json(api_path).await.unwrap();
    }

    #[tokio::test]
    async fn transient_5xx_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let out: ApiResponse<Vec<ClusterResource>> =
            client.get_json("/cluster/resources").await.unwrap();
        assert!(out.data.unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_found_is_final() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/missing/status"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .get_json::<serde_json::Value>("/nodes/missing/status")
            .await
            .unwrap_err();
        assert_eq!(err.upstream_status(), Some(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn auth_failure_is_never_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.get_json::<serde_json::Value>("/nodes").await.unwrap_err();
        assert!(matches!(err, ProxmoxError::AuthFailed { status: 401 }));
    }

    #[tokio::test]
    async fn login_stores_ticket_and_sends_csrf_on_writes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .and(body_string_contains("username=alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "ticket": "PVE:alice@pve:AABB::sig",
                    "CSRFPreventionToken": "AABB:csrf",
                    "username": "alice@pve"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve1/qemu/42/vncproxy"))
            .and(header("Cookie", "PVEAuthCookie=PVE:alice@pve:AABB::sig"))
            .and(header("CSRFPreventionToken", "AABB:csrf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"ticket": "PVEVNC:T", "port": "5900", "user": "alice@pve"}
            })))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&server.uri(), true).unwrap();
        let ticket = client.login("alice", "hunter2", "pve").await.unwrap();
        assert_eq!(ticket.username.as_deref(), Some("alice@pve"));

        let vnc = client.vncproxy("pve1", 42).await.unwrap();
        assert_eq!(vnc.port, 5900);
        assert_eq!(vnc.ticket, "PVEVNC:T");
    }

    #[tokio::test]
    async fn login_without_ticket_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .mount(&server)
            .await;

        let client = ProxmoxClient::new(&server.uri(), true).unwrap();
        let err = client.login("alice", "wrong", "pve").await.unwrap_err();
        assert!(matches!(err, ProxmoxError::MissingTicket));
    }

    #[tokio::test]
    async fn ticket_client_shares_transport_but_not_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .and(header("Cookie", "PVEAuthCookie=TICKET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .expect(2)
            .mount(&server)
            .await;

        let shared = ProxmoxClient::new(&server.uri(), true).unwrap();
        let user = shared.for_ticket("TICKET", "CSRF");
        // No cache on the per-user client: both GETs reach the transport.
        let _: serde_json::Value = user.get_json("/nodes").await.unwrap();
        let _: serde_json::Value = user.get_json("/nodes").await.unwrap();
    }
}
