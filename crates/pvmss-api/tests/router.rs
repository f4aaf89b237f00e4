//! End-to-end tests of the middleware pipeline and handlers against a mock
//! Proxmox upstream.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use pvmss_api::{build_router, AppState};
use pvmss_core::{Config, NodeLimits, SettingsStore};
use pvmss_proxmox::{ProxmoxClient, StatusHandle};
use pvmss_session::SessionStore;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    router: Router,
    state: AppState,
    _settings_dir: tempfile::TempDir,
}

fn test_config(upstream: &str, settings_path: PathBuf) -> Config {
    Config {
        proxmox_url: upstream.to_string(),
        api_token_name: Some("svc@pve!portal".into()),
        api_token_value: Some("secret-uuid".into()),
        verify_ssl: true,
        admin_password_hash: bcrypt::hash("admin123", 4).unwrap(),
        session_secret: "0123456789abcdef0123456789abcdef".into(),
        port: 0,
        log_level: "info".into(),
        cookie_domain: None,
        settings_path,
        production: false,
    }
}

async fn harness(upstream: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.json");
    let config = test_config(&upstream.uri(), settings_path.clone());

    let (settings, _) = SettingsStore::load(&settings_path).unwrap();
    let proxmox = Arc::new(
        ProxmoxClient::new(&config.proxmox_url, true)
            .unwrap()
            .with_api_token("svc@pve!portal", "secret-uuid"),
    );
    let sessions = Arc::new(SessionStore::new(config.session_secret.as_bytes()));
    let state = AppState::new(config, settings, proxmox, sessions, StatusHandle::detached());
    Harness {
        router: build_router(state.clone()),
        state,
        _settings_dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&body).to_string())
}

fn session_cookie_value(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("pvmss_session="))
        .map(|v| v.split(';').next().unwrap().to_string())
}

fn csrf_from_html(html: &str) -> String {
    let marker = "name=\"csrf_token\" value=\"";
    let start = html.find(marker).expect("form carries csrf token") + marker.len();
    let end = html[start..].find('"').unwrap() + start;
    html[start..end].to_string()
}

/// Fetches `path` with the given cookie, returning the CSRF token the form
/// carries (minting the session first when `cookie` is None).
async fn csrf_for(router: &Router, cookie: Option<&str>, get_path: &str) -> (String, String) {
    let mut request = Request::builder().uri(get_path);
    if let Some(cookie) = cookie {
        request = request.header(COOKIE, cookie);
    }
    let (status, headers, body) = send(router, request.body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK, "GET {} failed", get_path);
    let cookie = cookie
        .map(str::to_string)
        .or_else(|| session_cookie_value(&headers))
        .expect("session cookie issued");
    (cookie, csrf_from_html(&body))
}

fn form_post(uri: &str, cookie: &str, body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(COOKIE, cookie)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

/// Creates an authenticated user session directly in the store.
fn forge_user_session(state: &AppState, username: &str) -> String {
    let token = state.sessions.create();
    let mut data = state.sessions.get(&token).unwrap();
    data.authenticated = true;
    data.username = Some(username.to_string());
    data.pve_auth_cookie = Some("PVE:user:TICKET".to_string());
    data.csrf_prevention_token = Some("CSRF:upstream".to_string());
    state.sessions.set(&token, data);
    let cookie = state.sessions.cookie_for(&token, false);
    format!("pvmss_session={}", cookie.value())
}

/// Creates an admin session directly in the store.
fn forge_admin_session(state: &AppState) -> String {
    let token = state.sessions.create();
    let mut data = state.sessions.get(&token).unwrap();
    data.authenticated = true;
    data.is_admin = true;
    state.sessions.set(&token, data);
    let cookie = state.sessions.cookie_for(&token, false);
    format!("pvmss_session={}", cookie.value())
}

#[tokio::test]
async fn health_never_touches_the_session() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let (status, headers, body) = send(
        &h.router,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
    assert!(session_cookie_value(&headers).is_none());
    assert!(h.state.sessions.is_empty());
}

#[tokio::test]
async fn security_headers_and_session_cookie_on_pages() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let (status, headers, _) = send(
        &h.router,
        Request::builder().uri("/").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-xss-protection"], "1; mode=block");
    assert!(headers.contains_key("content-security-policy"));
    assert!(headers.contains_key("permissions-policy"));
    // Not production: no HSTS.
    assert!(!headers.contains_key("strict-transport-security"));
    let cookie = session_cookie_value(&headers).expect("session cookie");
    assert!(cookie.starts_with("pvmss_session="));
}

#[tokio::test]
async fn trailing_slash_canonicalized() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let (status, headers, _) = send(
        &h.router,
        Request::builder().uri("/login/?lang=en").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/login?lang=en");
}

#[tokio::test]
async fn csrf_missing_is_403_with_no_side_effect() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let before = h.state.settings.get();

    let cookie = forge_user_session(&h.state, "alice");
    let (status, _, _) = send(
        &h.router,
        form_post("/vm/action", &cookie, "vmid=1&node=pve1&action=start".into()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(*before, *h.state.settings.get());
    // No upstream call was attempted: the mock server saw nothing.
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn sixth_login_attempt_is_rate_limited() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;

    for i in 0..5 {
        let (status, _, _) = send(
            &h.router,
            form_post("/login", "pvmss_session=none", format!("username=u{}&password=x", i)),
        )
        .await;
        // Rate limit passes; CSRF then rejects the bare POST.
        assert_eq!(status, StatusCode::FORBIDDEN, "attempt {}", i);
    }
    let (status, headers, _) = send(
        &h.router,
        form_post("/login", "pvmss_session=none", "username=u&password=x".into()),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers["retry-after"], "10");
}

#[tokio::test]
async fn admin_login_rotates_session_and_limits_save_clamps() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;

    let (anon_cookie, csrf) = csrf_for(&h.router, None, "/admin/login").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/admin/login",
            &anon_cookie,
            format!("csrf_token={}&password=admin123", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/admin");
    let admin_cookie = session_cookie_value(&headers).expect("rotated session cookie");
    assert_ne!(admin_cookie, anon_cookie);

    // Swapped sockets pair and a zero cores-min, exactly as submitted by
    // the limits form.
    let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
    let body = format!(
        "csrf_token={}&entityId=vm&sockets-min=2&sockets-max=1&cores-min=0&cores-max=4\
&ram-min=2&ram-max=8&disk-min=10&disk-max=50",
        csrf
    );
    let (status, headers, _) = send(&h.router, form_post("/admin/limits", &admin_cookie, body)).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/admin/limits");

    let saved = h.state.settings.get();
    assert_eq!(saved.limits.vm.sockets.min, 1);
    assert_eq!(saved.limits.vm.sockets.max, 2);
    assert_eq!(saved.limits.vm.cores.min, 1);
    assert_eq!(saved.limits.vm.cores.max, 4);
    assert_eq!(saved.limits.vm.ram.min, 2);
    assert_eq!(saved.limits.vm.ram.max, 8);
    assert_eq!(saved.limits.vm.disk.min, 10);
    assert_eq!(saved.limits.vm.disk.max, 50);

    // Wrong password never authenticates.
    let (fresh_cookie, csrf) = csrf_for(&h.router, None, "/admin/login").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/admin/login",
            &fresh_cookie,
            format!("csrf_token={}&password=nope", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/admin/login");
}

#[tokio::test]
async fn aggregate_cap_rejects_create_without_upstream_post() {
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"node": "pve1", "status": "online"}]
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {"type": "qemu", "vmid": 201, "node": "pve1", "name": "a",
                 "status": "running", "tags": "pvmss", "pool": "pvmss_bob"},
                {"type": "qemu", "vmid": 202, "node": "pve1", "name": "b",
                 "status": "running", "tags": "pvmss", "pool": "pvmss_carol"}
            ]
        })))
        .mount(&upstream)
        .await;
    for (vmid, cores, memory) in [(201u64, 4u64, 8192u64), (202, 2, 4096)] {
        Mock::given(method("GET"))
            .and(path(format!("/api2/json/nodes/pve1/qemu/{}/config", vmid)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"sockets": 1, "cores": cores, "memory": memory}
            })))
            .mount(&upstream)
            .await;
    }
    // The assertion that matters: no create POST ever reaches Proxmox.
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;

    // Catalogue and caps: existing pvmss load on pve1 is 6 cores / 12 GB.
    let mut settings = (*h.state.settings.get()).clone();
    settings.isos.insert("local:iso/debian-12.iso".into());
    settings.vmbrs.insert("vmbr0".into());
    settings.enabled_storages.insert("local-lvm".into());
    settings.limits.nodes.insert(
        "pve1".into(),
        NodeLimits { sockets: 16, cores: 8, ram: 16 },
    );
    h.state.settings.set(settings).await.unwrap();

    let user_cookie = forge_user_session(&h.state, "alice");
    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;
    let body = format!(
        "csrf_token={}&name=web-1&sockets=1&cores=4&memory=8192&disk_size=20\
&iso=local%3Aiso%2Fdebian-12.iso&bridge=vmbr0&node=pve1&storage=local-lvm",
        csrf
    );
    let (status, _, body) = send(&h.router, form_post("/api/vm/create", &user_cookie, body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("cores exceed node 'pve1' max"), "body: {}", body);
}

#[tokio::test]
async fn console_ticket_sets_upstream_cookie() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/42/vncproxy"))
        .and(header("Cookie", "PVEAuthCookie=PVE:user:TICKET"))
        .and(header("CSRFPreventionToken", "CSRF:upstream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"ticket": "PVEVNC:T", "port": "5900", "user": "alice@pve"}
        })))
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");

    let (status, headers, body) = send(
        &h.router,
        Request::builder()
            .uri("/api/console/qemu/42?node=pve1")
            .header(COOKIE, &user_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    let ticket: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(ticket["port"], 5900);
    assert_eq!(ticket["vncticket"], "PVEVNC:T");

    let pve_cookie = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("PVEAuthCookie="))
        .expect("upstream cookie set");
    assert!(pve_cookie.contains("PVE:user:TICKET"));
    // Mock upstream is an IP literal, so no Domain attribute.
    assert!(!pve_cookie.contains("Domain="));
}

#[tokio::test]
async fn console_ticket_requires_captured_credential() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;

    let token = h.state.sessions.create();
    let mut data = h.state.sessions.get(&token).unwrap();
    data.authenticated = true;
    data.username = Some("alice".into());
    // No pve_auth_cookie captured.
    h.state.sessions.set(&token, data);
    let cookie = format!(
        "pvmss_session={}",
        h.state.sessions.cookie_for(&token, false).value()
    );

    let (status, _, _) = send(
        &h.router,
        Request::builder()
            .uri("/api/console/qemu/42?node=pve1")
            .header(COOKIE, &cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_rotates_and_invalidates_old_token() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");

    // Authenticated: the search page renders.
    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;

    let (status, headers, _) = send(
        &h.router,
        form_post("/logout", &user_cookie, format!("csrf_token={}", csrf)),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/login");
    let new_cookie = session_cookie_value(&headers).expect("rotated cookie");
    assert_ne!(new_cookie, user_cookie);

    // The old token no longer authenticates anything.
    let (status, headers, _) = send(
        &h.router,
        Request::builder()
            .uri("/search")
            .header(COOKIE, &user_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/login");
}

#[tokio::test]
async fn user_login_captures_upstream_ticket() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api2/json/access/ticket"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "ticket": "PVE:alice@pve:AABB::sig",
                "CSRFPreventionToken": "AABB:csrf",
                "username": "alice@pve"
            }
        })))
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let (anon_cookie, csrf) = csrf_for(&h.router, None, "/login").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/login",
            &anon_cookie,
            format!("csrf_token={}&username=alice&password=hunter2", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/search");
    let rotated = session_cookie_value(&headers).expect("rotated session");
    assert_ne!(rotated, anon_cookie);

    let token = h
        .state
        .sessions
        .token_from_cookie_header(&rotated)
        .expect("valid rotated cookie");
    let data = h.state.sessions.get(&token).unwrap();
    assert!(data.authenticated);
    assert!(!data.is_admin);
    assert_eq!(data.username.as_deref(), Some("alice"));
    assert_eq!(data.pve_auth_cookie.as_deref(), Some("PVE:alice@pve:AABB::sig"));
    assert_eq!(data.csrf_prevention_token.as_deref(), Some("AABB:csrf"));
}

#[tokio::test]
async fn details_cache_hit_then_action_invalidation() {
    let upstream = MockServer::start().await;

    // Exactly two cluster queries: the first details render caches it, the
    // second render hits the cache, and the post-action refresh re-fetches.
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "qemu", "vmid": 101, "node": "pve1", "name": "web-1",
                      "status": "stopped", "tags": "pvmss", "pool": "pvmss_alice"}]
        })))
        .expect(2)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve1/qemu/101/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"name": "web-1", "tags": "pvmss", "cores": 2, "memory": 2048}
        })))
        .expect(2)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/101/status/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "UPID"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");

    for _ in 0..2 {
        let (status, _, body) = send(
            &h.router,
            Request::builder()
                .uri("/vm/details/101")
                .header(COOKIE, &user_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {}", body);
        assert!(body.contains("web-1"));
    }

    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/vm/action",
            &user_cookie,
            format!("csrf_token={}&vmid=101&node=pve1&action=start", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/vm/details/101?refresh=1");

    // The refresh render re-fetches past the invalidated cache.
    let (status, _, _) = send(
        &h.router,
        Request::builder()
            .uri("/vm/details/101?refresh=1")
            .header(COOKIE, &user_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn iso_toggle_is_idempotent_end_to_end() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let admin_cookie = forge_admin_session(&h.state);
    let volid = "local:iso/debian-12.iso";

    let toggle = |csrf: String, action: &str| {
        format!(
            "csrf_token={}&volid=local%3Aiso%2Fdebian-12.iso&action={}",
            csrf, action
        )
    };

    // Enable twice: one entry.
    for _ in 0..2 {
        let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
        let (status, headers, _) = send(
            &h.router,
            form_post("/admin/iso/toggle", &admin_cookie, toggle(csrf, "enable")),
        )
        .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(headers[LOCATION], "/admin/iso");
    }
    assert!(h.state.settings.get().isos.contains(volid));
    assert_eq!(h.state.settings.get().isos.len(), 1);

    // Disable twice: absent, still no error.
    for _ in 0..2 {
        let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
        let (status, _, _) = send(
            &h.router,
            form_post("/admin/iso/toggle", &admin_cookie, toggle(csrf, "disable")),
        )
        .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
    }
    assert!(!h.state.settings.get().isos.contains(volid));

    // The persisted document agrees with the snapshot.
    let (reloaded, _) = SettingsStore::load(h.state.config.settings_path.clone()).unwrap();
    assert!(!reloaded.get().isos.contains(volid));
}

#[tokio::test]
async fn tag_update_rewrites_normalized_set() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "qemu", "vmid": 101, "node": "pve1", "name": "web-1",
                      "status": "running", "tags": "pvmss;web", "pool": "pvmss_alice"}]
        })))
        .mount(&upstream)
        .await;
    // The mandatory tag leads the semicolon-joined set even though the
    // form only submitted "web".
    Mock::given(method("PUT"))
        .and(path("/api2/json/nodes/pve1/qemu/101/config"))
        .and(wiremock::matchers::body_string_contains("tags=pvmss%3Bweb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": null})))
        .expect(1)
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let mut settings = (*h.state.settings.get()).clone();
    settings.tags.insert("web".into());
    h.state.settings.set(settings).await.unwrap();

    let user_cookie = forge_user_session(&h.state, "alice");
    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/vm/update/tags",
            &user_cookie,
            format!("csrf_token={}&vmid=101&node=pve1&tags%5B%5D=web", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/vm/details/101?refresh=1");
}

#[tokio::test]
async fn foreign_pool_vm_is_forbidden() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"type": "qemu", "vmid": 300, "node": "pve1", "name": "other",
                      "status": "running", "tags": "pvmss", "pool": "pvmss_bob"}]
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve1/qemu/300/status/stop"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");
    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;
    let (status, _, _) = send(
        &h.router,
        form_post(
            "/vm/action",
            &user_cookie,
            format!("csrf_token={}&vmid=300&node=pve1&action=stop", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn vm_not_found_renders_localized_error_page() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");

    let (status, headers, body) = send(
        &h.router,
        Request::builder()
            .uri("/vm/details/999?lang=fr")
            .header(COOKIE, &user_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(headers[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert!(body.contains("Page introuvable."), "body: {}", body);
    // Security headers survive the body swap.
    assert_eq!(headers["x-content-type-options"], "nosniff");
}

#[tokio::test]
async fn api_routes_keep_json_error_bodies() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;

    // No session credential: the console ticket endpoint answers 401 JSON,
    // untouched by the error page layer.
    let (status, headers, body) = send(
        &h.router,
        Request::builder()
            .uri("/api/console/qemu/42?node=pve1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers[CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["status"], 401);
}

#[tokio::test]
async fn invalid_toggle_action_flashes_back_to_admin_page() {
    let upstream = MockServer::start().await;
    // Empty cluster so the ISO page renders without an upstream error
    // clobbering the flash.
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let admin_cookie = forge_admin_session(&h.state);
    let before = h.state.settings.get();

    let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/admin/iso/toggle",
            &admin_cookie,
            format!("csrf_token={}&volid=local%3Aiso%2Fa.iso&action=flip", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/admin/iso");
    assert_eq!(*before, *h.state.settings.get());

    // The redirected-to page carries the flash error.
    let (status, _, body) = send(
        &h.router,
        Request::builder()
            .uri("/admin/iso")
            .header(COOKIE, &admin_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("unknown action flip"), "body: {}", body);
}

#[tokio::test]
async fn rejected_tag_is_preserved_for_the_form() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let admin_cookie = forge_admin_session(&h.state);

    let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
    let (status, headers, _) = send(
        &h.router,
        form_post(
            "/admin/tags/add",
            &admin_cookie,
            format!("csrf_token={}&tag=bad+tag%21", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[LOCATION], "/admin/tags");

    let (status, _, body) = send(
        &h.router,
        Request::builder()
            .uri("/admin/tags")
            .header(COOKIE, &admin_cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Both the localized complaint and the rejected input re-render.
    assert!(body.contains("Names may only contain"), "body: {}", body);
    assert!(body.contains("value=\"bad tag!\""), "body: {}", body);
    assert!(!h.state.settings.get().tags.contains("bad tag!"));
}

#[tokio::test]
async fn unknown_limits_entity_is_not_found() {
    let upstream = MockServer::start().await;
    let h = harness(&upstream).await;
    let admin_cookie = forge_admin_session(&h.state);

    let (_, csrf) = csrf_for(&h.router, Some(&admin_cookie), "/admin/limits").await;
    let (status, _, _) = send(
        &h.router,
        form_post(
            "/admin/limits",
            &admin_cookie,
            format!("csrf_token={}&entityId=cluster&cores-max=4", csrf),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn search_requires_criteria_and_caps_results() {
    let upstream = MockServer::start().await;
    let vms: Vec<serde_json::Value> = (100..160)
        .map(|vmid| {
            serde_json::json!({
                "type": "qemu", "vmid": vmid, "node": "pve1",
                "name": format!("vm-{}", vmid), "status": "running", "tags": "pvmss"
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .and(query_param("type", "vm"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": vms})),
        )
        .mount(&upstream)
        .await;

    let h = harness(&upstream).await;
    let user_cookie = forge_user_session(&h.state, "alice");
    let (_, csrf) = csrf_for(&h.router, Some(&user_cookie), "/search").await;

    // No criteria: the form is re-rendered with a hint, nothing listed.
    let (status, _, body) = send(
        &h.router,
        form_post("/search", &user_cookie, format!("csrf_token={}", csrf)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("/vm/details/"));

    // Matching by name substring is capped at 20 rows.
    let (status, _, body) = send(
        &h.router,
        form_post("/search", &user_cookie, format!("csrf_token={}&name=VM-", csrf)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.matches("/vm/details/").count(), 20);
}
