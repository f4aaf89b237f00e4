pub mod admin;
pub mod assets;
pub mod auth;
pub mod console;
pub mod search;
pub mod vm;

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{extract::State, Extension, Router};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::error;

use crate::error::ApiResult;
use crate::i18n::Locale;
use crate::middleware::{
    csrf_layer, error_page_layer, rate_limit_layer, security_headers_layer, session_layer,
    status_layer, trailing_slash_layer, CsrfToken, CurrentSession, UpstreamStatusExt,
};
use crate::state::AppState;

/// Assembles the full application router with the middleware stack in the
/// order the pipeline requires: session, rate limit, status injection,
/// CSRF, security headers, trailing slash, panic recovery, then routing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/health", get(health))
        .route("/login", get(auth::login_page).post(auth::login_submit))
        .route("/admin/login", get(auth::admin_login_page).post(auth::admin_login_submit))
        .route("/logout", get(auth::logout_page).post(auth::logout_submit))
        .route("/search", get(search::page).post(search::submit))
        .route("/profile", get(search::profile))
        .route("/vm/create", get(vm::create_page))
        .route("/api/vm/create", post(vm::create_submit))
        .route("/vm/details/:vmid", get(vm::details))
        .route("/vm/action", post(vm::action))
        .route("/vm/update/description", post(vm::update_description))
        .route("/vm/update/tags", post(vm::update_tags))
        .route("/vm/delete", post(vm::delete))
        .route("/api/console/qemu/:vmid", get(console::ticket))
        .route("/api/console/qemu/:vmid/ws", get(console::websocket))
        .route("/pve2/*path", get(assets::novnc_proxy))
        .route("/admin", get(admin::dashboard))
        .route("/admin/nodes", get(admin::nodes))
        .route("/admin/iso", get(admin::iso_page))
        .route("/admin/iso/toggle", post(admin::iso_toggle))
        .route("/admin/bridges", get(admin::bridges_page))
        .route("/admin/bridges/toggle", post(admin::bridges_toggle))
        .route("/admin/storages", get(admin::storages_page))
        .route("/admin/storages/toggle", post(admin::storages_toggle))
        .route("/admin/tags", get(admin::tags_page))
        .route("/admin/tags/add", post(admin::tags_add))
        .route("/admin/tags/delete", post(admin::tags_delete))
        .route("/admin/limits", get(admin::limits_page).post(admin::limits_submit))
        .nest_service("/css", ServeDir::new("static/css"))
        .nest_service("/js", ServeDir::new("static/js"))
        .nest_service("/webfonts", ServeDir::new("static/webfonts"))
        .route_service("/favicon.ico", ServeFile::new("static/favicon.ico"))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(from_fn_with_state(state.clone(), session_layer))
                .layer(from_fn_with_state(state.clone(), rate_limit_layer))
                .layer(from_fn_with_state(state.clone(), status_layer))
                .layer(from_fn_with_state(state.clone(), error_page_layer))
                .layer(from_fn_with_state(state.clone(), csrf_layer))
                .layer(from_fn_with_state(state.clone(), security_headers_layer))
                .layer(axum::middleware::from_fn(trailing_slash_layer))
                .layer(CatchPanicLayer::custom(render_panic)),
        )
        .with_state(state)
}

/// Context builder shared by every rendered page: locale strings, session
/// facts, the upstream status banner, the CSRF token, and drained flash
/// values.
pub(crate) struct Page {
    template_data: serde_json::Map<String, serde_json::Value>,
}

impl Page {
    pub fn new(
        state: &AppState,
        locale: &Locale,
        session: Option<&CurrentSession>,
        csrf: Option<&CsrfToken>,
        status: Option<&UpstreamStatusExt>,
    ) -> Self {
        let mut template_data = serde_json::Map::new();
        template_data.insert("locale".into(), locale.0.clone().into());
        template_data.insert(
            "strings".into(),
            serde_json::to_value(state.i18n.catalog(&locale.0)).unwrap_or_default(),
        );
        if let Some(csrf) = csrf {
            template_data.insert("csrf_token".into(), csrf.0.clone().into());
        }
        let (authenticated, is_admin, username) = session
            .map(|s| {
                (
                    s.data.authenticated,
                    s.data.is_admin,
                    s.data.username.clone(),
                )
            })
            .unwrap_or((false, false, None));
        template_data.insert("authenticated".into(), authenticated.into());
        template_data.insert("is_admin".into(), is_admin.into());
        if let Some(username) = username {
            template_data.insert("username".into(), username.into());
        }
        let status_value = match status {
            Some(UpstreamStatusExt(s)) => serde_json::json!({
                "connected": s.connected,
                "read_only": s.read_only,
                "last_error": s.last_error,
            }),
            None => serde_json::json!({"connected": true, "read_only": false}),
        };
        template_data.insert("status".into(), status_value);

        let flash = session
            .map(|s| take_flash(state, &s.token))
            .unwrap_or_default();
        template_data.insert(
            "flash".into(),
            serde_json::to_value(flash).unwrap_or_default(),
        );
        Self { template_data }
    }

    pub fn insert(&mut self, key: &str, value: impl serde::Serialize) -> &mut Self {
        self.template_data.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or_default(),
        );
        self
    }

    pub fn render(self, state: &AppState, template: &str) -> ApiResult<Html<String>> {
        let html = state
            .renderer
            .page(template, &serde_json::Value::Object(self.template_data))?;
        Ok(Html(html))
    }
}

/// Drains the session's flash map.
pub(crate) fn take_flash(state: &AppState, token: &str) -> HashMap<String, String> {
    match state.sessions.get(token) {
        Some(mut data) => {
            let flash = data.take_flash();
            if !flash.is_empty() {
                state.sessions.set(token, data);
            }
            flash
        }
        None => HashMap::new(),
    }
}

/// Stores a one-shot flash value for the next rendered page.
pub(crate) fn put_flash(state: &AppState, token: &str, key: &str, message: impl Into<String>) {
    if let Some(mut data) = state.sessions.get(token) {
        data.flash.insert(key.to_string(), message.into());
        state.sessions.set(token, data);
    }
}

async fn landing(
    State(state): State<AppState>,
    locale: Locale,
    session: CurrentSession,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(
        &state,
        &locale,
        Some(&session),
        csrf.as_deref(),
        status.as_deref(),
    )
    .render(&state, "landing")
}

/// Liveness endpoint; bypasses sessions entirely.
async fn health() -> &'static str {
    "OK"
}

async fn not_found(
    State(state): State<AppState>,
    locale: Locale,
    session: Option<CurrentSession>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> Response {
    let mut page = Page::new(&state, &locale, session.as_ref(), None, status.as_deref());
    page.insert("code", 404)
        .insert("message", state.i18n.t(&locale.0, "error.404"));
    match page.render(&state, "error") {
        Ok(html) => (StatusCode::NOT_FOUND, html).into_response(),
        Err(e) => e.into_response(),
    }
}

fn render_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::http::Response<axum::body::Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(%detail, "request handler panicked");
    let body = include_str!("../../templates/panic.html");
    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(axum::body::Body::from(body))
        .expect("static panic response")
}
