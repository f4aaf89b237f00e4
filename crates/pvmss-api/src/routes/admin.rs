use std::collections::BTreeSet;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Extension;
use pvmss_core::{Bounds, NodeLimits, MANDATORY_TAG};
use pvmss_proxmox::{ApiResponse, NetworkInterface, NodeItem, StorageContent, StorageItem};
use serde_json::json;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::forms::FormFields;
use crate::i18n::Locale;
use crate::middleware::{CsrfToken, RequireAdmin, UpstreamStatusExt};
use crate::routes::vm::format_uptime;
use crate::routes::{put_flash, Page};
use crate::state::AppState;

pub async fn dashboard(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref())
        .render(&state, "admin")
}

pub async fn nodes(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    let nodes = match upstream_nodes(&state).await {
        Ok(nodes) => nodes,
        Err(e) => {
            // Admin pages surface the raw upstream error for diagnosis.
            page.insert("flash", json!({"error": e.to_string()}));
            Vec::new()
        }
    };
    let rows: Vec<_> = nodes
        .iter()
        .map(|n| {
            json!({
                "node": n.node,
                "status": n.status.clone().unwrap_or_else(|| "unknown".into()),
                "cpu_percent": (n.cpu * 100.0).round() as u64,
                "mem_gb": n.mem / (1024 * 1024 * 1024),
                "maxmem_gb": n.maxmem / (1024 * 1024 * 1024),
                "uptime": format_uptime(n.uptime),
            })
        })
        .collect();
    page.insert("nodes", rows);
    page.render(&state, "admin_nodes")
}

pub async fn iso_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    let known = match iso_volids(&state).await {
        Ok(volids) => volids,
        Err(e) => {
            page.insert("flash", json!({"error": e.to_string()}));
            BTreeSet::new()
        }
    };
    let settings = state.settings.get();
    // Enabled entries that vanished upstream stay listed so they can be
    // disabled.
    let all: BTreeSet<String> = known.union(&settings.isos).cloned().collect();
    page.insert("title", state.i18n.t(&locale.0, "admin.isos"))
        .insert("field", "volid")
        .insert("toggle_action", "/admin/iso/toggle")
        .insert("items", catalogue_items(&all, &settings.isos, None));
    page.render(&state, "admin_catalogue")
}

pub async fn iso_toggle(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let (volid, action) = match toggle_fields(&form, "volid") {
        Ok(pair) => pair,
        Err(message) => return Ok(flash_error(&state, &session, "/admin/iso", message)),
    };

    let mut settings = (*state.settings.get()).clone();
    if let Err(message) = apply_toggle(&mut settings.isos, &volid, &action) {
        return Ok(flash_error(&state, &session, "/admin/iso", message));
    }
    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/iso").into_response())
}

pub async fn bridges_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    let known = match bridge_names(&state).await {
        Ok(names) => names,
        Err(e) => {
            page.insert("flash", json!({"error": e.to_string()}));
            BTreeSet::new()
        }
    };
    let settings = state.settings.get();
    let all: BTreeSet<String> = known.union(&settings.vmbrs).cloned().collect();
    page.insert("title", state.i18n.t(&locale.0, "admin.bridges"))
        .insert("field", "vmbr")
        .insert("toggle_action", "/admin/bridges/toggle")
        .insert("items", catalogue_items(&all, &settings.vmbrs, None));
    page.render(&state, "admin_catalogue")
}

pub async fn bridges_toggle(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let (vmbr, action) = match toggle_fields(&form, "vmbr") {
        Ok(pair) => pair,
        Err(message) => return Ok(flash_error(&state, &session, "/admin/bridges", message)),
    };

    let mut settings = (*state.settings.get()).clone();
    if let Err(message) = apply_toggle(&mut settings.vmbrs, &vmbr, &action) {
        return Ok(flash_error(&state, &session, "/admin/bridges", message));
    }
    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/bridges").into_response())
}

pub async fn storages_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    let discovered = match image_storages(&state).await {
        Ok(storages) => storages,
        Err(e) => {
            page.insert("flash", json!({"error": e.to_string()}));
            BTreeSet::new()
        }
    };
    let settings = state.settings.get();
    if !discovered.is_empty() && discovered != settings.storages {
        // Mirror discovery into the snapshot; the admin's enable choices
        // live in enabled_storages and are persisted on toggle.
        let mut refreshed = (*settings).clone();
        refreshed.storages = discovered.clone();
        state.settings.set_without_save(refreshed);
    }
    let all: BTreeSet<String> = discovered.union(&settings.enabled_storages).cloned().collect();
    page.insert("title", state.i18n.t(&locale.0, "admin.storages"))
        .insert("field", "storage")
        .insert("toggle_action", "/admin/storages/toggle")
        .insert("items", catalogue_items(&all, &settings.enabled_storages, None));
    page.render(&state, "admin_catalogue")
}

pub async fn storages_toggle(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let (storage, action) = match toggle_fields(&form, "storage") {
        Ok(pair) => pair,
        Err(message) => return Ok(flash_error(&state, &session, "/admin/storages", message)),
    };

    let mut settings = (*state.settings.get()).clone();
    if let Err(message) = apply_toggle(&mut settings.enabled_storages, &storage, &action) {
        return Ok(flash_error(&state, &session, "/admin/storages", message));
    }
    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/storages").into_response())
}

pub async fn tags_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let settings = state.settings.get();
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    page.insert("title", state.i18n.t(&locale.0, "admin.tags"))
        .insert("field", "tag")
        .insert("add_action", "/admin/tags/add")
        .insert("toggle_action", "/admin/tags/delete")
        .insert(
            "items",
            catalogue_items(&settings.tags, &settings.tags, Some(MANDATORY_TAG)),
        );
    page.render(&state, "admin_catalogue")
}

pub async fn tags_add(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let tag = match form.require("tag") {
        Ok(tag) => tag.to_string(),
        Err(message) => return Ok(flash_error(&state, &session, "/admin/tags", message)),
    };
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        // Preserve the rejected input so the form re-renders with it.
        put_flash(&state, &session.0.token, "tag", tag);
        return Ok(flash_error(
            &state,
            &session,
            "/admin/tags",
            state.i18n.t(&locale.0, "error.name_invalid"),
        ));
    }

    let mut settings = (*state.settings.get()).clone();
    settings.tags.insert(tag);
    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/tags").into_response())
}

pub async fn tags_delete(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let tag = match form.require("tag") {
        Ok(tag) => tag.to_string(),
        Err(message) => return Ok(flash_error(&state, &session, "/admin/tags", message)),
    };

    // The mandatory tag is not deletable; normalization would re-insert it
    // anyway.
    let mut settings = (*state.settings.get()).clone();
    if tag != MANDATORY_TAG {
        settings.tags.remove(&tag);
    }
    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/tags").into_response())
}

pub async fn limits_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let settings = state.settings.get();
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());

    // Offer limit rows for every upstream node, seeded with stored caps.
    let mut node_names: BTreeSet<String> = settings.limits.nodes.keys().cloned().collect();
    if let Ok(nodes) = upstream_nodes(&state).await {
        node_names.extend(nodes.into_iter().map(|n| n.node));
    }
    let node_limits: Vec<_> = node_names
        .iter()
        .map(|name| {
            let caps = settings.limits.nodes.get(name).cloned().unwrap_or(NodeLimits {
                sockets: 1,
                cores: 1,
                ram: 1,
            });
            json!({"name": name, "sockets": caps.sockets, "cores": caps.cores, "ram": caps.ram})
        })
        .collect();

    page.insert("limits", &settings.limits)
        .insert("node_limits", node_limits);
    page.render(&state, "admin_limits")
}

pub async fn limits_submit(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAdmin,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let entity = match form.require("entityId") {
        Ok(entity) => entity.to_string(),
        Err(message) => return Ok(flash_error(&state, &session, "/admin/limits", message)),
    };

    let mut settings = (*state.settings.get()).clone();
    let updated = match entity.as_str() {
        "vm" => {
            let current = settings.limits.vm.clone();
            vm_limits_from(&form, &current).map(|limits| settings.limits.vm = limits)
        }
        "node" => node_limits_from(&form, &settings.limits.nodes)
            .map(|(name, caps)| {
                settings.limits.nodes.insert(name, caps);
            }),
        // Only the two catalogued entities exist; anything else is an
        // unknown admin resource, not a malformed form.
        _ => return Err(ApiError::NotFound),
    };
    if let Err(message) = updated {
        return Ok(flash_error(&state, &session, "/admin/limits", message));
    }

    save(&state, &locale, &session, settings).await?;
    Ok(Redirect::to("/admin/limits").into_response())
}

fn vm_limits_from(form: &FormFields, current: &pvmss_core::VmLimits) -> Result<pvmss_core::VmLimits, String> {
    Ok(pvmss_core::VmLimits {
        sockets: bounds_from(form, "sockets", current.sockets)?,
        cores: bounds_from(form, "cores", current.cores)?,
        ram: bounds_from(form, "ram", current.ram)?,
        disk: bounds_from(form, "disk", current.disk)?,
    })
}

fn node_limits_from(
    form: &FormFields,
    nodes: &std::collections::BTreeMap<String, NodeLimits>,
) -> Result<(String, NodeLimits), String> {
    let name = form.require("nodeName")?.to_string();
    let current = nodes
        .get(&name)
        .cloned()
        .unwrap_or(NodeLimits { sockets: 1, cores: 1, ram: 1 });
    let caps = NodeLimits {
        sockets: form.parsed_or("sockets-max", current.sockets)?,
        cores: form.parsed_or("cores-max", current.cores)?,
        ram: form.parsed_or("ram-max", current.ram)?,
    };
    Ok((name, caps))
}

fn bounds_from(form: &FormFields, prefix: &str, current: Bounds) -> Result<Bounds, String> {
    Ok(Bounds::new(
        form.parsed_or(&format!("{}-min", prefix), current.min)?,
        form.parsed_or(&format!("{}-max", prefix), current.max)?,
    ))
}

/// Required field pair for the catalogue toggle forms.
fn toggle_fields(form: &FormFields, field: &str) -> Result<(String, String), String> {
    let id = form.require(field)?.to_string();
    let action = form.require("action")?.to_string();
    Ok((id, action))
}

/// The admin-page validation path: queue the flash error and bounce back
/// to the form, which re-renders with the message and any preserved
/// values.
fn flash_error(
    state: &AppState,
    session: &RequireAdmin,
    location: &str,
    message: impl Into<String>,
) -> Response {
    put_flash(state, &session.0.token, "error", message);
    Redirect::to(location).into_response()
}

/// Idempotent set toggle: enabling an enabled id and disabling an absent
/// one are no-ops.
pub(crate) fn apply_toggle(
    set: &mut BTreeSet<String>,
    id: &str,
    action: &str,
) -> Result<(), String> {
    match action {
        "enable" => {
            set.insert(id.to_string());
            Ok(())
        }
        "disable" => {
            set.remove(id);
            Ok(())
        }
        other => Err(format!("unknown action {}", other)),
    }
}

fn catalogue_items(
    all: &BTreeSet<String>,
    enabled: &BTreeSet<String>,
    locked: Option<&str>,
) -> Vec<serde_json::Value> {
    all.iter()
        .map(|id| {
            json!({
                "id": id,
                "enabled": enabled.contains(id),
                "locked": locked == Some(id.as_str()),
            })
        })
        .collect()
}

/// Normalizes (clamp, swap, mandatory tag) and persists, swapping the
/// snapshot atomically, then queues the success banner.
async fn save(
    state: &AppState,
    locale: &Locale,
    session: &RequireAdmin,
    mut settings: pvmss_core::Settings,
) -> ApiResult<()> {
    settings.normalize();
    state
        .settings
        .set(settings)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    info!("settings updated by admin");
    put_flash(
        state,
        &session.0.token,
        "notice",
        state.i18n.t(&locale.0, "admin.saved"),
    );
    Ok(())
}

async fn upstream_nodes(state: &AppState) -> ApiResult<Vec<NodeItem>> {
    let nodes: ApiResponse<Vec<NodeItem>> = state.proxmox.get_json("/nodes").await?;
    Ok(nodes.data.unwrap_or_default())
}

/// Volume ids of every ISO on every ISO-capable storage in the cluster.
async fn iso_volids(state: &AppState) -> ApiResult<BTreeSet<String>> {
    let mut volids = BTreeSet::new();
    for node in upstream_nodes(state).await? {
        let storages: ApiResponse<Vec<StorageItem>> = state
            .proxmox
            .get_json(&format!("/nodes/{}/storage", node.node))
            .await?;
        for storage in storages.data.unwrap_or_default() {
            if !storage.supports("iso") {
                continue;
            }
            let contents: ApiResponse<Vec<StorageContent>> = state
                .proxmox
                .get_json(&format!(
                    "/nodes/{}/storage/{}/content?content=iso",
                    node.node, storage.storage
                ))
                .await?;
            volids.extend(
                contents
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|c| c.volid),
            );
        }
    }
    Ok(volids)
}

async fn bridge_names(state: &AppState) -> ApiResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for node in upstream_nodes(state).await? {
        let interfaces: ApiResponse<Vec<NetworkInterface>> = state
            .proxmox
            .get_json(&format!("/nodes/{}/network", node.node))
            .await?;
        names.extend(
            interfaces
                .data
                .unwrap_or_default()
                .into_iter()
                .filter(NetworkInterface::is_bridge)
                .map(|i| i.iface),
        );
    }
    Ok(names)
}

/// Storages that can hold VM disk images, cluster-wide.
async fn image_storages(state: &AppState) -> ApiResult<BTreeSet<String>> {
    let mut storages_out = BTreeSet::new();
    for node in upstream_nodes(state).await? {
        let storages: ApiResponse<Vec<StorageItem>> = state
            .proxmox
            .get_json(&format!("/nodes/{}/storage", node.node))
            .await?;
        storages_out.extend(
            storages
                .data
                .unwrap_or_default()
                .into_iter()
                .filter(|s| s.supports("images"))
                .map(|s| s.storage),
        );
    }
    Ok(storages_out)
}
