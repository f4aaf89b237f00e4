use std::collections::BTreeSet;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Extension;
use pvmss_core::{NodeLimits, Settings, VmLimits, MANDATORY_TAG};
use pvmss_proxmox::{
    join_tags, ApiResponse, ClusterResource, NodeItem, VmConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::forms::FormFields;
use crate::i18n::Locale;
use crate::middleware::{CsrfToken, RequireAuth, UpstreamStatusExt};
use crate::routes::{put_flash, Page};
use crate::state::AppState;

const VM_ACTIONS: &[&str] = &["start", "stop", "shutdown", "reset", "reboot"];
const ACTION_TIMEOUT: Duration = Duration::from_secs(15);
const DELETE_SETTLE: Duration = Duration::from_secs(2);

/// Template-facing projection of a VM, derived per request and never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct VmView {
    pub vmid: u64,
    pub node: String,
    pub name: String,
    pub status: String,
    pub running: bool,
    pub uptime: String,
    pub cpu_percent: u64,
    pub mem_mb: u64,
    pub maxmem_mb: u64,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

pub(crate) fn view_from(resource: &ClusterResource, config: Option<&VmConfig>) -> VmView {
    let status = match resource.status.as_deref() {
        Some("running") => "running",
        Some("stopped") => "stopped",
        Some("paused") => "paused",
        _ => "unknown",
    };
    let tags = match config {
        Some(config) if config.tags.is_some() => config.tag_list(),
        _ => resource.tag_list(),
    };
    VmView {
        vmid: resource.vmid.unwrap_or(0),
        node: resource.node.clone().unwrap_or_default(),
        name: resource
            .name
            .clone()
            .or_else(|| config.and_then(|c| c.name.clone()))
            .unwrap_or_default(),
        status: status.to_string(),
        running: status == "running",
        uptime: format_uptime(resource.uptime),
        cpu_percent: (resource.cpu * 100.0).round() as u64,
        mem_mb: resource.mem / (1024 * 1024),
        maxmem_mb: resource.maxmem / (1024 * 1024),
        tags,
        description: config.and_then(|c| c.description.clone()),
    }
}

pub(crate) fn format_uptime(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// Single cluster-wide VM listing, shared by details, search and the
/// aggregate validator. Served from the client cache within its TTL.
pub(crate) async fn cluster_vms(state: &AppState) -> ApiResult<Vec<ClusterResource>> {
    let response: ApiResponse<Vec<ClusterResource>> = state
        .proxmox
        .get_json("/cluster/resources?type=vm")
        .await?;
    Ok(response.data.unwrap_or_default())
}

pub(crate) fn find_vm(vms: &[ClusterResource], vmid: u64) -> Option<&ClusterResource> {
    vms.iter()
        .find(|vm| vm.is_qemu() && vm.vmid == Some(vmid))
}

/// Users are confined to their own pool; admins see everything.
pub(crate) fn ensure_vm_access(
    state: &AppState,
    session: &RequireAuth,
    resource: &ClusterResource,
    locale: &Locale,
) -> Result<(), ApiError> {
    if session.0.data.is_admin {
        return Ok(());
    }
    let username = session.0.username().unwrap_or_default();
    let owned = resource.pool.as_deref() == Some(AppState::pool_for(username).as_str());
    if owned {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            state.i18n.t(&locale.0, "error.vm_access"),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct DetailsQuery {
    pub refresh: Option<String>,
}

pub async fn details(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
    Path(vmid): Path<u64>,
    Query(query): Query<DetailsQuery>,
) -> ApiResult<Response> {
    let read_only = status
        .as_deref()
        .map(|UpstreamStatusExt(s)| s.read_only)
        .unwrap_or(false);
    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());

    if read_only {
        // Placeholder view: no upstream calls while offline.
        page.insert("offline", true).insert(
            "vm",
            VmView {
                vmid,
                node: String::new(),
                name: String::new(),
                status: "unknown".into(),
                running: false,
                uptime: "-".into(),
                cpu_percent: 0,
                mem_mb: 0,
                maxmem_mb: 0,
                tags: Vec::new(),
                description: None,
            },
        );
        return Ok(page.render(&state, "vm_details")?.into_response());
    }

    if query.refresh.is_some() {
        state.proxmox.invalidate_cache("/cluster/resources");
    }

    let vms = cluster_vms(&state).await?;
    let resource = find_vm(&vms, vmid).cloned().ok_or(ApiError::NotFound)?;
    ensure_vm_access(&state, &session, &resource, &locale)?;

    let node = resource.node.clone().unwrap_or_default();
    if query.refresh.is_some() {
        state
            .proxmox
            .invalidate_cache(&format!("/nodes/{}/qemu/{}", node, vmid));
    }
    let config: VmConfig = state
        .proxmox
        .get_json::<ApiResponse<VmConfig>>(&format!("/nodes/{}/qemu/{}/config", node, vmid))
        .await?
        .data
        .unwrap_or_default();

    let settings = state.settings.get();
    page.insert("vm", view_from(&resource, Some(&config)))
        .insert("actions", VM_ACTIONS)
        .insert("available_tags", &settings.tags);
    Ok(page.render(&state, "vm_details")?.into_response())
}

pub async fn create_page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let settings = state.settings.get();
    let read_only = status
        .as_deref()
        .map(|UpstreamStatusExt(s)| s.read_only)
        .unwrap_or(false);
    let nodes: Vec<String> = if read_only {
        settings.limits.nodes.keys().cloned().collect()
    } else {
        let listed: ApiResponse<Vec<NodeItem>> = state.proxmox.get_json("/nodes").await?;
        listed
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|n| n.node)
            .collect()
    };

    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    page.insert("nodes", nodes)
        .insert("isos", &settings.isos)
        .insert("bridges", &settings.vmbrs)
        .insert("storages", &settings.enabled_storages)
        .insert("tags", &settings.tags)
        .insert("limits", &settings.limits);
    page.render(&state, "vm_create")
}

#[derive(Debug, PartialEq)]
pub(crate) struct CreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub vmid: Option<u64>,
    pub sockets: u64,
    pub cores: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub iso: String,
    pub bridge: String,
    pub node: String,
    pub storage: String,
    pub pool: Option<String>,
    pub tags: Vec<String>,
}

pub(crate) fn parse_create(form: &FormFields) -> Result<CreateRequest, String> {
    Ok(CreateRequest {
        name: form.require("name")?.to_string(),
        description: form.first("description").map(str::to_string),
        vmid: match form.first("vmid") {
            None => None,
            Some(raw) => Some(raw.parse().map_err(|_| "invalid value for vmid".to_string())?),
        },
        sockets: form.parsed("sockets")?,
        cores: form.parsed("cores")?,
        memory_mb: form.parsed("memory")?,
        disk_gb: form.parsed("disk_size")?,
        iso: form.require("iso")?.to_string(),
        bridge: form.require("bridge")?.to_string(),
        node: form.require("node")?.to_string(),
        storage: form.require("storage")?.to_string(),
        pool: form.first("pool").map(str::to_string),
        tags: form.all("tags").into_iter().map(str::to_string).collect(),
    })
}

pub(crate) fn valid_vm_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Per-VM window validation. `ram`/`disk` limits are in GB.
pub(crate) fn check_vm_bounds(limits: &VmLimits, request: &CreateRequest) -> Result<(), String> {
    let ram_gb = request.memory_mb.div_ceil(1024);
    for (label, value, bounds) in [
        ("sockets", request.sockets, &limits.sockets),
        ("cores", request.cores, &limits.cores),
        ("ram", ram_gb, &limits.ram),
        ("disk", request.disk_gb, &limits.disk),
    ] {
        if !bounds.contains(value) {
            return Err(format!(
                "{} must be between {} and {}",
                label, bounds.min, bounds.max
            ));
        }
    }
    Ok(())
}

/// Declared resources of the portal-managed VMs already on a node.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct NodeUsage {
    pub sockets: u64,
    pub cores: u64,
    pub ram_mb: u64,
}

impl NodeUsage {
    pub fn add_config(&mut self, config: &VmConfig) {
        self.sockets += config.sockets.unwrap_or(1);
        self.cores += config.cores.unwrap_or(1);
        self.ram_mb += config.memory.unwrap_or(0);
    }
}

/// The advisory aggregate cap: existing + candidate must stay under the
/// node limits. Caps are declared in GB of RAM; usage is tracked in MB.
pub(crate) fn check_aggregate(
    caps: &NodeLimits,
    node: &str,
    existing: NodeUsage,
    candidate: NodeUsage,
) -> Result<(), String> {
    if existing.sockets + candidate.sockets > caps.sockets {
        return Err(format!("sockets exceed node '{}' max", node));
    }
    if existing.cores + candidate.cores > caps.cores {
        return Err(format!("cores exceed node '{}' max", node));
    }
    if existing.ram_mb + candidate.ram_mb > caps.ram * 1024 {
        return Err(format!("ram exceeds node '{}' max", node));
    }
    Ok(())
}

fn check_catalogue(settings: &Settings, request: &CreateRequest) -> Result<(), String> {
    if !settings.isos.contains(&request.iso) {
        return Err("iso is not enabled".to_string());
    }
    if !settings.vmbrs.contains(&request.bridge) {
        return Err("bridge is not enabled".to_string());
    }
    if !settings.enabled_storages.contains(&request.storage) {
        return Err("storage is not enabled".to_string());
    }
    Ok(())
}

async fn node_usage(state: &AppState, node: &str) -> ApiResult<NodeUsage> {
    let vms = cluster_vms(state).await?;
    let mut usage = NodeUsage::default();
    for vm in vms.iter().filter(|vm| {
        vm.is_qemu()
            && !vm.is_template()
            && vm.node.as_deref() == Some(node)
            && vm.has_tag(MANDATORY_TAG)
    }) {
        let Some(vmid) = vm.vmid else { continue };
        let config: ApiResponse<VmConfig> = state
            .proxmox
            .get_json(&format!("/nodes/{}/qemu/{}/config", node, vmid))
            .await?;
        if let Some(config) = config.data {
            usage.add_config(&config);
        }
    }
    Ok(usage)
}

pub async fn create_submit(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    status: Option<Extension<UpstreamStatusExt>>,
    body: Bytes,
) -> ApiResult<Response> {
    if status
        .as_deref()
        .map(|UpstreamStatusExt(s)| s.read_only)
        .unwrap_or(false)
    {
        return Err(ApiError::ReadOnly);
    }

    let form = FormFields::parse(&body);
    let mut request = parse_create(&form).map_err(ApiError::BadRequest)?;
    if !valid_vm_name(&request.name) {
        return Err(ApiError::BadRequest(
            state.i18n.t(&locale.0, "error.name_invalid"),
        ));
    }

    let settings = state.settings.get();
    check_catalogue(&settings, &request).map_err(ApiError::BadRequest)?;
    check_vm_bounds(&settings.limits.vm, &request).map_err(ApiError::BadRequest)?;

    // Node must exist upstream.
    let nodes: ApiResponse<Vec<NodeItem>> = state.proxmox.get_json("/nodes").await?;
    let known = nodes
        .data
        .unwrap_or_default()
        .iter()
        .any(|n| n.node == request.node);
    if !known {
        return Err(ApiError::BadRequest(
            state.i18n.t(&locale.0, "error.node_unknown"),
        ));
    }

    if let Some(caps) = settings.limits.nodes.get(&request.node) {
        let existing = node_usage(&state, &request.node).await?;
        let candidate = NodeUsage {
            sockets: request.sockets,
            cores: request.cores,
            ram_mb: request.memory_mb,
        };
        check_aggregate(caps, &request.node, existing, candidate).map_err(ApiError::BadRequest)?;
    }

    let username = session.0.username().unwrap_or_default().to_string();
    let pool = request
        .pool
        .clone()
        .unwrap_or_else(|| AppState::pool_for(&username));

    let vmid = match request.vmid {
        Some(vmid) => vmid,
        None => {
            let next: ApiResponse<serde_json::Value> =
                state.proxmox.get_json_uncached("/cluster/nextid").await?;
            next.data
                .and_then(|v| match v {
                    serde_json::Value::String(s) => s.parse().ok(),
                    serde_json::Value::Number(n) => n.as_u64(),
                    _ => None,
                })
                .ok_or_else(|| ApiError::Internal("cluster/nextid returned no id".into()))?
        }
    };

    // The mandatory tag is silently re-inserted.
    let mut tags: Vec<String> = vec![MANDATORY_TAG.to_string()];
    tags.extend(request.tags.drain(..));
    let tags = join_tags(tags);

    let mut create_form = vec![
        ("vmid", vmid.to_string()),
        ("name", request.name.clone()),
        ("sockets", request.sockets.to_string()),
        ("cores", request.cores.to_string()),
        ("memory", request.memory_mb.to_string()),
        ("net0", format!("virtio,bridge={},firewall=1", request.bridge)),
        ("scsihw", "virtio-scsi-pci".to_string()),
        ("scsi0", format!("{}:{}", request.storage, request.disk_gb)),
        ("ide2", format!("{},media=cdrom", request.iso)),
        ("boot", "order=scsi0;ide2".to_string()),
        ("ostype", "l26".to_string()),
        ("pool", pool.clone()),
        ("tags", tags),
    ];
    if let Some(description) = &request.description {
        create_form.push(("description", description.clone()));
    }

    state
        .proxmox
        .post_form_with_timeout(
            &format!("/nodes/{}/qemu", request.node),
            &create_form,
            ACTION_TIMEOUT,
        )
        .await?;
    info!(vmid, node = %request.node, user = %username, "vm created");

    state.proxmox.invalidate_cache("/cluster/resources");
    state.proxmox.invalidate_cache(&format!("/pools/{}", pool));

    // Auto-start; a failure here leaves the VM in place with a warning.
    let start = state
        .proxmox
        .post_form_with_timeout(
            &format!("/nodes/{}/qemu/{}/status/start", request.node, vmid),
            &[],
            ACTION_TIMEOUT,
        )
        .await;
    match start {
        Ok(_) => put_flash(
            &state,
            &session.0.token,
            "notice",
            state.i18n.t(&locale.0, "vm.created"),
        ),
        Err(e) => {
            warn!(vmid, error = %e, "vm created but failed to start");
            put_flash(
                &state,
                &session.0.token,
                "warning",
                state.i18n.t(&locale.0, "vm.create.start_failed"),
            );
        }
    }

    Ok(Redirect::to(&format!("/vm/details/{}?refresh=1", vmid)).into_response())
}

pub async fn action(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    status: Option<Extension<UpstreamStatusExt>>,
    body: Bytes,
) -> ApiResult<Response> {
    if status
        .as_deref()
        .map(|UpstreamStatusExt(s)| s.read_only)
        .unwrap_or(false)
    {
        return Err(ApiError::ReadOnly);
    }

    let form = FormFields::parse(&body);
    let vmid: u64 = form.parsed("vmid").map_err(ApiError::BadRequest)?;
    let node = form.require("node").map_err(ApiError::BadRequest)?.to_string();
    let action = form.require("action").map_err(ApiError::BadRequest)?.to_string();
    if !VM_ACTIONS.contains(&action.as_str()) {
        return Err(ApiError::BadRequest(format!("unknown action {}", action)));
    }

    let vms = cluster_vms(&state).await?;
    let resource = find_vm(&vms, vmid).cloned().ok_or(ApiError::NotFound)?;
    ensure_vm_access(&state, &session, &resource, &locale)?;

    state
        .proxmox
        .post_form_with_timeout(
            &format!("/nodes/{}/qemu/{}/status/{}", node, vmid, action),
            &[],
            ACTION_TIMEOUT,
        )
        .await?;
    info!(vmid, %action, "vm action issued");

    state
        .proxmox
        .invalidate_cache(&format!("/nodes/{}/qemu/{}/status/current", node, vmid));
    if let Some(pool) = &resource.pool {
        state.proxmox.invalidate_cache(&format!("/pools/{}", pool));
    }
    state.proxmox.invalidate_cache("/cluster/resources");

    Ok(Redirect::to(&format!("/vm/details/{}?refresh=1", vmid)).into_response())
}

pub async fn update_description(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let vmid: u64 = form.parsed("vmid").map_err(ApiError::BadRequest)?;
    let node = form.require("node").map_err(ApiError::BadRequest)?.to_string();
    let description = form.first("description").unwrap_or_default().to_string();

    let vms = cluster_vms(&state).await?;
    let resource = find_vm(&vms, vmid).cloned().ok_or(ApiError::NotFound)?;
    ensure_vm_access(&state, &session, &resource, &locale)?;

    state
        .proxmox
        .put_form(
            &format!("/nodes/{}/qemu/{}/config", node, vmid),
            &[("description", description)],
        )
        .await?;
    Ok(Redirect::to(&format!("/vm/details/{}?refresh=1", vmid)).into_response())
}

pub async fn update_tags(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let vmid: u64 = form.parsed("vmid").map_err(ApiError::BadRequest)?;
    let node = form.require("node").map_err(ApiError::BadRequest)?.to_string();

    let vms = cluster_vms(&state).await?;
    let resource = find_vm(&vms, vmid).cloned().ok_or(ApiError::NotFound)?;
    ensure_vm_access(&state, &session, &resource, &locale)?;

    // Only catalogued tags are accepted; the mandatory tag is re-inserted.
    let settings = state.settings.get();
    let chosen: BTreeSet<String> = form
        .all("tags")
        .into_iter()
        .filter(|t| settings.tags.contains(*t))
        .map(str::to_string)
        .collect();
    let mut tags: Vec<String> = vec![MANDATORY_TAG.to_string()];
    tags.extend(chosen);
    let tags = join_tags(tags);

    state
        .proxmox
        .put_form(
            &format!("/nodes/{}/qemu/{}/config", node, vmid),
            &[("tags", tags)],
        )
        .await?;
    Ok(Redirect::to(&format!("/vm/details/{}?refresh=1", vmid)).into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    body: Bytes,
) -> ApiResult<Response> {
    let form = FormFields::parse(&body);
    let vmid: u64 = form.parsed("vmid").map_err(ApiError::BadRequest)?;
    let node = form.require("node").map_err(ApiError::BadRequest)?.to_string();

    let vms = cluster_vms(&state).await?;
    let resource = find_vm(&vms, vmid).cloned().ok_or(ApiError::NotFound)?;
    ensure_vm_access(&state, &session, &resource, &locale)?;

    // Force-stop first; an already-stopped VM fails this harmlessly.
    if let Err(e) = state
        .proxmox
        .post_form_with_timeout(
            &format!("/nodes/{}/qemu/{}/status/stop", node, vmid),
            &[],
            ACTION_TIMEOUT,
        )
        .await
    {
        info!(vmid, error = %e, "pre-delete stop failed (likely already stopped)");
    }
    tokio::time::sleep(DELETE_SETTLE).await;

    state
        .proxmox
        .delete(&format!("/nodes/{}/qemu/{}", node, vmid))
        .await?;
    info!(vmid, node = %node, "vm deleted");

    state.proxmox.invalidate_cache("/cluster/resources");
    if let Some(pool) = &resource.pool {
        state.proxmox.invalidate_cache(&format!("/pools/{}", pool));
    }

    put_flash(
        &state,
        &session.0.token,
        "notice",
        state.i18n.t(&locale.0, "vm.deleted"),
    );
    Ok(Redirect::to("/search").into_response())
}
