use axum::body::Bytes;
use axum::extract::State;
use axum::response::Html;
use axum::Extension;
use pvmss_core::MANDATORY_TAG;
use pvmss_proxmox::{ApiResponse, ClusterResource, PoolData};

use crate::error::ApiResult;
use crate::forms::FormFields;
use crate::i18n::Locale;
use crate::middleware::{CsrfToken, RequireAuth, UpstreamStatusExt};
use crate::routes::vm::{cluster_vms, view_from, VmView};
use crate::routes::Page;
use crate::state::AppState;

const RESULT_CAP: usize = 20;

/// Substring match on the decimal VMID and case-insensitive substring on
/// the name; criteria that are present must all hold.
pub(crate) fn matches(
    vm: &ClusterResource,
    vmid_query: Option<&str>,
    name_query: Option<&str>,
) -> bool {
    if let Some(fragment) = vmid_query {
        let decimal = vm.vmid.map(|id| id.to_string()).unwrap_or_default();
        if !decimal.contains(fragment) {
            return false;
        }
    }
    if let Some(fragment) = name_query {
        let name = vm.name.as_deref().unwrap_or_default().to_lowercase();
        if !name.contains(&fragment.to_lowercase()) {
            return false;
        }
    }
    true
}

fn searchable(vm: &ClusterResource) -> bool {
    vm.is_qemu() && !vm.is_template() && vm.has_tag(MANDATORY_TAG)
}

pub async fn page(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref())
        .render(&state, "search")
}

pub async fn submit(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    status: Option<Extension<UpstreamStatusExt>>,
    body: Bytes,
) -> ApiResult<Html<String>> {
    let form = FormFields::parse(&body);
    let vmid_query = form.first("vmid").map(str::to_string);
    let name_query = form.first("name").map(str::to_string);

    let mut page = Page::new(&state, &locale, Some(&session.0), None, status.as_deref());
    page.insert(
        "form",
        serde_json::json!({"vmid": vmid_query, "name": name_query}),
    );

    if vmid_query.is_none() && name_query.is_none() {
        page.insert("searched", false).insert(
            "flash",
            serde_json::json!({"error": state.i18n.t(&locale.0, "search.criteria_required")}),
        );
        return page.render(&state, "search");
    }

    // Read-only window: no upstream calls; the offline banner explains the
    // empty result.
    if status.as_deref().map(|s| s.0.read_only).unwrap_or(false) {
        page.insert("searched", true).insert("vms", Vec::<VmView>::new());
        return page.render(&state, "search");
    }

    let vms = cluster_vms(&state).await?;
    let results: Vec<_> = vms
        .iter()
        .filter(|vm| searchable(vm))
        .filter(|vm| matches(vm, vmid_query.as_deref(), name_query.as_deref()))
        .take(RESULT_CAP)
        .map(|vm| view_from(vm, None))
        .collect();

    page.insert("searched", true).insert("vms", results);
    page.render(&state, "search")
}

/// The profile listing uses pool membership rather than tag filtering.
pub async fn profile(
    State(state): State<AppState>,
    locale: Locale,
    session: RequireAuth,
    csrf: Option<Extension<CsrfToken>>,
    status: Option<Extension<UpstreamStatusExt>>,
) -> ApiResult<Html<String>> {
    let username = session.0.username().unwrap_or_default().to_string();
    let pool = AppState::pool_for(&username);

    if status.as_deref().map(|s| s.0.read_only).unwrap_or(false) {
        let mut page =
            Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
        page.insert("vms", Vec::<VmView>::new());
        return page.render(&state, "profile");
    }

    let members = match state
        .proxmox
        .get_json::<ApiResponse<PoolData>>(&format!("/pools/{}", pool))
        .await
    {
        Ok(listing) => listing.data.unwrap_or_default().members,
        // A user who never created a VM has no pool yet; show it empty.
        Err(e) if e.upstream_status() == Some(404) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let vms: Vec<_> = members
        .iter()
        .filter(|vm| vm.is_qemu() && !vm.is_template())
        .map(|vm| view_from(vm, None))
        .collect();

    let mut page = Page::new(&state, &locale, Some(&session.0), csrf.as_deref(), status.as_deref());
    page.insert("vms", vms);
    page.render(&state, "profile")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(vmid: u64, name: &str, tags: &str) -> ClusterResource {
        ClusterResource {
            kind: "qemu".into(),
            vmid: Some(vmid),
            name: Some(name.into()),
            tags: Some(tags.into()),
            ..ClusterResource::default()
        }
    }

    #[test]
    fn vmid_substring_semantics() {
        // "10" matches 10, 100, 210 but not 1 or 20.
        for (id, expected) in [(10, true), (100, true), (210, true), (1, false), (20, false)] {
            assert_eq!(
                matches(&vm(id, "x", "pvmss"), Some("10"), None),
                expected,
                "vmid {}",
                id
            );
        }
    }

    #[test]
    fn name_match_is_case_insensitive() {
        let resource = vm(42, "Web-Frontend", "pvmss");
        assert!(matches(&resource, None, Some("web")));
        assert!(matches(&resource, None, Some("FRONT")));
        assert!(!matches(&resource, None, Some("db")));
    }

    #[test]
    fn both_criteria_must_hold() {
        let resource = vm(101, "web-1", "pvmss");
        assert!(matches(&resource, Some("10"), Some("web")));
        assert!(!matches(&resource, Some("10"), Some("db")));
    }

    #[test]
    fn only_tagged_qemu_is_searchable() {
        assert!(searchable(&vm(1, "a", "pvmss;web")));
        assert!(!searchable(&vm(1, "a", "web")));
        let mut template = vm(1, "a", "pvmss");
        template.template = Some(1);
        assert!(!searchable(&template));
        let mut lxc = vm(1, "a", "pvmss");
        lxc.kind = "lxc".into();
        assert!(!searchable(&lxc));
    }
}
