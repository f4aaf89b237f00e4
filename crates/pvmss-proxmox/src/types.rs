//! Typed subset of the Proxmox API responses the portal consumes.
//!
//! PVE is loose about numeric types (ports and IDs arrive as strings or
//! numbers depending on the endpoint and version), so every numeric field
//! that crosses the wire goes through a permissive deserializer. Unknown
//! fields are ignored everywhere.

use serde::{Deserialize, Deserializer};

/// Every PVE endpoint wraps its payload in `{"data": ...}`; writes often
/// return `data: null`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
}

/// One row of `GET /cluster/resources?type=vm`. Pool membership listings
/// (`GET /pools/{pool}`) reuse the same shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterResource {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub vmid: Option<u64>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub template: Option<u64>,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: f64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub mem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub disk: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub maxdisk: u64,
    #[serde(default)]
    pub tags: Option<String>,
}

impl ClusterResource {
    pub fn is_qemu(&self) -> bool {
        self.kind == "qemu"
    }

    pub fn is_template(&self) -> bool {
        self.template.unwrap_or(0) != 0
    }

    pub fn tag_list(&self) -> Vec<String> {
        split_tags(self.tags.as_deref().unwrap_or(""))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag_list().iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeItem {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub maxcpu: f64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub mem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeMemory {
    #[serde(default, deserialize_with = "u64_permissive")]
    pub total: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub used: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub free: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeCpuInfo {
    #[serde(default, deserialize_with = "u64_permissive")]
    pub cpus: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub sockets: u64,
    #[serde(default)]
    pub model: Option<String>,
}

/// `GET /nodes/{node}/status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub memory: NodeMemory,
    #[serde(default)]
    pub cpuinfo: NodeCpuInfo,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub uptime: u64,
}

/// One row of `GET /nodes/{node}/storage`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageItem {
    pub storage: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Comma-separated capability list, e.g. `images,iso,vztmpl`.
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub active: Option<u64>,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub avail: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub total: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub used: u64,
}

impl StorageItem {
    pub fn supports(&self, capability: &str) -> bool {
        self.content.split(',').any(|c| c.trim() == capability)
    }
}

/// One row of `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageContent {
    pub volid: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub size: u64,
}

/// One row of `GET /nodes/{node}/network`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    pub iface: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub active: Option<u64>,
    #[serde(default)]
    pub comments: Option<String>,
}

impl NetworkInterface {
    pub fn is_bridge(&self) -> bool {
        self.kind == "bridge"
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/config`, reduced to the fields the portal
/// reads back.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub sockets: Option<u64>,
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub cores: Option<u64>,
    /// Megabytes.
    #[serde(default, deserialize_with = "opt_u64_permissive")]
    pub memory: Option<u64>,
    #[serde(default)]
    pub net0: Option<String>,
    #[serde(default)]
    pub scsi0: Option<String>,
}

impl VmConfig {
    pub fn tag_list(&self) -> Vec<String> {
        split_tags(self.tags.as_deref().unwrap_or(""))
    }

    /// Bridge name out of a `net0` line like
    /// `virtio=DE:AD:BE:EF:00:01,bridge=vmbr0,firewall=1`.
    pub fn bridge(&self) -> Option<String> {
        self.net0.as_deref().and_then(|line| {
            line.split(',')
                .find_map(|part| part.trim().strip_prefix("bridge="))
                .map(str::to_string)
        })
    }
}

/// `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub qmpstatus: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub uptime: u64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub mem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub disk: u64,
    #[serde(default, deserialize_with = "u64_permissive")]
    pub maxdisk: u64,
}

/// `POST /access/ticket`.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketData {
    #[serde(default)]
    pub ticket: Option<String>,
    #[serde(rename = "CSRFPreventionToken", default)]
    pub csrf_prevention_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// `POST /nodes/{node}/qemu/{vmid}/vncproxy?websocket=1`.
#[derive(Debug, Clone, Deserialize)]
pub struct VncProxyData {
    pub ticket: String,
    #[serde(deserialize_with = "u64_permissive")]
    pub port: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
}

/// `GET /pools/{pool}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolData {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub members: Vec<ClusterResource>,
}

/// Upstream tags are a single `;`-separated string. Normalizes to a
/// trimmed, deduplicated list preserving first-seen order.
pub fn split_tags(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Inverse of [`split_tags`]: trims, drops empties, dedupes, joins with `;`.
pub fn join_tags<I, S>(tags: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && seen.insert(tag.to_lowercase()) {
            out.push(tag.to_string());
        }
    }
    out.join(";")
}

fn u64_permissive<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_u64_permissive(deserializer)?.unwrap_or(0))
}

fn opt_u64_permissive<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Float(f64),
        Str(String),
        None,
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(Some(n)),
        Raw::Float(f) => Ok(Some(f as u64)),
        Raw::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<u64>()
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
        Raw::None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_accept_strings() {
        let vnc: ApiResponse<VncProxyData> = serde_json::from_str(
            r#"{"data":{"ticket":"PVEVNC:abc","port":"5900","user":"root@pam"}}"#,
        )
        .unwrap();
        assert_eq!(vnc.data.unwrap().port, 5900);

        let vnc: ApiResponse<VncProxyData> =
            serde_json::from_str(r#"{"data":{"ticket":"PVEVNC:abc","port":5901}}"#).unwrap();
        assert_eq!(vnc.data.unwrap().port, 5901);
    }

    #[test]
    fn cluster_resource_tolerates_unknown_fields() {
        let raw = r#"{
            "type":"qemu","vmid":101,"node":"pve1","name":"web-1",
            "status":"running","uptime":3600,"maxmem":2147483648,
            "tags":"pvmss;web","netin":123,"diskwrite":456
        }"#;
        let vm: ClusterResource = serde_json::from_str(raw).unwrap();
        assert!(vm.is_qemu());
        assert!(!vm.is_template());
        assert_eq!(vm.tag_list(), vec!["pvmss", "web"]);
        assert!(vm.has_tag("pvmss"));
    }

    #[test]
    fn split_tags_normalizes() {
        assert_eq!(split_tags("pvmss; web ;;pvmss;db"), vec!["pvmss", "web", "db"]);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn join_tags_dedupes_case_insensitively() {
        assert_eq!(join_tags(["pvmss", " Web", "web", ""]), "pvmss;Web");
    }

    #[test]
    fn bridge_parsed_from_net0() {
        let config = VmConfig {
            net0: Some("virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,firewall=1".into()),
            ..VmConfig::default()
        };
        assert_eq!(config.bridge().as_deref(), Some("vmbr0"));
    }

    #[test]
    fn storage_capabilities() {
        let storage: StorageItem = serde_json::from_str(
            r#"{"storage":"local","type":"dir","content":"iso,vztmpl","active":1}"#,
        )
        .unwrap();
        assert!(storage.supports("iso"));
        assert!(!storage.supports("images"));
    }
}
