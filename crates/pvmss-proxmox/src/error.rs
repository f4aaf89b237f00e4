use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxmoxError {
    #[error("invalid Proxmox URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP transport: {0}")]
    Build(String),

    #[error("request to Proxmox failed: {0}")]
    Transport(String),

    #[error("Proxmox returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Proxmox rejected credentials ({status})")]
    AuthFailed { status: u16 },

    #[error("unexpected Proxmox response shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("login response carried no ticket")]
    MissingTicket,

    #[error("Proxmox response carried no data")]
    EmptyData,
}

impl ProxmoxError {
    /// Transient failures worth another attempt: network/timeout trouble
    /// and upstream 5xx. Client errors and credential rejections are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxmoxError::Transport(_) => true,
            ProxmoxError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status carried by the upstream response, when there is one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ProxmoxError::Status { status, .. } => Some(*status),
            ProxmoxError::AuthFailed { status } => Some(*status),
            _ => None,
        }
    }
}

pub type ProxmoxResult<T> = std::result::Result<T, ProxmoxError>;
