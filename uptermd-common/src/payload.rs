use serde::{Deserialize, Serialize};

/// Sent by the host on its `upterm-session` channel right after auth.
/// An empty `authorized_keys` list means any client key is permitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionPayload {
    pub command: Vec<String>,
    #[serde(default)]
    pub force_command: Vec<String>,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub sftp_disabled: bool,
}

/// Returned to the host once the session is published. The host's admin
/// interface hands this to clients out-of-band; the shape is identical
/// in embedded and cluster modes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub host: String,
    pub node_addr: String,
    pub ssh_user: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub force_command: Vec<String>,
}
