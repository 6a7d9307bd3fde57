use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque, host-supplied session key. Unique cluster-wide while the
/// session is live.
pub type SessionId = String;

#[derive(PartialEq, Clone)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub const fn new(v: T) -> Self {
        Self(v)
    }

    pub fn expose_secret(&self) -> &T {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Deserialize::deserialize::<D>(deserializer)?;
        Ok(Self::new(v))
    }
}

impl<T> Serialize for Secret<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<secret>")
    }
}

/// A terminal window size in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub cols: u32,
    pub rows: u32,
}

impl Window {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

/// One viewer attached to a session.
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub id: Uuid,
    pub session_id: SessionId,
    /// `SHA256:<base64>` fingerprint of the key the client authenticated
    /// with, or empty when the session accepts any key.
    pub public_key_fingerprint: String,
    pub ssh_client_version: String,
    pub addr: String,
}

/// Everything the server knows about a published session.
#[derive(Clone, Debug)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub node_addr: String,
    pub host: String,
    pub ssh_user: String,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub read_only: bool,
    pub sftp_disabled: bool,
    pub created_at: OffsetDateTime,
}
