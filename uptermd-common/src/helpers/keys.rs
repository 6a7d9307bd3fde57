use russh::keys::{HashAlg, PublicKey};

use crate::UptermError;

/// `SHA256:<base64>` fingerprint, the form OpenSSH prints.
pub fn key_fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// The set of client keys a session admits. An empty set admits any key.
#[derive(Clone, Debug, Default)]
pub struct AuthorizedKeys {
    keys: Vec<PublicKey>,
}

impl AuthorizedKeys {
    pub fn parse(lines: &[String]) -> Result<Self, UptermError> {
        let mut keys = Vec::with_capacity(lines.len());
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key = PublicKey::from_openssh(line).map_err(UptermError::other)?;
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether `key` is admitted. Comparison is on key material, not the
    /// comment.
    pub fn admits(&self, key: &PublicKey) -> bool {
        self.is_empty() || self.keys.iter().any(|k| k.key_data() == key.key_data())
    }
}
