use std::fs::create_dir_all;

use anyhow::Result;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{load_secret_key, Algorithm, PrivateKey};
use tracing::*;
use uptermd_common::UptermConfig;

/// Load the node's Ed25519 host key, generating and persisting one on
/// first run.
pub fn load_host_keys(config: &UptermConfig) -> Result<Vec<PrivateKey>> {
    create_dir_all(&config.keys_dir)?;

    let key_path = config.keys_dir.join("host-ed25519");
    if !key_path.exists() {
        info!(path=?key_path, "Generating Ed25519 host key");
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)?;
        key.write_openssh_file(&key_path, LineEnding::LF)?;
    }

    Ok(vec![load_secret_key(key_path, None)?])
}
