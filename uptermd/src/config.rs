use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::*;
use uptermd_common::UptermConfig;

pub fn load_config(path: &Path) -> Result<UptermConfig> {
    if !path.exists() {
        info!(?path, "No configuration file, using defaults");
        return Ok(UptermConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn validate(config: &UptermConfig) -> Result<()> {
    if config.ssh_listen.is_empty() {
        bail!("ssh_listen must not be empty");
    }
    if config.node_addr.is_empty() {
        bail!("node_addr must not be empty");
    }
    url::Url::parse(&config.host_url).context("host_url must be a valid URL")?;

    let keepalive = config.keepalive_interval;
    if keepalive < Duration::from_secs(1) || keepalive > Duration::from_secs(30) {
        bail!("keepalive_interval must be between 1s and 30s");
    }
    if config.replay_buffer_size == 0 {
        bail!("replay_buffer_size must be positive");
    }
    Ok(())
}
