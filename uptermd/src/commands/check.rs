use std::path::Path;

use anyhow::Result;

use crate::config::{load_config, validate};

pub async fn command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    validate(&config)?;
    println!("No problems found");
    Ok(())
}
