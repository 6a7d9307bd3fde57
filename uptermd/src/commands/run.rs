use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uptermd_core::Services;
use uptermd_protocol_ssh::SshProtocolServer;
use uptermd_ws::WsTransport;

use crate::config::{load_config, validate};

pub async fn command(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    validate(&config)?;
    let grace = config.graceful_shutdown_timeout;

    let services = Services::new(config).await?;
    let ssh = SshProtocolServer::new(&services).await?;
    let ws = WsTransport::new(&services, &ssh);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                shutdown.cancel();
            }
        }
    });

    tokio::try_join!(
        ssh.run(shutdown.clone()),
        ws.run(shutdown.clone()),
    )?;

    // Give live sessions a bounded chance to unwind before the process
    // exits; their reverse connections close as they unregister.
    let drained = tokio::time::timeout(grace, async {
        let mut changes = services.state.lock().await.subscribe();
        services.state.lock().await.close_all();
        while services.state.lock().await.session_count() > 0 {
            if changes.recv().await.is_err() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown grace period expired with sessions still open");
    }

    info!("Exiting");
    Ok(())
}
