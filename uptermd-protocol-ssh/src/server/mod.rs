mod channel_writer;
mod russh_handler;
mod session;
mod session_handle;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
pub use russh_handler::{ServerHandler, ServerHandlerEvent};
use russh::{MethodKind, MethodSet, SshId};
pub use session::{MuxRegistry, ServerSession};
pub use session_handle::{SessionControlCommand, SshSessionHandle};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::*;
use uptermd_common::version;
use uptermd_core::Services;

use crate::keys::load_host_keys;

pub(crate) async fn make_russh_config(services: &Services) -> Result<russh::server::Config> {
    let config = services.config.lock().await;
    Ok(russh::server::Config {
        server_id: SshId::Standard(version::server_id().into()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(config.keepalive_interval),
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keys: load_host_keys(&config)?,
        event_buffer_size: 100,
        nodelay: true,
        ..<_>::default()
    })
}

pub(crate) async fn run_stream<R>(
    config: Arc<russh::server::Config>,
    socket: R,
    handler: ServerHandler,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ret = async move {
        let session = russh::server::run_stream(config, socket, handler).await?;
        session.await?;
        Ok(())
    }
    .await;

    if let Err(ref error) = ret {
        debug!(%error, "Session stream ended with error");
    }

    ret
}
