mod common;
mod dispatch;
mod keys;
mod mux;
mod server;
pub mod sftp;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
pub use common::*;
pub use dispatch::dispatch_connection;
pub use mux::{Attachment, MuxHandle, MuxNotice, SessionMux};
pub use server::{MuxRegistry, ServerHandler, ServerSession};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uptermd_common::version::PeerKind;
use uptermd_core::net::{NetListener, NetProvider};
use uptermd_core::Services;

/// Routing information a transport adapter learned before the SSH
/// handshake (the WebSocket basic-auth header). Raw TCP connections
/// carry none.
#[derive(Clone, Debug)]
pub struct RoutingHint {
    pub kind: PeerKind,
    pub session_id: String,
    pub node_addr: String,
    pub client_version: String,
}

#[derive(Clone)]
pub struct SshProtocolServer {
    services: Services,
    muxes: MuxRegistry,
    russh_config: Arc<russh::server::Config>,
}

impl SshProtocolServer {
    pub async fn new(services: &Services) -> Result<Self> {
        let russh_config = Arc::new(server::make_russh_config(services).await?);
        Ok(SshProtocolServer {
            services: services.clone(),
            muxes: Arc::new(Mutex::new(HashMap::new())),
            russh_config,
        })
    }

    /// Accept loop for the raw SSH endpoint. Runs until cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listen_addr = self.services.config.lock().await.ssh_listen.clone();
        let mut listener = self
            .services
            .net
            .listen(&listen_addr)
            .await
            .context("binding SSH listener")?;
        info!(address=%listener.local_addr(), "SSH endpoint up");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SSH endpoint shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accepting connection")?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = this.handle_connection(stream, peer.clone(), None).await {
                            debug!(%peer, %error, "Connection ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Entry point shared by every transport. A connection with a
    /// routing hint naming another node is spliced there without
    /// building any SSH state here; everything else runs the SSH
    /// engine locally.
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        peer: String,
        hint: Option<RoutingHint>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(hint) = &hint {
            if hint.kind == PeerKind::Client {
                let our_addr = self.services.config.lock().await.node_addr.clone();
                if hint.node_addr != our_addr {
                    debug!(session=%hint.session_id, node=%hint.node_addr, "Dispatching to owning node");
                    dispatch_connection(
                        &self.services,
                        stream,
                        Bytes::new(),
                        &hint.session_id,
                        &hint.node_addr,
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        let client_version = hint.map(|hint| hint.client_version).unwrap_or_default();

        let (event_tx, event_rx) = unbounded_channel();
        let handler = ServerHandler { event_tx };

        let session = ServerSession::start(
            peer,
            client_version,
            self.services.clone(),
            self.muxes.clone(),
            event_rx,
        );
        tokio::spawn(session);

        server::run_stream(self.russh_config.clone(), stream, handler).await
    }

    /// Whether this node currently multiplexes the given session.
    pub async fn has_local_session(&self, session_id: &str) -> bool {
        self.muxes.lock().await.contains_key(session_id)
    }

    pub async fn local_session_count(&self) -> usize {
        self.muxes.lock().await.len()
    }
}

impl std::fmt::Debug for SshProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshProtocolServer")
    }
}
