use async_trait::async_trait;
use uptermd_common::{ClientInfo, SessionMeta, UptermError};

/// Host-side lifecycle hooks, fired by the session multiplexer.
/// Deliveries are serialized per session and must not assume they run on
/// the multiplexer's task.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Runs once after the host's PTY channel is up. Returning an error
    /// aborts the session.
    async fn session_created(&self, session: &SessionMeta) -> Result<(), UptermError> {
        let _ = session;
        Ok(())
    }

    async fn client_joined(&self, client: &ClientInfo) {
        let _ = client;
    }

    async fn client_left(&self, client: &ClientInfo) {
        let _ = client;
    }
}

pub struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {}
