use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::*;
use uptermd_common::{SessionId, SessionMeta, UptermError};

/// Handle kept by the session table so the server can tear a session
/// down without reaching into protocol internals.
pub trait SessionHandle {
    fn close(&mut self);
}

struct SessionEntry {
    meta: SessionMeta,
    handle: Box<dyn SessionHandle + Send + Sync>,
}

/// The in-process table of sessions published on this node. The
/// distributed directory (`routing`) is authoritative across the
/// cluster; this table is authoritative for what is attached locally.
pub struct State {
    sessions: HashMap<SessionId, SessionEntry>,
    change_sender: broadcast::Sender<()>,
}

impl State {
    pub fn new() -> Arc<Mutex<Self>> {
        let change_sender = broadcast::channel(2).0;
        Arc::new(Mutex::new(Self {
            sessions: HashMap::new(),
            change_sender,
        }))
    }

    pub fn register_session(
        &mut self,
        meta: SessionMeta,
        handle: Box<dyn SessionHandle + Send + Sync>,
    ) -> Result<(), UptermError> {
        let session_id = meta.session_id.clone();
        if self.sessions.contains_key(&session_id) {
            return Err(UptermError::SessionAlreadyExists(session_id));
        }
        info!(session=%session_id, "Session registered");
        self.sessions.insert(session_id, SessionEntry { meta, handle });
        let _ = self.change_sender.send(());
        Ok(())
    }

    pub fn remove_session(&mut self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(session=%session_id, "Session removed");
            let _ = self.change_sender.send(());
        }
    }

    pub fn session_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.sessions.get(session_id).map(|e| e.meta.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_sender.subscribe()
    }

    /// Ask every live session to close. Completion is observed through
    /// `subscribe` as sessions unregister themselves.
    pub fn close_all(&mut self) {
        for (id, entry) in self.sessions.iter_mut() {
            debug!(session=%id, "Closing session");
            entry.handle.close();
        }
    }
}
