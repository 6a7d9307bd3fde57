use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use uptermd_common::SessionId;
use uuid::Uuid;

use super::{RouteEvent, RouteLease, RouteWatch, RoutingError, SessionRoute, SessionRouter};

/// Single-node directory: a map behind a reader/writer lock. Publish
/// takes the write lock, so two concurrent publishes of the same id
/// serialize and exactly one wins.
#[derive(Default)]
pub struct MemoryRouter {
    entries: RwLock<HashMap<SessionId, (SessionRoute, Uuid)>>,
    watchers: Mutex<HashMap<SessionId, Vec<mpsc::UnboundedSender<RouteEvent>>>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn notify(&self, session_id: &str, event: RouteEvent) {
        let mut watchers = self.watchers.lock().await;
        if let Some(senders) = watchers.get_mut(session_id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                watchers.remove(session_id);
            }
        }
    }
}

#[async_trait]
impl SessionRouter for MemoryRouter {
    async fn publish(
        &self,
        session_id: &str,
        route: SessionRoute,
    ) -> Result<RouteLease, RoutingError> {
        let node_addr = route.node_addr.clone();
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(session_id) {
                return Err(RoutingError::AlreadyExists(session_id.to_owned()));
            }
            let token = Uuid::new_v4();
            entries.insert(session_id.to_owned(), (route, token));
            drop(entries);
            self.notify(session_id, RouteEvent::Present(node_addr)).await;
            Ok(RouteLease {
                session_id: session_id.to_owned(),
                token,
            })
        }
    }

    async fn resolve(&self, session_id: &str) -> Result<SessionRoute, RoutingError> {
        self.entries
            .read()
            .await
            .get(session_id)
            .map(|(route, _)| route.clone())
            .ok_or_else(|| RoutingError::NotFound(session_id.to_owned()))
    }

    async fn release(&self, lease: &RouteLease) -> Result<(), RoutingError> {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(&lease.session_id) {
                Some((_, token)) if *token == lease.token => {
                    entries.remove(&lease.session_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.notify(&lease.session_id, RouteEvent::Gone).await;
        }
        Ok(())
    }

    async fn watch(&self, session_id: &str) -> Result<RouteWatch, RoutingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some((route, _)) = self.entries.read().await.get(session_id) {
            let _ = tx.send(RouteEvent::Present(route.node_addr.clone()));
        }
        self.watchers
            .lock()
            .await
            .entry(session_id.to_owned())
            .or_default()
            .push(tx);
        Ok(RouteWatch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::OffsetDateTime;

    use super::*;

    fn route(node_addr: &str) -> SessionRoute {
        SessionRoute {
            node_addr: node_addr.to_owned(),
            ssh_user: "user".to_owned(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_publish_resolve_release() {
        let router = MemoryRouter::new();
        let lease = router.publish("s1", route("n1:2222")).await.unwrap();

        let resolved = router.resolve("s1").await.unwrap();
        assert_eq!(resolved.node_addr, "n1:2222");

        router.release(&lease).await.unwrap();
        assert!(matches!(
            router.resolve("s1").await,
            Err(RoutingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let router = MemoryRouter::new();
        assert!(matches!(
            router.resolve("missing").await,
            Err(RoutingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_publish_single_winner() {
        let router = Arc::new(MemoryRouter::new());
        let mut tasks = Vec::new();
        for n in 0..8 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                router.publish("s1", route(&format!("n{n}:2222"))).await
            }));
        }

        let mut winners = 0;
        let mut collisions = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(RoutingError::AlreadyExists(_)) => collisions += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(collisions, 7);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let router = MemoryRouter::new();
        let lease = router.publish("s1", route("n1:2222")).await.unwrap();
        router.release(&lease).await.unwrap();
        router.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_foreign_lease_is_noop() {
        let router = MemoryRouter::new();
        let stale = router.publish("s1", route("n1:2222")).await.unwrap();
        router.release(&stale).await.unwrap();

        // A new owner claimed the id; the stale lease must not evict it.
        let _fresh = router.publish("s1", route("n2:2222")).await.unwrap();
        router.release(&stale).await.unwrap();
        assert_eq!(router.resolve("s1").await.unwrap().node_addr, "n2:2222");
    }

    #[tokio::test]
    async fn test_watch_sees_present_and_gone() {
        let router = MemoryRouter::new();
        let mut watch = router.watch("s1").await.unwrap();

        let lease = router.publish("s1", route("n1:2222")).await.unwrap();
        assert_eq!(
            watch.recv().await,
            Some(RouteEvent::Present("n1:2222".to_owned()))
        );

        router.release(&lease).await.unwrap();
        assert_eq!(watch.recv().await, Some(RouteEvent::Gone));
    }

    #[tokio::test]
    async fn test_watch_delivers_current_state() {
        let router = MemoryRouter::new();
        let _lease = router.publish("s1", route("n1:2222")).await.unwrap();
        let mut watch = router.watch("s1").await.unwrap();
        assert_eq!(
            watch.recv().await,
            Some(RouteEvent::Present("n1:2222".to_owned()))
        );
    }
}
