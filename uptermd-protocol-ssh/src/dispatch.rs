use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::*;
use uptermd_common::UptermError;
use uptermd_core::net::NetProvider;
use uptermd_core::routing::SessionRouter;
use uptermd_core::Services;

/// Splice a routed client connection through to the node owning its
/// session. The caller has already extracted `(session_id, node_addr)`
/// from the transport; this node never builds SSH state for the
/// connection. Auth, channels, SFTP, and resize all terminate on the
/// owning node.
pub async fn dispatch_connection<S>(
    services: &Services,
    mut stream: S,
    consumed: Bytes,
    session_id: &str,
    node_addr: &str,
) -> Result<(), UptermError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // The peer-supplied address is only a hint; the directory decides.
    let route = services
        .router
        .resolve(session_id)
        .await
        .map_err(|_| UptermError::SessionNotFound(session_id.to_owned()))?;

    if route.node_addr != node_addr {
        warn!(
            session=%session_id,
            claimed=%node_addr,
            actual=%route.node_addr,
            "Client-supplied node address disagrees with the directory"
        );
        return Err(UptermError::RoutingMisdirection);
    }

    let mut upstream = services.net.dial(node_addr).await?;

    // Bytes read from the client while classifying the connection (its
    // SSH banner) are replayed so the owning node sees a clean stream.
    if !consumed.is_empty() {
        upstream.write_all(&consumed).await?;
    }

    debug!(session=%session_id, node=%node_addr, "Splicing connection to owning node");
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::OffsetDateTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uptermd_common::UptermConfig;
    use uptermd_core::net::{MemoryNetProvider, NetListener, NetProvider};
    use uptermd_core::routing::{MemoryRouter, SessionRoute, SessionRouter};
    use uptermd_core::{NoopHooks, Services};

    use super::*;

    fn services_with(net: MemoryNetProvider, router: Arc<dyn SessionRouter>) -> Services {
        Services::assemble(
            UptermConfig::default(),
            router,
            Arc::new(NoopHooks),
            Arc::new(net),
        )
    }

    fn route(node_addr: &str) -> SessionRoute {
        SessionRoute {
            node_addr: node_addr.to_owned(),
            ssh_user: "s1:bjE".to_owned(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_splice_to_owning_node() {
        let net = MemoryNetProvider::new();
        let router = Arc::new(MemoryRouter::new());
        router.publish("s1", route("n1:2222")).await.unwrap();

        // The owning node: an echo server standing in for its SSH listener.
        let mut owner_listener = net.listen("n1:2222").await.unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = owner_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let services = services_with(net, router);

        // The "client" side of the connection the dispatching node accepted.
        let (mut client, server_side) = tokio::io::duplex(4096);
        let dispatch = tokio::spawn({
            let services = services.clone();
            async move {
                dispatch_connection(
                    &services,
                    server_side,
                    Bytes::from_static(b"SSH-2.0-upterm-client-1.0.0\r\n"),
                    "s1",
                    "n1:2222",
                )
                .await
            }
        });

        // The replayed banner comes back first (echo), then live traffic.
        let mut banner = vec![0u8; 29];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner[..], b"SSH-2.0-upterm-client-1.0.0\r\n");

        client.write_all(b"payload").await.unwrap();
        let mut echoed = vec![0u8; 7];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed[..], b"payload");

        drop(client);
        dispatch.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_misdirection_is_rejected_before_dialing() {
        let net = MemoryNetProvider::new();
        let router = Arc::new(MemoryRouter::new());
        router.publish("s1", route("n1:2222")).await.unwrap();

        // No listener for the claimed node: a dial attempt would error
        // differently, proving the mismatch check fires first.
        let services = services_with(net, router);
        let (_client, server_side) = tokio::io::duplex(4096);
        let result =
            dispatch_connection(&services, server_side, Bytes::new(), "s1", "evil:2222").await;
        assert!(matches!(result, Err(UptermError::RoutingMisdirection)));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let net = MemoryNetProvider::new();
        let services = services_with(net, Arc::new(MemoryRouter::new()));
        let (_client, server_side) = tokio::io::duplex(4096);
        let result =
            dispatch_connection(&services, server_side, Bytes::new(), "missing", "n1:2222").await;
        assert!(matches!(result, Err(UptermError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_dead_owner_closes_client() {
        let net = MemoryNetProvider::new();
        let router = Arc::new(MemoryRouter::new());
        router.publish("s1", route("n1:2222")).await.unwrap();

        // Directory says n1 owns the session, but n1 is gone.
        let services = services_with(net, router);
        let (_client, server_side) = tokio::io::duplex(4096);
        let result =
            dispatch_connection(&services, server_side, Bytes::new(), "s1", "n1:2222").await;
        assert!(matches!(result, Err(UptermError::Io(_))));
    }
}
