mod stream;

use anyhow::{Context, Result};
use data_encoding::BASE64;
use poem::http::{HeaderMap, StatusCode};
use poem::listener::TcpListener;
use poem::web::websocket::WebSocket;
use poem::web::Data;
use poem::{get, handler, EndpointExt, IntoResponse, Request, Response, Route, Server};
pub use stream::WsStream;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uptermd_common::version::{classify_product_version, CLIENT_VERSION_HEADER};
use uptermd_core::Services;
use uptermd_protocol_ssh::{RoutingHint, SshProtocolServer};

/// The WebSocket transport adapter: a single upgrade route whose
/// upgraded sockets carry SSH framing end-to-end. The basic-auth header
/// smuggles the routing key, so dispatch decisions happen before the
/// SSH handshake starts.
#[derive(Clone)]
pub struct WsTransport {
    services: Services,
    ssh: SshProtocolServer,
}

#[derive(thiserror::Error, Debug)]
enum WsAuthError {
    #[error("missing or malformed authorization header")]
    BadAuthorization,
    #[error("unknown product version")]
    UnknownVersion,
}

fn parse_routing_hint(headers: &HeaderMap) -> Result<RoutingHint, WsAuthError> {
    let authorization = headers
        .get(poem::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(WsAuthError::BadAuthorization)?;
    let encoded = authorization
        .strip_prefix("Basic ")
        .ok_or(WsAuthError::BadAuthorization)?;
    let decoded = BASE64
        .decode(encoded.as_bytes())
        .map_err(|_| WsAuthError::BadAuthorization)?;
    let credentials =
        String::from_utf8(decoded).map_err(|_| WsAuthError::BadAuthorization)?;
    let (session_id, encoded_addr) = credentials
        .split_once(':')
        .ok_or(WsAuthError::BadAuthorization)?;
    if session_id.is_empty() {
        return Err(WsAuthError::BadAuthorization);
    }
    let node_addr = BASE64
        .decode(encoded_addr.as_bytes())
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .ok_or(WsAuthError::BadAuthorization)?;

    let client_version = headers
        .get(CLIENT_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let kind = classify_product_version(&client_version).ok_or(WsAuthError::UnknownVersion)?;

    Ok(RoutingHint {
        kind,
        session_id: session_id.to_owned(),
        node_addr,
        client_version,
    })
}

#[handler]
async fn session_endpoint(
    req: &Request,
    ws: WebSocket,
    Data(transport): Data<&WsTransport>,
) -> Response {
    let hint = match parse_routing_hint(req.headers()) {
        Ok(hint) => hint,
        Err(error) => {
            debug!(%error, "Rejecting WebSocket connection");
            let status = match error {
                WsAuthError::BadAuthorization => StatusCode::UNAUTHORIZED,
                WsAuthError::UnknownVersion => StatusCode::BAD_REQUEST,
            };
            return status.into_response();
        }
    };

    let peer = req
        .remote_addr()
        .to_string();
    let ssh = transport.ssh.clone();

    ws.on_upgrade(move |socket| async move {
        debug!(%peer, kind=?hint.kind, "WebSocket transport established");
        let stream = WsStream::new(socket);
        if let Err(error) = ssh.handle_connection(stream, peer.clone(), Some(hint)).await {
            debug!(%peer, %error, "WebSocket connection ended with error");
        }
    })
    .into_response()
}

impl WsTransport {
    pub fn new(services: &Services, ssh: &SshProtocolServer) -> Self {
        Self {
            services: services.clone(),
            ssh: ssh.clone(),
        }
    }

    /// Serve the upgrade endpoint until cancelled. A configuration
    /// without `ws_listen` disables the adapter.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Some(listen_addr) = self.services.config.lock().await.ws_listen.clone() else {
            debug!("WebSocket transport disabled");
            return Ok(());
        };

        info!(address=%listen_addr, "WebSocket endpoint up");
        let app = Route::new()
            .at("/", get(session_endpoint))
            .data(self.clone());

        Server::new(TcpListener::bind(listen_addr))
            .run_with_graceful_shutdown(app, shutdown.cancelled_owned(), None)
            .await
            .context("WebSocket server failed")
    }
}
