use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::Future;
use russh::keys::PublicKey;
use russh::server::Auth;
use russh::CryptoVec;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::*;
use uptermd_common::helpers::keys::{key_fingerprint, AuthorizedKeys};
use uptermd_common::{
    ClientInfo, Identifier, Secret, SessionDescriptor, SessionId, SessionMeta, SessionPayload,
    UptermError, Window,
};
use uptermd_core::routing::{RouteLease, RoutingError, SessionRoute, SessionRouter};
use uptermd_core::Services;
use uuid::Uuid;

use super::channel_writer::ChannelWriter;
use super::russh_handler::ServerHandlerEvent;
use super::session_handle::{SessionControlCommand, SshSessionHandle};
use crate::common::{ChannelOperation, PtyRequest, ServerChannelId};
use crate::mux::{MuxHandle, MuxNotice, ReverseChannel, ReverseChannelEvent, SessionMux};
use crate::sftp::SftpWriteFilter;

/// Sessions currently multiplexed on this node, shared between every
/// accepted connection.
pub type MuxRegistry = Arc<Mutex<HashMap<SessionId, MuxHandle>>>;

#[derive(Debug)]
enum Event {
    ServerHandler(ServerHandlerEvent),
    Control(SessionControlCommand),
    Mux(MuxNotice),
    /// The shared fan-out closed under a client connection: the host is
    /// gone and every viewer gets EOF.
    SessionGone,
    Reverse(ServerChannelId, ReverseKind, ReverseChannelEvent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReverseKind {
    ForceCommand,
    Sftp,
}

enum ConnectionMode {
    New,
    Host(HostState),
    Client(ClientState),
}

struct HostState {
    session_id: SessionId,
    key_fingerprint: String,
    payload_channel: Option<ServerChannelId>,
    payload_buf: Vec<u8>,
    published: Option<PublishedSession>,
}

struct PublishedSession {
    lease: RouteLease,
    mux: MuxHandle,
}

struct ClientState {
    mux: MuxHandle,
    fingerprint: String,
    channels: HashMap<ServerChannelId, ClientChannel>,
}

struct ClientChannel {
    info: ClientInfo,
    window: Option<Window>,
    /// Counted into the session's client list (fires ClientLeft on close).
    joined: bool,
    fanout_task: Option<JoinHandle<()>>,
    force_ops: Option<UnboundedSender<ChannelOperation>>,
    sftp_ops: Option<UnboundedSender<ChannelOperation>>,
    sftp_filter: Option<SftpWriteFilter>,
}

impl ClientChannel {
    fn new(info: ClientInfo) -> Self {
        Self {
            info,
            window: None,
            joined: false,
            fanout_task: None,
            force_ops: None,
            sftp_ops: None,
            sftp_filter: None,
        }
    }
}

pub struct ServerSession {
    id: Uuid,
    remote_address: String,
    client_version: String,
    services: Services,
    muxes: MuxRegistry,
    session_handle: Option<russh::server::Handle>,
    mode: ConnectionMode,
    channel_writer: ChannelWriter,
    control_handle: Option<SshSessionHandle>,
    event_tx: UnboundedSender<Event>,
    event_rx: UnboundedReceiver<Event>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {}]", self.id, self.remote_address)
    }
}

impl ServerSession {
    pub fn start(
        remote_address: String,
        client_version: String,
        services: Services,
        muxes: MuxRegistry,
        mut handler_event_rx: UnboundedReceiver<ServerHandlerEvent>,
    ) -> impl Future<Output = anyhow::Result<()>> {
        let id = Uuid::new_v4();
        let (event_tx, event_rx) = unbounded_channel();

        let (control_handle, mut control_rx) = SshSessionHandle::new();

        tokio::spawn({
            let sender = event_tx.clone();
            async move {
                while let Some(command) = control_rx.recv().await {
                    if sender.send(Event::Control(command)).is_err() {
                        break;
                    }
                }
            }
        });

        tokio::spawn({
            let sender = event_tx.clone();
            async move {
                while let Some(event) = handler_event_rx.recv().await {
                    if sender.send(Event::ServerHandler(event)).is_err() {
                        break;
                    }
                }
            }
        });

        let mut this = Self {
            id,
            remote_address,
            client_version,
            services,
            muxes,
            session_handle: None,
            mode: ConnectionMode::New,
            channel_writer: ChannelWriter::new(),
            control_handle: Some(control_handle),
            event_tx,
            event_rx,
        };

        let span = info_span!("SSH", session=%this.id, peer=%this.remote_address);
        async move {
            while let Some(event) = this.event_rx.recv().await {
                match this.handle_event(event).await {
                    Ok(false) => (),
                    Ok(true) => break,
                    Err(error) => {
                        error!(?error, "Event handler error");
                        break;
                    }
                }
            }
            this.cleanup().await;
            debug!("No more events");
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
    }

    /// Returns `true` once the connection is done.
    async fn handle_event(&mut self, event: Event) -> Result<bool, UptermError> {
        match event {
            Event::ServerHandler(event) => self.handle_server_handler_event(event).await,
            Event::Control(SessionControlCommand::Close) => {
                info!("Session closed by server");
                Ok(true)
            }
            Event::Mux(MuxNotice::Ended) => {
                info!("Host PTY channel ended");
                Ok(true)
            }
            Event::SessionGone => {
                debug!("Session is gone, disconnecting viewer");
                Ok(true)
            }
            Event::Reverse(channel, kind, event) => {
                self.handle_reverse_event(channel, kind, event).await;
                Ok(false)
            }
        }
    }

    async fn handle_server_handler_event(
        &mut self,
        event: ServerHandlerEvent,
    ) -> Result<bool, UptermError> {
        match event {
            ServerHandlerEvent::Authenticated(handle) => {
                self.session_handle = Some(handle.0);
            }

            ServerHandlerEvent::AuthPublicKeyOffer(username, key, reply) => {
                let auth = match self.check_auth(&username, &key).await {
                    Some(_) => Auth::Accept,
                    None => Auth::Reject {
                        proceed_with_methods: None,
                        partial_success: false,
                    },
                };
                let _ = reply.send(auth);
            }

            ServerHandlerEvent::AuthPublicKey(username, key, reply) => {
                let auth = match self.check_auth(&username, &key).await {
                    Some(mode) => {
                        self.mode = mode;
                        Auth::Accept
                    }
                    None => Auth::Reject {
                        proceed_with_methods: None,
                        partial_success: false,
                    },
                };
                let _ = reply.send(auth);
            }

            ServerHandlerEvent::ChannelOpenSession(channel, reply) => {
                let allowed = self.open_session_channel(channel);
                let _ = reply.send(allowed);
            }

            ServerHandlerEvent::SubsystemRequest(channel, name, reply) => {
                self.handle_subsystem_request(channel, name, reply).await;
            }

            ServerHandlerEvent::PtyRequest(channel, request, reply) => {
                let _ = reply.send(());
                self.update_window(channel, request.window());
            }

            ServerHandlerEvent::WindowChangeRequest(channel, request, reply) => {
                let _ = reply.send(());
                self.update_window(channel, request.window());
            }

            ServerHandlerEvent::ShellRequest(channel, reply) => {
                let accepted = self.handle_attach_request(channel).await;
                let _ = reply.send(accepted);
            }

            ServerHandlerEvent::ExecRequest(channel, _command, reply) => {
                // Viewers attach to the session regardless of the command
                // they asked for; the host decides what runs.
                let accepted = self.handle_attach_request(channel).await;
                let _ = reply.send(accepted);
            }

            ServerHandlerEvent::Data(channel, data, reply) => {
                // Reply before anything that awaits this connection's own
                // transport, or the russh session task deadlocks on us.
                let _ = reply.send(());
                self.handle_data(channel, data).await?;
            }

            ServerHandlerEvent::ChannelEof(channel, reply) => {
                let _ = reply.send(());
                self.handle_channel_eof(channel);
            }

            ServerHandlerEvent::ChannelClose(channel, reply) => {
                let _ = reply.send(());
                self.close_client_channel(channel);
            }

            ServerHandlerEvent::Disconnect => return Ok(true),
        }
        Ok(false)
    }

    /// Decode the username and decide whether this key may proceed.
    /// Every failure mode is a plain rejection; nothing distinguishes an
    /// unknown session from a bad key.
    async fn check_auth(
        &mut self,
        username: &Secret<String>,
        key: &PublicKey,
    ) -> Option<ConnectionMode> {
        let identifier = match Identifier::decode(username.expose_secret()) {
            Ok(identifier) => identifier,
            Err(error) => {
                warn!(%error, "Malformed identifier in username");
                return None;
            }
        };

        match identifier {
            Identifier::Host { session_id } => {
                Identifier::validate_session_id(&session_id).ok()?;
                // The authorized-key list for a session only exists once
                // its payload arrives; a publishing host is admitted with
                // whatever key it presents, recorded on the session.
                Some(ConnectionMode::Host(HostState {
                    session_id,
                    key_fingerprint: key_fingerprint(key),
                    payload_channel: None,
                    payload_buf: Vec::new(),
                    published: None,
                }))
            }
            Identifier::Client {
                session_id,
                node_addr,
            } => {
                let our_addr = self.services.config.lock().await.node_addr.clone();
                if node_addr != our_addr {
                    // Routed transports splice before SSH starts, so a
                    // foreign node address here means the client dialed
                    // the wrong node outright.
                    match self.services.router.resolve(&session_id).await {
                        Ok(route) if route.node_addr == node_addr => {
                            warn!(session=%session_id, node=%node_addr, "Session is owned by another node")
                        }
                        _ => warn!(session=%session_id, node=%node_addr, "Routing misdirection"),
                    }
                    return None;
                }

                let mux = self.muxes.lock().await.get(&session_id).cloned();
                let Some(mux) = mux else {
                    debug!(session=%session_id, "Join attempt for unknown session");
                    return None;
                };
                if !mux.admits(key) {
                    warn!(session=%session_id, "Client key is not authorized");
                    return None;
                }
                let fingerprint = if mux.accepts_any_key() {
                    String::new()
                } else {
                    key_fingerprint(key)
                };
                Some(ConnectionMode::Client(ClientState {
                    mux,
                    fingerprint,
                    channels: HashMap::new(),
                }))
            }
        }
    }

    fn open_session_channel(&mut self, channel: ServerChannelId) -> bool {
        match &mut self.mode {
            ConnectionMode::Host(_) => true,
            ConnectionMode::Client(client) => {
                let info = ClientInfo {
                    id: Uuid::new_v4(),
                    session_id: client.mux.meta().session_id.clone(),
                    public_key_fingerprint: client.fingerprint.clone(),
                    ssh_client_version: self.client_version.clone(),
                    addr: self.remote_address.clone(),
                };
                info!(%channel, client=%info.id, "Opening session channel");
                client.channels.insert(channel, ClientChannel::new(info));
                true
            }
            ConnectionMode::New => false,
        }
    }

    async fn handle_subsystem_request(
        &mut self,
        channel: ServerChannelId,
        name: String,
        reply: oneshot::Sender<bool>,
    ) {
        let accepted = if name == "upterm-session" {
            if let ConnectionMode::Host(host) = &mut self.mode {
                debug!(%channel, "Host payload channel");
                host.payload_channel = Some(channel);
                true
            } else {
                false
            }
        } else if name == "sftp" && matches!(&self.mode, ConnectionMode::Client(_)) {
            match self.open_sftp_splice(channel).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(%channel, %error, "Could not open SFTP channel to the host");
                    false
                }
            }
        } else {
            debug!(%channel, %name, "Unsupported subsystem");
            false
        };
        let _ = reply.send(accepted);
    }

    async fn open_sftp_splice(&mut self, channel: ServerChannelId) -> Result<(), UptermError> {
        let ConnectionMode::Client(client) = &mut self.mode else {
            return Err(UptermError::InconsistentState);
        };
        if !client.channels.contains_key(&channel) {
            return Err(UptermError::InconsistentState);
        }
        if client.mux.meta().sftp_disabled {
            return Err(UptermError::PolicyDenied("SFTP is disabled".to_owned()));
        }

        let reverse = client.mux.open_reverse_channel().await?;
        let (ops_tx, ops_rx) = unbounded_channel();
        let (reverse_events_tx, mut reverse_events_rx) = unbounded_channel();
        let pump = ReverseChannel::new(
            reverse,
            ops_rx,
            reverse_events_tx,
            client.mux.meta().session_id.clone(),
        );
        tokio::spawn(async move {
            let _ = pump.run().await;
        });

        let _ = ops_tx.send(ChannelOperation::RequestSubsystem("sftp".to_owned()));

        tokio::spawn({
            let event_tx = self.event_tx.clone();
            async move {
                while let Some(event) = reverse_events_rx.recv().await {
                    if event_tx
                        .send(Event::Reverse(channel, ReverseKind::Sftp, event))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let read_only = client.mux.meta().read_only;
        if let Some(client_channel) = client.channels.get_mut(&channel) {
            client_channel.sftp_ops = Some(ops_tx);
            client_channel.sftp_filter = read_only.then(SftpWriteFilter::new);
        }

        info!(%channel, "SFTP subsystem spliced");
        Ok(())
    }

    async fn handle_attach_request(&mut self, channel: ServerChannelId) -> bool {
        let shared = match &self.mode {
            ConnectionMode::Client(client) => {
                match client.channels.get(&channel) {
                    Some(client_channel) if !client_channel.joined => (),
                    _ => return false,
                }
                client.mux.meta().force_command.is_empty()
            }
            _ => return false,
        };

        if shared {
            match self.attach_shared(channel).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(%channel, %error, "Attach failed");
                    false
                }
            }
        } else {
            match self.open_force_channel(channel).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(%channel, %error, "Could not start force command");
                    false
                }
            }
        }
    }

    async fn attach_shared(&mut self, channel: ServerChannelId) -> Result<(), UptermError> {
        let handle = self
            .session_handle
            .clone()
            .ok_or(UptermError::InconsistentState)?;
        let ConnectionMode::Client(client) = &mut self.mode else {
            return Err(UptermError::InconsistentState);
        };
        let Some(client_channel) = client.channels.get_mut(&channel) else {
            return Err(UptermError::InconsistentState);
        };
        let window = client_channel.window.unwrap_or(Window::new(80, 24));

        let attachment = client
            .mux
            .attach(client_channel.info.clone(), window)
            .await?;
        client_channel.joined = true;

        let event_tx = self.event_tx.clone();
        let mut output = attachment.output;
        let replay = attachment.replay;
        let raw_channel = channel.0;
        client_channel.fanout_task = Some(tokio::spawn(async move {
            if !replay.is_empty() {
                let _ = handle
                    .data(raw_channel, bytes::Bytes::copy_from_slice(&replay))
                    .await;
            }
            let mut lossy = false;
            loop {
                match output.recv().await {
                    Ok(data) => {
                        if handle
                            .data(raw_channel, bytes::Bytes::copy_from_slice(&data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        if !lossy {
                            lossy = true;
                            warn!(skipped, "Viewer is too slow, dropping output");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = event_tx.send(Event::SessionGone);
                        break;
                    }
                }
            }
        }));

        info!(%channel, "Viewer attached to shared PTY");
        Ok(())
    }

    async fn open_force_channel(&mut self, channel: ServerChannelId) -> Result<(), UptermError> {
        let ConnectionMode::Client(client) = &mut self.mode else {
            return Err(UptermError::InconsistentState);
        };
        let Some(client_channel) = client.channels.get_mut(&channel) else {
            return Err(UptermError::InconsistentState);
        };
        let window = client_channel.window.unwrap_or(Window::new(80, 24));

        let reverse = client.mux.open_reverse_channel().await?;
        let (ops_tx, ops_rx) = unbounded_channel();
        let (reverse_events_tx, mut reverse_events_rx) = unbounded_channel();
        let pump = ReverseChannel::new(
            reverse,
            ops_rx,
            reverse_events_tx,
            client.mux.meta().session_id.clone(),
        );
        tokio::spawn(async move {
            let _ = pump.run().await;
        });

        let _ = ops_tx.send(ChannelOperation::RequestPty(PtyRequest::from(window)));
        let _ = ops_tx.send(ChannelOperation::RequestExec(
            client.mux.meta().force_command.join(" "),
        ));

        tokio::spawn({
            let event_tx = self.event_tx.clone();
            async move {
                while let Some(event) = reverse_events_rx.recv().await {
                    if event_tx
                        .send(Event::Reverse(channel, ReverseKind::ForceCommand, event))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        client_channel.force_ops = Some(ops_tx);
        client_channel.joined = true;
        client.mux.register(client_channel.info.clone());
        info!(%channel, "Force command started");
        Ok(())
    }

    fn update_window(&mut self, channel: ServerChannelId, window: Window) {
        if let ConnectionMode::Client(client) = &mut self.mode {
            if let Some(client_channel) = client.channels.get_mut(&channel) {
                client_channel.window = Some(window);
                if client_channel.joined {
                    if let Some(ops) = &client_channel.force_ops {
                        let _ = ops.send(ChannelOperation::ResizePty(PtyRequest::from(window)));
                    } else {
                        client.mux.window_change(client_channel.info.id, window);
                    }
                }
            }
        }
    }

    async fn handle_data(
        &mut self,
        channel: ServerChannelId,
        data: Bytes,
    ) -> Result<(), UptermError> {
        let payload = match &mut self.mode {
            ConnectionMode::Host(host) => {
                if host.payload_channel != Some(channel) || host.published.is_some() {
                    return Ok(());
                }
                host.payload_buf.extend_from_slice(&data);
                match serde_json::from_slice::<SessionPayload>(&host.payload_buf) {
                    Ok(payload) => payload,
                    Err(error) if error.is_eof() => return Ok(()),
                    Err(error) => {
                        warn!(%error, "Malformed session payload");
                        return Err(error.into());
                    }
                }
            }
            ConnectionMode::Client(client) => {
                let read_only = client.mux.meta().read_only;
                if let Some(client_channel) = client.channels.get_mut(&channel) {
                    if client_channel.sftp_ops.is_some() {
                        Self::handle_sftp_data(
                            &self.channel_writer,
                            self.session_handle.clone(),
                            channel,
                            client_channel,
                            &data,
                        );
                    } else if let Some(ops) = &client_channel.force_ops {
                        let _ = ops.send(ChannelOperation::Data(data));
                    } else if client_channel.joined && !read_only {
                        // Read-only viewers' input never reaches the host.
                        client.mux.write_stdin(data);
                    }
                }
                return Ok(());
            }
            ConnectionMode::New => return Ok(()),
        };

        if let Err(error) = self.publish_session(payload).await {
            self.report_publish_error(&error);
            return Err(error);
        }
        Ok(())
    }

    fn handle_sftp_data(
        channel_writer: &ChannelWriter,
        session_handle: Option<russh::server::Handle>,
        channel: ServerChannelId,
        client_channel: &mut ClientChannel,
        data: &[u8],
    ) {
        let Some(ops) = &client_channel.sftp_ops else {
            return;
        };
        match &mut client_channel.sftp_filter {
            Some(filter) => {
                let outcome = filter.feed(data);
                if let Some(handle) = session_handle {
                    for denial in outcome.denials {
                        channel_writer.write(
                            handle.clone(),
                            channel.0,
                            CryptoVec::from_slice(&denial),
                        );
                    }
                }
                if !outcome.forward.is_empty() {
                    let _ = ops.send(ChannelOperation::Data(Bytes::from(outcome.forward)));
                }
            }
            None => {
                let _ = ops.send(ChannelOperation::Data(Bytes::copy_from_slice(data)));
            }
        }
    }

    fn handle_channel_eof(&mut self, channel: ServerChannelId) {
        if let ConnectionMode::Client(client) = &mut self.mode {
            if let Some(client_channel) = client.channels.get_mut(&channel) {
                // Propagate stdin EOF to dedicated channels; the shared
                // PTY stays interactive for the other viewers.
                if let Some(ops) = &client_channel.sftp_ops {
                    let _ = ops.send(ChannelOperation::Eof);
                }
                if let Some(ops) = &client_channel.force_ops {
                    let _ = ops.send(ChannelOperation::Eof);
                }
            }
        }
    }

    fn close_client_channel(&mut self, channel: ServerChannelId) {
        if let ConnectionMode::Client(client) = &mut self.mode {
            if let Some(mut client_channel) = client.channels.remove(&channel) {
                debug!(%channel, client=%client_channel.info.id, "Closing client channel");
                if let Some(task) = client_channel.fanout_task.take() {
                    task.abort();
                }
                if let Some(ops) = client_channel.force_ops.take() {
                    let _ = ops.send(ChannelOperation::Close);
                }
                if let Some(ops) = client_channel.sftp_ops.take() {
                    let _ = ops.send(ChannelOperation::Close);
                }
                if client_channel.joined {
                    client.mux.detach(client_channel.info.id);
                }
            }
        }
    }

    async fn handle_reverse_event(
        &mut self,
        channel: ServerChannelId,
        kind: ReverseKind,
        event: ReverseChannelEvent,
    ) {
        let Some(handle) = self.session_handle.clone() else {
            return;
        };
        match event {
            ReverseChannelEvent::Output(data) => {
                self.channel_writer
                    .write(handle, channel.0, CryptoVec::from_slice(&data));
            }
            ReverseChannelEvent::Eof => {
                self.channel_writer.flush().await;
                let _ = handle.eof(channel.0).await;
            }
            ReverseChannelEvent::Closed => {
                debug!(%channel, ?kind, "Host side of the splice closed");
                self.channel_writer.flush().await;
                let _ = handle.eof(channel.0).await;
                let _ = handle.close(channel.0).await;
                self.close_client_channel(channel);
            }
        }
    }

    async fn publish_session(&mut self, payload: SessionPayload) -> Result<(), UptermError> {
        let (session_id, host_fingerprint) = match &self.mode {
            ConnectionMode::Host(host) => {
                (host.session_id.clone(), host.key_fingerprint.clone())
            }
            _ => return Err(UptermError::InconsistentState),
        };
        let authorized_keys = AuthorizedKeys::parse(&payload.authorized_keys)?;

        let (node_addr, host_url, replay_capacity) = {
            let config = self.services.config.lock().await;
            (
                config.node_addr.clone(),
                config.host_url.clone(),
                config.replay_buffer_size,
            )
        };

        let ssh_user = Identifier::Client {
            session_id: session_id.clone(),
            node_addr: node_addr.clone(),
        }
        .encode();

        let meta = SessionMeta {
            session_id: session_id.clone(),
            node_addr: node_addr.clone(),
            host: host_url,
            ssh_user: ssh_user.clone(),
            command: payload.command,
            force_command: payload.force_command,
            read_only: payload.read_only,
            sftp_disabled: payload.sftp_disabled,
            created_at: time::OffsetDateTime::now_utc(),
        };

        let route = SessionRoute {
            node_addr,
            ssh_user,
            created_at: meta.created_at,
        };
        let lease = self
            .services
            .router
            .publish(&session_id, route)
            .await
            .map_err(|error| match error {
                RoutingError::AlreadyExists(id) => UptermError::SessionAlreadyExists(id),
                other => UptermError::other(other),
            })?;

        let handle = self
            .session_handle
            .clone()
            .ok_or(UptermError::InconsistentState)?;

        let started = SessionMux::start(
            handle,
            meta.clone(),
            authorized_keys,
            self.services.hooks.clone(),
            replay_capacity,
        )
        .await;
        let (mux, mut notice_rx) = match started {
            Ok(started) => started,
            Err(error) => {
                let _ = self.services.router.release(&lease).await;
                return Err(error);
            }
        };

        tokio::spawn({
            let event_tx = self.event_tx.clone();
            async move {
                while let Some(notice) = notice_rx.recv().await {
                    if event_tx.send(Event::Mux(notice)).is_err() {
                        break;
                    }
                }
            }
        });

        let registered = match self.control_handle.take() {
            Some(control) => self
                .services
                .state
                .lock()
                .await
                .register_session(meta.clone(), Box::new(control)),
            None => Err(UptermError::InconsistentState),
        };
        if let Err(error) = registered {
            let _ = self.services.router.release(&lease).await;
            mux.shutdown();
            return Err(error);
        }

        self.muxes
            .lock()
            .await
            .insert(session_id.clone(), mux.clone());
        if let ConnectionMode::Host(host) = &mut self.mode {
            host.published = Some(PublishedSession { lease, mux });
        }

        let descriptor = SessionDescriptor {
            session_id: meta.session_id.clone(),
            host: meta.host.clone(),
            node_addr: meta.node_addr.clone(),
            ssh_user: meta.ssh_user.clone(),
            command: meta.command.clone(),
            force_command: meta.force_command.clone(),
        };
        self.write_payload_reply(&serde_json::to_vec(&descriptor)?);

        info!(session=%session_id, fingerprint=%host_fingerprint, "Session published");
        Ok(())
    }

    /// The payload channel is the one place a host gets a specific
    /// error; clients only ever see a generic handshake failure.
    fn report_publish_error(&self, error: &UptermError) {
        let message = match error {
            UptermError::SessionAlreadyExists(_) => "session already exists",
            _ => "session could not be published",
        };
        if let Ok(encoded) = serde_json::to_vec(&serde_json::json!({ "error": message })) {
            self.write_payload_reply(&encoded);
        }
    }

    fn write_payload_reply(&self, body: &[u8]) {
        let ConnectionMode::Host(host) = &self.mode else {
            return;
        };
        let (Some(channel), Some(handle)) = (host.payload_channel, self.session_handle.clone())
        else {
            return;
        };
        let mut framed = body.to_vec();
        framed.push(b'\n');
        self.channel_writer
            .write(handle, channel.0, CryptoVec::from_slice(&framed));
    }

    async fn cleanup(&mut self) {
        let client_channels: Vec<ServerChannelId> = match &self.mode {
            ConnectionMode::Client(client) => client.channels.keys().copied().collect(),
            _ => vec![],
        };
        for channel in client_channels {
            self.close_client_channel(channel);
        }

        let published = match &mut self.mode {
            ConnectionMode::Host(host) => host.published.take().map(|published| {
                (host.session_id.clone(), published)
            }),
            _ => None,
        };
        if let Some((session_id, published)) = published {
            self.muxes.lock().await.remove(&session_id);
            self.services.state.lock().await.remove_session(&session_id);
            let _ = self.services.router.release(&published.lease).await;
            published.mux.shutdown();
            info!(session=%session_id, "Session closed");
        }

        self.channel_writer.flush().await;
        self.session_handle = None;
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        debug!("Dropped");
    }
}
