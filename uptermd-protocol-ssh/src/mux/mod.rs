mod replay;
mod reverse_channel;
mod window;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use replay::ReplayBuffer;
pub use reverse_channel::{ReverseChannel, ReverseChannelEvent};
use russh::keys::PublicKey;
use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::*;
use uptermd_common::helpers::keys::AuthorizedKeys;
use uptermd_common::{ClientInfo, SessionMeta, UptermError, Window};
use uptermd_core::SessionHooks;
use uuid::Uuid;
use window::WindowMap;

use crate::common::{ChannelOperation, PtyRequest};

/// Frames buffered per attachment before a slow viewer starts losing
/// output. The host side is never dropped.
const FANOUT_BUFFER: usize = 256;

const INITIAL_PTY_SIZE: Window = Window { cols: 80, rows: 24 };

#[derive(Debug)]
pub enum MuxNotice {
    /// The host's PTY channel is gone; the session is over.
    Ended,
}

#[derive(Debug)]
enum MuxCommand {
    Attach {
        client: ClientInfo,
        window: Window,
        reply: oneshot::Sender<Attachment>,
    },
    /// A viewer on its own force-command channel: joins the session's
    /// client list but not the shared PTY.
    Register {
        client: ClientInfo,
    },
    Detach {
        client_id: Uuid,
    },
    WindowChange {
        client_id: Uuid,
        window: Window,
    },
    Stdin(Bytes),
    Shutdown,
}

/// What a freshly attached viewer receives: a snapshot of recent output
/// and the live fan-out stream.
pub struct Attachment {
    pub replay: Bytes,
    pub output: broadcast::Receiver<Bytes>,
}

enum HookEvent {
    Joined(ClientInfo),
    Left(ClientInfo),
}

/// Shared entry point to a published session. Everything going through
/// `command_tx` is applied by the session's single event loop; reverse
/// channels for force-command and SFTP are opened directly on the host
/// handle since they bypass the shared PTY entirely.
#[derive(Clone)]
pub struct MuxHandle {
    meta: SessionMeta,
    authorized_keys: Arc<AuthorizedKeys>,
    host_handle: Handle,
    command_tx: UnboundedSender<MuxCommand>,
}

impl MuxHandle {
    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn accepts_any_key(&self) -> bool {
        self.authorized_keys.is_empty()
    }

    pub fn admits(&self, key: &PublicKey) -> bool {
        self.authorized_keys.admits(key)
    }

    pub async fn attach(
        &self,
        client: ClientInfo,
        window: Window,
    ) -> Result<Attachment, UptermError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(MuxCommand::Attach {
                client,
                window,
                reply,
            })
            .map_err(|_| UptermError::SessionEnd)?;
        rx.await.map_err(|_| UptermError::SessionEnd)
    }

    pub fn register(&self, client: ClientInfo) {
        let _ = self.command_tx.send(MuxCommand::Register { client });
    }

    pub fn detach(&self, client_id: Uuid) {
        let _ = self.command_tx.send(MuxCommand::Detach { client_id });
    }

    pub fn window_change(&self, client_id: Uuid, window: Window) {
        let _ = self
            .command_tx
            .send(MuxCommand::WindowChange { client_id, window });
    }

    pub fn write_stdin(&self, data: Bytes) {
        let _ = self.command_tx.send(MuxCommand::Stdin(data));
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(MuxCommand::Shutdown);
    }

    /// Open a fresh channel on the reverse connection (force-command and
    /// SFTP attachments run on their own channels).
    pub async fn open_reverse_channel(&self) -> Result<Channel<Msg>, UptermError> {
        Ok(self.host_handle.channel_open_session().await?)
    }
}

/// Per-session event loop. Sole writer of the attachment map; all I/O
/// pumps post into it over channels.
pub struct SessionMux {
    meta: SessionMeta,
    windows: WindowMap,
    clients: HashMap<Uuid, ClientInfo>,
    fanout: broadcast::Sender<Bytes>,
    replay: ReplayBuffer,
    host_ops: UnboundedSender<ChannelOperation>,
    hook_tx: UnboundedSender<HookEvent>,
    notice_tx: UnboundedSender<MuxNotice>,
    command_rx: UnboundedReceiver<MuxCommand>,
    host_events_rx: UnboundedReceiver<ReverseChannelEvent>,
    pty_size: Option<Window>,
}

impl SessionMux {
    /// Bring the session up: open the PTY channel back into the host,
    /// start the wrapped program, fire `session_created`, and hand out
    /// the shared handle. An error from the hook aborts the bring-up.
    pub async fn start(
        host_handle: Handle,
        meta: SessionMeta,
        authorized_keys: AuthorizedKeys,
        hooks: Arc<dyn SessionHooks>,
        replay_capacity: usize,
    ) -> Result<(MuxHandle, UnboundedReceiver<MuxNotice>), UptermError> {
        let channel = host_handle.channel_open_session().await?;

        let (host_ops_tx, host_ops_rx) = unbounded_channel();
        let (host_events_tx, host_events_rx) = unbounded_channel();
        let pump = ReverseChannel::new(
            channel,
            host_ops_rx,
            host_events_tx,
            meta.session_id.clone(),
        );

        let _ = host_ops_tx.send(ChannelOperation::RequestPty(PtyRequest::from(
            INITIAL_PTY_SIZE,
        )));
        if meta.command.is_empty() {
            let _ = host_ops_tx.send(ChannelOperation::RequestShell);
        } else {
            let _ = host_ops_tx.send(ChannelOperation::RequestExec(meta.command.join(" ")));
        }

        hooks.session_created(&meta).await?;

        let session_id = meta.session_id.clone();
        tokio::spawn(async move {
            if let Err(error) = pump.run().await {
                warn!(session=%session_id, %error, "Host PTY channel failed");
            }
        });

        let (command_tx, command_rx) = unbounded_channel();
        let (notice_tx, notice_rx) = unbounded_channel();
        let (hook_tx, hook_rx) = unbounded_channel();
        tokio::spawn(run_hook_worker(hooks, hook_rx));

        let fanout = broadcast::channel(FANOUT_BUFFER).0;

        let mux = SessionMux {
            meta: meta.clone(),
            windows: WindowMap::new(),
            clients: HashMap::new(),
            fanout,
            replay: ReplayBuffer::new(replay_capacity),
            host_ops: host_ops_tx,
            hook_tx,
            notice_tx,
            command_rx,
            host_events_rx,
            pty_size: Some(INITIAL_PTY_SIZE),
        };
        tokio::spawn(mux.run());

        Ok((
            MuxHandle {
                meta,
                authorized_keys: Arc::new(authorized_keys),
                host_handle,
                command_tx,
            },
            notice_rx,
        ))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.host_events_rx.recv() => {
                    match event {
                        Some(ReverseChannelEvent::Output(data)) => {
                            self.replay.push(&data);
                            // Only fails when nobody is attached.
                            let _ = self.fanout.send(data);
                        }
                        Some(ReverseChannelEvent::Eof) | Some(ReverseChannelEvent::Closed) | None => {
                            debug!(session=%self.meta.session_id, "Host PTY stream ended");
                            break;
                        }
                    }
                }
            }
        }
        self.finish();
    }

    fn handle_command(&mut self, command: MuxCommand) -> bool {
        match command {
            MuxCommand::Attach {
                client,
                window,
                reply,
            } => {
                info!(session=%self.meta.session_id, client=%client.id, "Client attached");
                self.windows.set(client.id, window);
                self.clients.insert(client.id, client.clone());
                let _ = self.hook_tx.send(HookEvent::Joined(client));
                self.reconcile_pty_size();
                let _ = reply.send(Attachment {
                    replay: self.replay.snapshot(),
                    output: self.fanout.subscribe(),
                });
            }
            MuxCommand::Register { client } => {
                info!(session=%self.meta.session_id, client=%client.id, "Client joined (dedicated channel)");
                self.clients.insert(client.id, client.clone());
                let _ = self.hook_tx.send(HookEvent::Joined(client));
            }
            MuxCommand::Detach { client_id } => {
                if let Some(client) = self.clients.remove(&client_id) {
                    self.windows.remove(&client_id);
                    info!(
                        session=%self.meta.session_id,
                        client=%client_id,
                        attachments=self.windows.len(),
                        "Client detached"
                    );
                    let _ = self.hook_tx.send(HookEvent::Left(client));
                    self.reconcile_pty_size();
                }
            }
            MuxCommand::WindowChange { client_id, window } => {
                if self.clients.contains_key(&client_id) {
                    self.windows.set(client_id, window);
                    self.reconcile_pty_size();
                }
            }
            MuxCommand::Stdin(data) => {
                if !self.meta.read_only {
                    let _ = self.host_ops.send(ChannelOperation::Data(data));
                }
            }
            MuxCommand::Shutdown => return true,
        }
        false
    }

    /// The host PTY follows the smallest attached window in each
    /// dimension; an empty attachment set leaves the last size.
    fn reconcile_pty_size(&mut self) {
        if let Some(size) = self.windows.effective() {
            if self.pty_size != Some(size) {
                debug!(session=%self.meta.session_id, cols=size.cols, rows=size.rows, "Resizing host PTY");
                self.pty_size = Some(size);
                let _ = self
                    .host_ops
                    .send(ChannelOperation::ResizePty(size.into()));
            }
        }
    }

    fn finish(mut self) {
        let _ = self.host_ops.send(ChannelOperation::Close);
        for (_, client) in self.clients.drain() {
            let _ = self.hook_tx.send(HookEvent::Left(client));
        }
        let _ = self.notice_tx.send(MuxNotice::Ended);
        // Dropping the fan-out sender gives every attachment EOF.
    }
}

async fn run_hook_worker(hooks: Arc<dyn SessionHooks>, mut rx: UnboundedReceiver<HookEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            HookEvent::Joined(client) => hooks.client_joined(&client).await,
            HookEvent::Left(client) => hooks.client_left(&client).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use time::OffsetDateTime;

    use super::*;

    fn test_meta(read_only: bool) -> SessionMeta {
        SessionMeta {
            session_id: "s1".to_owned(),
            node_addr: "127.0.0.1:2222".to_owned(),
            host: "ssh://127.0.0.1:2222".to_owned(),
            ssh_user: "s1:MTI3LjAuMC4xOjIyMjI".to_owned(),
            command: vec!["bash".to_owned(), "--norc".to_owned()],
            force_command: vec![],
            read_only,
            sftp_disabled: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    struct TestRig {
        command_tx: UnboundedSender<MuxCommand>,
        host_ops_rx: UnboundedReceiver<ChannelOperation>,
        host_events_tx: UnboundedSender<ReverseChannelEvent>,
        notice_rx: UnboundedReceiver<MuxNotice>,
    }

    fn spawn_mux(meta: SessionMeta, hooks: Arc<dyn SessionHooks>) -> TestRig {
        let (command_tx, command_rx) = unbounded_channel();
        let (host_ops_tx, host_ops_rx) = unbounded_channel();
        let (host_events_tx, host_events_rx) = unbounded_channel();
        let (notice_tx, notice_rx) = unbounded_channel();
        let (hook_tx, hook_rx) = unbounded_channel();
        tokio::spawn(run_hook_worker(hooks, hook_rx));

        let mux = SessionMux {
            meta,
            windows: WindowMap::new(),
            clients: HashMap::new(),
            fanout: broadcast::channel(FANOUT_BUFFER).0,
            replay: ReplayBuffer::new(1024),
            host_ops: host_ops_tx,
            hook_tx,
            notice_tx,
            command_rx,
            host_events_rx,
            pty_size: Some(INITIAL_PTY_SIZE),
        };
        tokio::spawn(mux.run());

        TestRig {
            command_tx,
            host_ops_rx,
            host_events_tx,
            notice_rx,
        }
    }

    fn client(id: Uuid) -> ClientInfo {
        ClientInfo {
            id,
            session_id: "s1".to_owned(),
            public_key_fingerprint: String::new(),
            ssh_client_version: "SSH-2.0-upterm-client-1.0.0".to_owned(),
            addr: "mem://test".to_owned(),
        }
    }

    async fn attach(rig: &TestRig, id: Uuid, window: Window) -> Attachment {
        let (reply, rx) = oneshot::channel();
        rig.command_tx
            .send(MuxCommand::Attach {
                client: client(id),
                window,
                reply,
            })
            .unwrap();
        rx.await.unwrap()
    }

    async fn expect_resize(rig: &mut TestRig, expected: Window) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rig.host_ops_rx.recv())
                .await
                .expect("timed out waiting for resize")
                .expect("host ops channel closed")
            {
                ChannelOperation::ResizePty(request) => {
                    assert_eq!(request.window(), expected);
                    return;
                }
                ChannelOperation::Data(_) => panic!("unexpected stdin write"),
                _ => continue,
            }
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        joined: AtomicUsize,
        left: AtomicUsize,
    }

    #[async_trait]
    impl SessionHooks for CountingHooks {
        async fn client_joined(&self, _client: &ClientInfo) {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }

        async fn client_left(&self, _client: &ClientInfo) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_resize_follows_minimum() {
        let mut rig = spawn_mux(test_meta(false), Arc::new(NoopTestHooks));

        let small = Uuid::new_v4();
        let large = Uuid::new_v4();
        let _a = attach(&rig, small, Window::new(70, 20)).await;
        expect_resize(&mut rig, Window::new(70, 20)).await;

        // A larger viewer does not shrink the PTY further.
        let _b = attach(&rig, large, Window::new(100, 40)).await;

        rig.command_tx
            .send(MuxCommand::Detach { client_id: small })
            .unwrap();
        expect_resize(&mut rig, Window::new(100, 40)).await;
    }

    #[tokio::test]
    async fn test_output_fans_out_and_replays() {
        let rig = spawn_mux(test_meta(false), Arc::new(NoopTestHooks));

        rig.host_events_tx
            .send(ReverseChannelEvent::Output(Bytes::from_static(b"early ")))
            .unwrap();
        // Let the loop absorb the output before attaching; commands and
        // host events arrive on separate channels.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut attachment = attach(&rig, Uuid::new_v4(), Window::new(80, 24)).await;
        assert_eq!(&*attachment.replay, b"early ");

        rig.host_events_tx
            .send(ReverseChannelEvent::Output(Bytes::from_static(b"hello")))
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), attachment.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*received, b"hello");
    }

    #[tokio::test]
    async fn test_read_only_discards_stdin() {
        let mut rig = spawn_mux(test_meta(true), Arc::new(NoopTestHooks));
        let _a = attach(&rig, Uuid::new_v4(), Window::new(80, 24)).await;

        rig.command_tx
            .send(MuxCommand::Stdin(Bytes::from_static(b"rm -rf /\n")))
            .unwrap();
        rig.command_tx.send(MuxCommand::Shutdown).unwrap();

        // Drain the remaining ops; no Data may appear.
        while let Some(op) = rig.host_ops_rx.recv().await {
            assert!(!matches!(op, ChannelOperation::Data(_)));
        }
    }

    #[tokio::test]
    async fn test_host_eof_ends_session_and_fires_left() {
        let hooks = Arc::new(CountingHooks::default());
        let mut rig = spawn_mux(test_meta(false), hooks.clone());

        let mut attachment = attach(&rig, Uuid::new_v4(), Window::new(80, 24)).await;
        rig.host_events_tx.send(ReverseChannelEvent::Eof).unwrap();

        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), rig.notice_rx.recv())
                .await
                .unwrap(),
            Some(MuxNotice::Ended)
        ));
        // Fan-out closed towards the attachment.
        loop {
            match attachment.output.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Ok(_) => continue,
            }
        }

        // joined == left once the hook queue drains.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if hooks.left.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hooks.joined.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.left.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detach_fires_left_exactly_once() {
        let hooks = Arc::new(CountingHooks::default());
        let rig = spawn_mux(test_meta(false), hooks.clone());

        let id = Uuid::new_v4();
        let _a = attach(&rig, id, Window::new(80, 24)).await;
        rig.command_tx
            .send(MuxCommand::Detach { client_id: id })
            .unwrap();
        rig.command_tx
            .send(MuxCommand::Detach { client_id: id })
            .unwrap();
        rig.command_tx.send(MuxCommand::Shutdown).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if hooks.left.load(Ordering::SeqCst) >= 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.joined.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.left.load(Ordering::SeqCst), 1);
    }

    struct NoopTestHooks;

    #[async_trait]
    impl SessionHooks for NoopTestHooks {}
}
