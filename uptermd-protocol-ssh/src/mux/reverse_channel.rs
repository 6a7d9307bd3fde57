use bytes::Bytes;
use russh::server::Msg;
use russh::Channel;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::*;
use uptermd_common::SessionId;

use crate::common::ChannelOperation;

#[derive(Debug)]
pub enum ReverseChannelEvent {
    Output(Bytes),
    Eof,
    Closed,
}

/// Pump task owning one channel opened by the server on the host's
/// reverse connection: the shared PTY channel, a per-client
/// force-command channel, or an SFTP channel. Operations arrive over
/// `ops_rx`; everything the host sends back is surfaced as events.
pub struct ReverseChannel {
    channel: Channel<Msg>,
    ops_rx: UnboundedReceiver<ChannelOperation>,
    events_tx: UnboundedSender<ReverseChannelEvent>,
    session_id: SessionId,
}

impl ReverseChannel {
    pub fn new(
        channel: Channel<Msg>,
        ops_rx: UnboundedReceiver<ChannelOperation>,
        events_tx: UnboundedSender<ReverseChannelEvent>,
        session_id: SessionId,
    ) -> Self {
        ReverseChannel {
            channel,
            ops_rx,
            events_tx,
            session_id,
        }
    }

    pub async fn run(mut self) -> Result<(), russh::Error> {
        loop {
            tokio::select! {
                op = self.ops_rx.recv() => {
                    match op {
                        Some(ChannelOperation::Data(data)) => {
                            self.channel.data(&*data).await?;
                        }
                        Some(ChannelOperation::RequestPty(request)) => {
                            self.channel.request_pty(
                                true,
                                &request.term,
                                request.col_width,
                                request.row_height,
                                request.pix_width,
                                request.pix_height,
                                &request.modes,
                            ).await?;
                        }
                        Some(ChannelOperation::ResizePty(request)) => {
                            self.channel.window_change(
                                request.col_width,
                                request.row_height,
                                request.pix_width,
                                request.pix_height,
                            ).await?;
                        }
                        Some(ChannelOperation::RequestShell) => {
                            self.channel.request_shell(true).await?;
                        }
                        Some(ChannelOperation::RequestExec(command)) => {
                            self.channel.exec(true, command).await?;
                        }
                        Some(ChannelOperation::RequestSubsystem(name)) => {
                            self.channel.request_subsystem(true, &name).await?;
                        }
                        Some(ChannelOperation::Eof) => {
                            self.channel.eof().await?;
                        }
                        Some(ChannelOperation::Close) => break,
                        None => break,
                    }
                }
                channel_event = self.channel.wait() => {
                    match channel_event {
                        Some(russh::ChannelMsg::Data { data }) => {
                            let bytes: &[u8] = &data;
                            let _ = self.events_tx.send(ReverseChannelEvent::Output(
                                Bytes::from(bytes.to_vec()),
                            ));
                        }
                        Some(russh::ChannelMsg::ExtendedData { data, .. }) => {
                            let bytes: &[u8] = &data;
                            let _ = self.events_tx.send(ReverseChannelEvent::Output(
                                Bytes::from(bytes.to_vec()),
                            ));
                        }
                        Some(russh::ChannelMsg::Eof) => {
                            let _ = self.events_tx.send(ReverseChannelEvent::Eof);
                        }
                        Some(russh::ChannelMsg::Close) => {
                            let _ = self.events_tx.send(ReverseChannelEvent::Closed);
                            break;
                        }
                        Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                            debug!(session=%self.session_id, %exit_status, "Host channel exited");
                        }
                        Some(russh::ChannelMsg::Success) => (),
                        Some(russh::ChannelMsg::Failure) => {
                            warn!(session=%self.session_id, "Host rejected a channel request");
                        }
                        Some(russh::ChannelMsg::WindowAdjusted { .. }) => (),
                        Some(msg) => {
                            debug!(session=%self.session_id, ?msg, "Unhandled channel message");
                        }
                        None => {
                            let _ = self.events_tx.send(ReverseChannelEvent::Closed);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for ReverseChannel {
    fn drop(&mut self) {
        debug!(session=%self.session_id, "Reverse channel closed");
    }
}
