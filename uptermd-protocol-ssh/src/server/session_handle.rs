use tokio::sync::mpsc;
use uptermd_core::SessionHandle;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionControlCommand {
    Close,
}

/// Registered in the session table so the server can close a published
/// session without touching connection internals.
pub struct SshSessionHandle {
    sender: mpsc::UnboundedSender<SessionControlCommand>,
}

impl SshSessionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionControlCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (SshSessionHandle { sender }, receiver)
    }
}

impl SessionHandle for SshSessionHandle {
    fn close(&mut self) {
        let _ = self.sender.send(SessionControlCommand::Close);
    }
}
