use std::fmt::{Display, Formatter};

use bytes::Bytes;
use russh::{ChannelId, Pty};
use uptermd_common::Window;

#[derive(Clone, Debug)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

impl PtyRequest {
    pub fn window(&self) -> Window {
        Window::new(self.col_width, self.row_height)
    }
}

impl From<Window> for PtyRequest {
    fn from(window: Window) -> Self {
        PtyRequest {
            term: "xterm-256color".to_owned(),
            col_width: window.cols,
            row_height: window.rows,
            pix_width: 0,
            pix_height: 0,
            modes: vec![],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Hash, Eq)]
pub struct ServerChannelId(pub ChannelId);

impl Display for ServerChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operations applied to a channel opened on the reverse connection.
#[derive(Clone, Debug)]
pub enum ChannelOperation {
    RequestPty(PtyRequest),
    ResizePty(PtyRequest),
    RequestShell,
    RequestExec(String),
    RequestSubsystem(String),
    Data(Bytes),
    Eof,
    Close,
}
