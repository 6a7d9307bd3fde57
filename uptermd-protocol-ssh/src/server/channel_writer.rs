use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;

#[derive(Debug)]
enum ChannelWriteOperation {
    Data(Handle, ChannelId, CryptoVec),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Sequences data writes and runs them in background to avoid lockups
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<ChannelWriteOperation>,
}

impl ChannelWriter {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelWriteOperation>();
        tokio::spawn(async move {
            while let Some(operation) = rx.recv().await {
                match operation {
                    ChannelWriteOperation::Data(handle, channel, data) => {
                        let _ = handle
                            .data(channel, bytes::Bytes::copy_from_slice(&data))
                            .await;
                    }
                    ChannelWriteOperation::Flush(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
        });
        ChannelWriter { tx }
    }

    pub fn write(&self, handle: Handle, channel: ChannelId, data: CryptoVec) {
        let _ = self
            .tx
            .send(ChannelWriteOperation::Data(handle, channel, data));
    }

    /// Returns once all previously queued writes have completed.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(ChannelWriteOperation::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}
