use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Sink, Stream};
use poem::web::websocket::Message;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Adapts a WebSocket into the byte stream the SSH engine consumes:
/// every `write` becomes one binary frame, every binary frame feeds
/// `read`. Control frames are handled by the WebSocket layer and
/// skipped here; a Close frame is EOF.
pub struct WsStream<S> {
    inner: S,
    read_buf: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: Stream<Item = Result<Message, io::Error>> + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let take = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf.split_to(take));
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(error)),
                Poll::Ready(Some(Ok(message))) => match message {
                    Message::Binary(data) => {
                        self.read_buf = Bytes::from(data);
                    }
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // Ping/Pong are answered by the websocket layer;
                    // text frames have no meaning on this endpoint.
                    _ => continue,
                },
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: Sink<Message, Error = io::Error> + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            Poll::Ready(Ok(())) => (),
        }
        Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec()))?;
        // Opportunistic flush; the caller's poll_flush finishes the job.
        let _ = Pin::new(&mut self.inner).poll_flush(cx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Scripted websocket: pops `incoming` on read, collects writes.
    struct ScriptedWs {
        incoming: VecDeque<Message>,
        sent: Vec<Message>,
    }

    impl Stream for ScriptedWs {
        type Item = Result<Message, io::Error>;

        fn poll_next(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.incoming.pop_front().map(Ok))
        }
    }

    impl Sink<Message> for ScriptedWs {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> io::Result<()> {
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn scripted(frames: Vec<Message>) -> WsStream<ScriptedWs> {
        WsStream::new(ScriptedWs {
            incoming: frames.into(),
            sent: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_binary_frames_concatenate_into_reads() {
        let mut stream = scripted(vec![
            Message::Binary(b"SSH-2.0-".to_vec()),
            Message::Binary(b"uptermd\r\n".to_vec()),
        ]);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"SSH-2.0-uptermd\r\n");
    }

    #[tokio::test]
    async fn test_short_reads_drain_one_frame() {
        let mut stream = scripted(vec![Message::Binary(b"abcdef".to_vec())]);

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn test_non_binary_frames_are_skipped() {
        let mut stream = scripted(vec![
            Message::Ping(vec![1]),
            Message::Text("ignored".to_owned()),
            Message::Binary(b"data".to_vec()),
        ]);

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_close_frame_is_eof() {
        let mut stream = scripted(vec![Message::Close(None)]);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_each_write_is_one_binary_frame() {
        let mut stream = scripted(vec![]);
        stream.write_all(b"first").await.unwrap();
        stream.write_all(b"second").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(stream.inner.sent.len(), 2);
        assert!(matches!(&stream.inner.sent[0], Message::Binary(data) if data[..] == b"first"[..]));
        assert!(matches!(&stream.inner.sent[1], Message::Binary(data) if data[..] == b"second"[..]));
    }
}
