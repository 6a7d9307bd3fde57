use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type NetStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait NetListener: Send {
    /// Accept one connection; returns the stream and the peer address.
    async fn accept(&mut self) -> io::Result<(NetStream, String)>;

    fn local_addr(&self) -> String;
}

/// Network abstraction over listen/dial so cluster behavior can be
/// exercised entirely in-memory.
#[async_trait]
pub trait NetProvider: Send + Sync {
    async fn listen(&self, addr: &str) -> io::Result<Box<dyn NetListener>>;
    async fn dial(&self, addr: &str) -> io::Result<NetStream>;
}

pub struct TcpNetProvider;

struct TcpNetListener {
    inner: TcpListener,
    local_addr: String,
}

#[async_trait]
impl NetListener for TcpNetListener {
    async fn accept(&mut self) -> io::Result<(NetStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[async_trait]
impl NetProvider for TcpNetProvider {
    async fn listen(&self, addr: &str) -> io::Result<Box<dyn NetListener>> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?.to_string();
        Ok(Box::new(TcpNetListener { inner, local_addr }))
    }

    async fn dial(&self, addr: &str) -> io::Result<NetStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

const MEMORY_STREAM_BUFFER: usize = 64 * 1024;

type MemoryBacklog = mpsc::UnboundedSender<(DuplexStream, String)>;

/// In-memory provider: every listen address is a named queue, dials
/// produce paired duplex streams. Used by cluster-mode tests.
#[derive(Clone, Default)]
pub struct MemoryNetProvider {
    listeners: Arc<Mutex<HashMap<String, MemoryBacklog>>>,
}

impl MemoryNetProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryNetListener {
    local_addr: String,
    backlog: mpsc::UnboundedReceiver<(DuplexStream, String)>,
}

#[async_trait]
impl NetListener for MemoryNetListener {
    async fn accept(&mut self) -> io::Result<(NetStream, String)> {
        match self.backlog.recv().await {
            Some((stream, peer)) => Ok((Box::new(stream), peer)),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "listener closed",
            )),
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[async_trait]
impl NetProvider for MemoryNetProvider {
    async fn listen(&self, addr: &str) -> io::Result<Box<dyn NetListener>> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_owned(), tx);
        Ok(Box::new(MemoryNetListener {
            local_addr: addr.to_owned(),
            backlog: rx,
        }))
    }

    async fn dial(&self, addr: &str) -> io::Result<NetStream> {
        let listeners = self.listeners.lock().await;
        let Some(backlog) = listeners.get(addr) else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing is listening on {addr}"),
            ));
        };
        let (near, far) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        backlog
            .send((far, format!("mem://{addr}")))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(Box::new(near))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_memory_listen_dial() {
        let net = MemoryNetProvider::new();
        let mut listener = net.listen("node1:2222").await.unwrap();

        let dialer = net.clone();
        let client = tokio::spawn(async move {
            let mut stream = dialer.dial("node1:2222").await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let (mut stream, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("mem://"));
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();

        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_dial_unbound() {
        let net = MemoryNetProvider::new();
        assert!(net.dial("nowhere:1").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_double_bind() {
        let net = MemoryNetProvider::new();
        let _listener = net.listen("node1:2222").await.unwrap();
        assert!(net.listen("node1:2222").await.is_err());
    }
}
