//! Transparent TCP proxy group (spec §4.3).
//!
//! Multiplexes N `listen-addr -> dial-addr` streams. Each stream gets a
//! dedicated accept loop; each accepted connection spawns a bidirectional
//! byte-copy task. `beforeAccept` fires once per stream right before that
//! stream starts accepting; `error` events surface listener-setup failures,
//! except `AddrInUse`, which is treated as "already served" (spec §4.3).

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// Lifecycle events a caller can observe while a stream is being set up.
#[derive(Debug)]
pub enum ProxyEvent {
    /// Fired once per stream right before its listener starts accepting.
    BeforeAccept { listen_addr: SocketAddr },
    /// A listener failed to bind (anything other than address-in-use).
    Error { listen_addr: SocketAddr, error: String },
    /// All streams have wound down after `close()`.
    GroupClosed,
}

struct Stream {
    listen_addr: SocketAddr,
    dial_addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// A group of TCP forwarding streams.
pub struct ProxyGroup {
    streams: Vec<Stream>,
    events_tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl ProxyGroup {
    /// Create an empty group, returning it along with the event receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                streams: Vec::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Add one `listen_addr,dial_addr` stream. Blocks until the listener is
    /// bound (or tolerated as already-in-use). On success, a
    /// `BeforeAccept` event has already been emitted for this stream by the
    /// time this returns.
    pub async fn add_stream(
        &mut self,
        listen_addr: SocketAddr,
        dial_addr: SocketAddr,
    ) -> Result<(), ProxyError> {
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(l) => l,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(%listen_addr, "address already in use, assuming target already served");
                return Ok(());
            }
            Err(err) => {
                let _ = self.events_tx.send(ProxyEvent::Error {
                    listen_addr,
                    error: err.to_string(),
                });
                return Err(ProxyError::Bind {
                    addr: listen_addr.to_string(),
                    source: err,
                });
            }
        };

        let _ = self
            .events_tx
            .send(ProxyEvent::BeforeAccept { listen_addr });

        let handle = tokio::spawn(accept_loop(listener, dial_addr));
        self.streams.push(Stream {
            listen_addr,
            dial_addr,
            handle,
        });
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// `(listen_addr, dial_addr)` for every active stream.
    pub fn streams(&self) -> impl Iterator<Item = (SocketAddr, SocketAddr)> + '_ {
        self.streams.iter().map(|s| (s.listen_addr, s.dial_addr))
    }

    /// Release all listeners.
    pub async fn close(&mut self) {
        for stream in self.streams.drain(..) {
            stream.handle.abort();
        }
        let _ = self.events_tx.send(ProxyEvent::GroupClosed);
    }
}

async fn accept_loop(listener: TcpListener, dial_addr: SocketAddr) {
    loop {
        let (inbound, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "proxy accept failed");
                continue;
            }
        };
        debug!(%peer, %dial_addr, "accepted proxy connection");
        tokio::spawn(forward(inbound, dial_addr));
    }
}

async fn forward(mut inbound: TcpStream, dial_addr: SocketAddr) {
    let mut outbound = match TcpStream::connect(dial_addr).await {
        Ok(s) => s,
        Err(err) => {
            warn!(%dial_addr, %err, "proxy dial failed");
            return;
        }
    };
    if let Err(err) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        debug!(%err, "proxy connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwards_bytes_to_dial_addr() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (mut group, mut events) = ProxyGroup::new();
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Bind on an ephemeral port by pre-binding to learn the address.
        let probe = TcpListener::bind(listen_addr).await.unwrap();
        let listen_addr = probe.local_addr().unwrap();
        drop(probe);

        group.add_stream(listen_addr, backend_addr).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ProxyEvent::BeforeAccept { .. })
        ));

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"hello");

        group.close().await;
    }

    #[tokio::test]
    async fn address_in_use_is_tolerated() {
        let listen_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let held = TcpListener::bind(listen_addr).await.unwrap();
        let listen_addr = held.local_addr().unwrap();

        let (mut group, _events) = ProxyGroup::new();
        let result = group.add_stream(listen_addr, "127.0.0.1:1".parse().unwrap()).await;
        assert!(result.is_ok());
        assert_eq!(group.stream_count(), 0);
    }
}
