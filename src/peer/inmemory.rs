//! In-process transport for exercising two (or more) `PeerConnector`s
//! talking to each other without opening real sockets, the way the
//! bundled local-loopback demos wire up a client and a node in the
//! same process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{PeerLink, PeerTransport, WireFrame};
use crate::error::*;

/// One end of an in-memory duplex connection: frames sent on one end
/// arrive as `recv_frame` results on the other.
struct DuplexLink {
    tx: mpsc::UnboundedSender<WireFrame>,
    rx: Mutex<mpsc::UnboundedReceiver<WireFrame>>,
}

impl DuplexLink {
    fn pair() -> (Arc<dyn PeerLink>, Arc<dyn PeerLink>) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        let a = Arc::new(DuplexLink {
            tx: tx_a,
            rx: Mutex::new(rx_a),
        });
        let b = Arc::new(DuplexLink {
            tx: tx_b,
            rx: Mutex::new(rx_b),
        });
        (a, b)
    }
}

#[async_trait]
impl PeerLink for DuplexLink {
    async fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        self.tx
            .send(frame.clone())
            .map_err(|_| "in-memory peer closed")
            .simple(ErrorKind::Transport)
    }

    async fn recv_frame(&self) -> Result<WireFrame> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(()).simple(ErrorKind::Transport)
    }
}

/// A [`PeerTransport`] hardwired to a single pre-established link, as
/// produced by [`InMemoryTransport::paired_pair`]. `connect` ignores
/// the requested endpoint string and always hands back that link —
/// there is exactly one peer on the other end of an in-memory pair.
pub struct InMemoryTransport {
    link: Arc<dyn PeerLink>,
}

impl InMemoryTransport {
    /// Builds two transports wired directly to each other: the first
    /// plays the role of the `local_name` side (its `connect` calls
    /// reach the second transport), the second plays `remote_name`.
    /// The names exist only for readability at call sites; the pair
    /// is connected regardless of what endpoint string either side
    /// dials.
    pub fn paired_pair(_remote_name: &str, _local_name: &str) -> (InMemoryTransport, InMemoryTransport) {
        let (link_local, link_remote) = DuplexLink::pair();
        (
            InMemoryTransport { link: link_local },
            InMemoryTransport { link: link_remote },
        )
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn PeerLink>> {
        Ok(self.link.clone())
    }
}
