//! Production transport: length-prefixed [`WireFrame`]s over plain
//! TCP. TLS termination is left to a `TcpStream` wrapper supplied by
//! the surrounding deployment (e.g. a reverse proxy); this module only
//! owns framing and reconnect behavior, not certificate material.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::{IngressHandler, PeerConnector, PeerLink, PeerTransport, WireFrame};
use crate::error::*;

/// A live TCP connection, split into independently lockable halves so
/// reads and writes never block each other.
pub struct TcpLink {
    read_half: Mutex<tokio::net::tcp::OwnedReadHalf>,
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpLink {
    fn new(stream: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        Arc::new(TcpLink {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
        })
    }
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        let bytes = frame.encode();
        let mut w = self.write_half.lock().await;
        w.write_all(&bytes).await.wrapped(ErrorKind::Transport)?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<WireFrame> {
        let mut r = self.read_half.lock().await;
        let mut header = [0u8; 9];
        r.read_exact(&mut header).await.wrapped(ErrorKind::Transport)?;
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await.wrapped(ErrorKind::Transport)?;
        let mut full = header.to_vec();
        full.extend_from_slice(&body);
        WireFrame::decode(&full)
    }
}

/// Dials peer agencies over plain TCP.
pub struct TcpTransport {
    /// The agency id we announce in the handshake frame when we are
    /// the one initiating the connection.
    local_agency_id: String,
}

impl TcpTransport {
    pub fn new(local_agency_id: impl Into<String>) -> Self {
        TcpTransport {
            local_agency_id: local_agency_id.into(),
        }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerLink>> {
        let stream = TcpStream::connect(endpoint)
            .await
            .wrapped(ErrorKind::Transport)?;
        let link = TcpLink::new(stream);

        // handshake: announce our agency id so the peer's accept loop
        // can bind this socket to the right session
        let handshake = WireFrame {
            seq: crate::message::TransportSeq(0),
            is_response: false,
            payload: self.local_agency_id.as_bytes().to_vec(),
        };
        link.send_frame(&handshake).await?;

        Ok(link as Arc<dyn PeerLink>)
    }
}

/// Listens for inbound connections from peer agencies, reads their
/// handshake frame, and installs the resulting link into the
/// [`PeerConnector`] as that agency's live session.
pub async fn accept_loop(
    listener: TcpListener,
    connector: Arc<PeerConnector>,
    ingress: Arc<dyn IngressHandler>,
    running: crate::async_runtime::RunningFlag,
) {
    while running.is_running() {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept() failed");
                continue;
            }
        };
        let connector = connector.clone();
        let ingress = ingress.clone();
        tokio::spawn(async move {
            let link = TcpLink::new(stream);
            let handshake = match link.recv_frame().await {
                Ok(f) => f,
                Err(_) => return,
            };
            let agency = match String::from_utf8(handshake.payload) {
                Ok(a) => a,
                Err(_) => return,
            };
            tracing::info!(agency = agency.as_str(), %addr, "inbound peer handshake");
            connector.accept_inbound(&agency, link, ingress).await;
        });
    }
}
