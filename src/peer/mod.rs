//! The `PeerConnector` is the transport multiplexor connecting this
//! gateway to its peer agencies: one `PeerSession` per configured or
//! dynamically-registered agency, a reconnect timer that dials
//! unreachable peers, and a `send` operation that correlates an
//! outbound frame with its wire-level ack.

pub mod framing;
pub mod inmemory;
pub mod tcp;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::async_runtime::RunningFlag;
use crate::collections::{self, HashMap};
use crate::error::*;
use crate::message::{AckStatus, TransportSeq};

pub use framing::WireFrame;

/// Default frame-size ceiling: 100 MiB.
pub const DEFAULT_MAX_MSG_SIZE: usize = 100 * 1024 * 1024;
/// Lower clamp for the configured frame-size ceiling: 10 MiB.
pub const MIN_MAX_MSG_SIZE: usize = 10 * 1024 * 1024;
/// Upper clamp for the configured frame-size ceiling: 1 GiB.
pub const MAX_MAX_MSG_SIZE: usize = 1024 * 1024 * 1024;

/// Default interval between reconnect attempts: 10 seconds.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Clamps a configured max-message-size (in bytes) into
/// `[MIN_MAX_MSG_SIZE, MAX_MAX_MSG_SIZE]`.
pub fn clamp_max_msg_size(bytes: usize) -> usize {
    bytes.clamp(MIN_MAX_MSG_SIZE, MAX_MAX_MSG_SIZE)
}

/// A live, bidirectional connection to a peer gateway, abstracted so
/// the production TCP implementation and the in-memory test harness
/// both satisfy it.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send_frame(&self, frame: &WireFrame) -> Result<()>;
    async fn recv_frame(&self) -> Result<WireFrame>;
}

/// Dials a peer agency's endpoint, returning a live link on success.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerLink>>;
}

/// Handle to reply on the exact connection a request arrived on.
///
/// This is what the `Gateway`'s ack-slot map stores as the
/// "originating session", per the routing core's data model.
#[derive(Clone)]
pub struct SessionHandle {
    agency: String,
    outbound: mpsc::UnboundedSender<WireFrame>,
}

impl SessionHandle {
    pub fn agency(&self) -> &str {
        &self.agency
    }

    /// Sends a reply frame back on this same connection.
    pub fn reply(&self, seq: TransportSeq, payload: Vec<u8>) -> Result<()> {
        self.outbound
            .send(WireFrame {
                seq,
                is_response: true,
                payload,
            })
            .map_err(|_| "peer session closed")
            .simple(ErrorKind::Transport)
    }
}

/// Invoked for every inbound frame that is not a reply to one of our
/// own outbound sends (i.e. every frame the peer originated).
#[async_trait]
pub trait IngressHandler: Send + Sync {
    async fn on_peer_frame(&self, session: SessionHandle, frame: WireFrame);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    Connecting,
    Connected,
    Unreachable,
}

struct PeerSession {
    endpoints: Vec<String>,
    state: PeerState,
    outbound: Option<mpsc::UnboundedSender<WireFrame>>,
    pending: Arc<RwLock<HashMap<u32, oneshot::Sender<WireFrame>>>>,
}

impl PeerSession {
    fn new(endpoints: Vec<String>) -> Self {
        PeerSession {
            endpoints,
            state: PeerState::Unreachable,
            outbound: None,
            pending: Arc::new(RwLock::new(collections::new_map())),
        }
    }
}

/// Owns, for each configured or dynamically registered peer agency, a
/// session containing an ordered list of endpoints and the
/// currently-live connection, if any.
pub struct PeerConnector {
    transport: Arc<dyn PeerTransport>,
    sessions: RwLock<HashMap<String, PeerSession>>,
    unreachable: RwLock<HashSet<String>>,
    max_msg_size: usize,
    reconnect_interval: Duration,
    running: RunningFlag,
}

impl PeerConnector {
    pub fn new(transport: Arc<dyn PeerTransport>, max_msg_size: usize, reconnect_interval: Duration) -> Arc<Self> {
        Arc::new(PeerConnector {
            transport,
            sessions: RwLock::new(collections::new_map()),
            unreachable: RwLock::new(HashSet::new()),
            max_msg_size: clamp_max_msg_size(max_msg_size),
            reconnect_interval,
            running: RunningFlag::new(),
        })
    }

    /// Attempts to dial each configured peer once. Any peer that
    /// fails to dial is added to the unreachable set, to be retried by
    /// the reconnect timer.
    pub async fn start(
        self: &Arc<Self>,
        peers: Vec<(String, Vec<String>)>,
        ingress: Arc<dyn IngressHandler>,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            for (agency, endpoints) in peers {
                sessions.insert(agency, PeerSession::new(endpoints));
            }
        }

        let agencies: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for agency in agencies {
            self.dial(&agency, ingress.clone()).await;
        }

        let this = self.clone();
        let running = self.running.clone();
        let ingress_for_timer = ingress;
        tokio::spawn(async move {
            this.reconnect_loop(running, ingress_for_timer).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, running: RunningFlag, ingress: Arc<dyn IngressHandler>) {
        while running.is_running() {
            if !crate::async_runtime::sleep_cancellable(self.reconnect_interval, &running).await {
                break;
            }
            let unreachable: Vec<String> = self.unreachable.read().await.iter().cloned().collect();
            for agency in unreachable {
                self.dial(&agency, ingress.clone()).await;
            }
        }
    }

    async fn dial(self: &Arc<Self>, agency: &str, ingress: Arc<dyn IngressHandler>) {
        let endpoints = {
            let sessions = self.sessions.read().await;
            match sessions.get(agency) {
                Some(s) => s.endpoints.clone(),
                None => return,
            }
        };

        let mut connected_link = None;
        for endpoint in &endpoints {
            if let Ok(link) = self.transport.connect(endpoint).await {
                connected_link = Some(link);
                break;
            }
        }

        let Some(link) = connected_link else {
            self.unreachable.write().await.insert(agency.to_owned());
            tracing::warn!(agency, "peer unreachable, will retry on next reconnect tick");
            return;
        };

        self.install_link(agency, endpoints, link, ingress).await;
        tracing::info!(agency, "peer connected");
    }

    /// Installs a live link as the current connection for `agency`,
    /// wiring up its reader and writer tasks. Shared by the outbound
    /// dial path and the inbound accept path (a peer that connects to
    /// us is just as usable a session as one we dialed ourselves).
    async fn install_link(
        self: &Arc<Self>,
        agency: &str,
        endpoints: Vec<String>,
        link: Arc<dyn PeerLink>,
        ingress: Arc<dyn IngressHandler>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(agency.to_owned())
                .or_insert_with(|| PeerSession::new(endpoints.clone()));
            session.state = PeerState::Connected;
            session.outbound = Some(outbound_tx.clone());
            session.pending.clone()
        };
        self.unreachable.write().await.remove(agency);

        spawn_writer(link.clone(), outbound_rx);
        spawn_reader(
            agency.to_owned(),
            link,
            pending,
            outbound_tx,
            ingress,
            self.clone(),
        );
    }

    /// Accepts a connection a peer initiated towards us, identified as
    /// belonging to `agency` by the transport's handshake.
    pub async fn accept_inbound(
        self: &Arc<Self>,
        agency: &str,
        link: Arc<dyn PeerLink>,
        ingress: Arc<dyn IngressHandler>,
    ) {
        let endpoints = {
            let sessions = self.sessions.read().await;
            sessions.get(agency).map(|s| s.endpoints.clone()).unwrap_or_default()
        };
        self.install_link(agency, endpoints, link, ingress).await;
        tracing::info!(agency, "accepted inbound peer connection");
    }

    /// Sends `frame` to `agency`, awaiting the peer's ack within
    /// `timeout`. Translates the three-token ack vocabulary into a
    /// `Result`: `"success"` is `Ok(())`, `"error"`/`"timeout"` and any
    /// transport-level timeout or error are `Err(Transport)`.
    pub async fn send(&self, agency: &str, frame: WireFrame, timeout: Duration) -> Result<()> {
        if frame.payload.len() > self.max_msg_size {
            return Err("outgoing frame exceeds max_allow_msg_size").simple(ErrorKind::Protocol);
        }

        let (outbound, pending) = {
            let sessions = self.sessions.read().await;
            match sessions.get(agency) {
                Some(session) if session.state == PeerState::Connected => {
                    match &session.outbound {
                        Some(tx) => (tx.clone(), session.pending.clone()),
                        None => return Err("peer session not connected").simple(ErrorKind::Transport),
                    }
                }
                _ => return Err("peer not connected").simple(ErrorKind::Transport),
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let seq_key = frame.seq.0;
        pending.write().await.insert(seq_key, reply_tx);

        if outbound.send(frame).is_err() {
            pending.write().await.remove(&seq_key);
            return Err("peer session closed while sending").simple(ErrorKind::Transport);
        }

        let reply = tokio::time::timeout(timeout, reply_rx).await;
        pending.write().await.remove(&seq_key);

        match reply {
            Ok(Ok(reply_frame)) => match AckStatus::from_bytes(&reply_frame.payload) {
                Some(AckStatus::Success) => Ok(()),
                Some(AckStatus::Error) | Some(AckStatus::Timeout) | None => {
                    Err("peer returned a non-success ack").simple(ErrorKind::Transport)
                }
            },
            Ok(Err(_)) => Err("peer connection closed before ack arrived").simple(ErrorKind::Transport),
            Err(_) => Err("timed out waiting for peer ack").simple(ErrorKind::Transport),
        }
    }

    /// Registers a peer agency's endpoint list dynamically, dialing it
    /// immediately rather than waiting for the next reconnect tick.
    pub async fn register_peer(
        self: &Arc<Self>,
        agency: &str,
        endpoints: Vec<String>,
        ingress: Arc<dyn IngressHandler>,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(agency.to_owned(), PeerSession::new(endpoints));
        }
        self.dial(agency, ingress).await;
    }

    /// The list of agencies this connector knows about, regardless of
    /// connection state.
    pub async fn agency_list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn stop(&self) {
        self.running.stop();
    }
}

fn spawn_writer(link: Arc<dyn PeerLink>, mut outbound_rx: mpsc::UnboundedReceiver<WireFrame>) {
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if link.send_frame(&frame).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_reader(
    agency: String,
    link: Arc<dyn PeerLink>,
    pending: Arc<RwLock<HashMap<u32, oneshot::Sender<WireFrame>>>>,
    outbound: mpsc::UnboundedSender<WireFrame>,
    ingress: Arc<dyn IngressHandler>,
    connector: Arc<PeerConnector>,
) {
    tokio::spawn(async move {
        loop {
            let frame = match link.recv_frame().await {
                Ok(f) => f,
                Err(_) => break,
            };

            if frame.is_response {
                let mut pending = pending.write().await;
                if let Some(tx) = pending.remove(&frame.seq.0) {
                    let _ = tx.send(frame);
                }
                continue;
            }

            let session = SessionHandle {
                agency: agency.clone(),
                outbound: outbound.clone(),
            };
            ingress.on_peer_frame(session, frame).await;
        }

        // connection dropped: mark unreachable so the reconnect timer
        // picks the peer back up
        if let Some(session) = connector.sessions.write().await.get_mut(&agency) {
            session.state = PeerState::Unreachable;
            session.outbound = None;
        }
        connector.unreachable.write().await.insert(agency.clone());
        tracing::warn!(agency = agency.as_str(), "peer connection dropped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::inmemory::InMemoryTransport;

    struct EchoIngress;

    #[async_trait]
    impl IngressHandler for EchoIngress {
        async fn on_peer_frame(&self, session: SessionHandle, frame: WireFrame) {
            let _ = session.reply(frame.seq, AckStatus::Success.as_bytes().to_vec());
        }
    }

    #[tokio::test]
    async fn send_to_connected_peer_returns_ok_on_success_ack() {
        let (transport_a, transport_b) = InMemoryTransport::paired_pair("B", "A");
        let connector_a = PeerConnector::new(Arc::new(transport_a), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10));
        let connector_b = PeerConnector::new(Arc::new(transport_b), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10));

        connector_a
            .start(vec![("B".to_owned(), vec!["B".to_owned()])], Arc::new(EchoIngress))
            .await;
        connector_b
            .start(vec![("A".to_owned(), vec!["A".to_owned()])], Arc::new(EchoIngress))
            .await;

        let frame = WireFrame {
            seq: TransportSeq(1),
            is_response: false,
            payload: b"hello".to_vec(),
        };
        let result = connector_a.send("B", frame, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_to_unconnected_peer_is_a_transport_error() {
        let (transport_a, _transport_b) = InMemoryTransport::paired_pair("B", "A");
        let connector_a = PeerConnector::new(Arc::new(transport_a), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10));
        // deliberately never start(): B is never dialed
        let frame = WireFrame {
            seq: TransportSeq(1),
            is_response: false,
            payload: b"hello".to_vec(),
        };
        let result = connector_a.send("B", frame, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[test]
    fn max_msg_size_clamps_to_the_configured_range() {
        assert_eq!(clamp_max_msg_size(1024), MIN_MAX_MSG_SIZE);
        assert_eq!(clamp_max_msg_size(usize::MAX), MAX_MAX_MSG_SIZE);
        assert_eq!(clamp_max_msg_size(50 * 1024 * 1024), 50 * 1024 * 1024);
    }
}
