//! Integration-style tests exercising the end-to-end scenarios of the
//! routing core against the public `Gateway`/`PeerConnector` surface,
//! rather than the inline unit tests colocated with each module.
//!
//! The reconnect scenario in particular needs a transport that can
//! start out unreachable and later come up, which the in-memory
//! loopback transport doesn't model on its own (it is always
//! connected); `FlakyTransport` below wraps it with a toggle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use ppc_gateway::error::*;
use ppc_gateway::front::FrontDispatcher;
use ppc_gateway::gateway::{Gateway, GatewayApi};
use ppc_gateway::message::PpcMessage;
use ppc_gateway::peer::inmemory::InMemoryTransport;
use ppc_gateway::peer::{PeerConnector, PeerLink, PeerTransport, DEFAULT_MAX_MSG_SIZE};
use ppc_gateway::task::TaskManager;

struct CountingFront {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl FrontDispatcher for CountingFront {
    async fn dispatch(&self, _msg: PpcMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records each dispatched message's payload, in the order dispatch was
/// called, so a test can assert relative delivery order rather than
/// just a count.
struct RecordingFront {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl FrontDispatcher for RecordingFront {
    async fn dispatch(&self, msg: PpcMessage) -> Result<()> {
        self.seen.lock().await.push(msg.payload);
        Ok(())
    }
}

/// Wraps an `InMemoryTransport`, refusing every `connect` until `up` is
/// flipped, simulating a peer that is offline at startup.
struct FlakyTransport {
    inner: InMemoryTransport,
    up: Arc<AtomicBool>,
}

#[async_trait]
impl PeerTransport for FlakyTransport {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PeerLink>> {
        if !self.up.load(Ordering::SeqCst) {
            return Err("peer offline").simple(ErrorKind::Transport);
        }
        self.inner.connect(endpoint).await
    }
}

type PairSetup = (Arc<Gateway>, Arc<PeerConnector>, Arc<Gateway>, Arc<PeerConnector>, Arc<AtomicBool>);

fn gateway_pair(reconnect_interval: Duration) -> PairSetup {
    let (transport_a, transport_b) = InMemoryTransport::paired_pair("B", "A");
    let up = Arc::new(AtomicBool::new(false));
    let flaky_a = FlakyTransport {
        inner: transport_a,
        up: up.clone(),
    };

    let peers_a = PeerConnector::new(Arc::new(flaky_a), DEFAULT_MAX_MSG_SIZE, reconnect_interval);
    let peers_b = PeerConnector::new(Arc::new(transport_b), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10));

    let gateway_a = Gateway::new(Arc::new(TaskManager::new()), peers_a.clone(), Duration::from_millis(500));
    let gateway_b = Gateway::new(Arc::new(TaskManager::new()), peers_b.clone(), Duration::from_millis(500));
    (gateway_a, peers_a, gateway_b, peers_b, up)
}

#[tokio::test]
async fn reconnect_tick_recovers_an_initially_unreachable_peer() {
    let (gateway_a, peers_a, gateway_b, peers_b, up) = gateway_pair(Duration::from_millis(30));

    // B's side of the in-memory duplex must be installed too, or its
    // reader task never runs and no ack can ever come back to A.
    peers_b
        .start(vec![("A".to_owned(), vec!["A".to_owned()])], gateway_b.ingress_handler())
        .await;
    peers_a
        .start(vec![("B".to_owned(), vec!["B".to_owned()])], gateway_a.ingress_handler())
        .await;

    // peer offline at startup: the dial fails and B lands in the
    // unreachable set.
    let msg = PpcMessage::new(0, 0, 0, "T-reconnect", "agencyA", b"hi".to_vec());
    let early = gateway_a.async_send_message("B", msg).await;
    assert!(early.is_err());

    // bring B's transport up; within one reconnect tick the peer
    // should be dialed successfully.
    up.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    gateway_b.register_front(
        "front-reconnect",
        Arc::new(CountingFront { calls: calls.clone() }),
    );
    gateway_b.notify_task_info("T-reconnect", "front-reconnect").await.unwrap();

    let msg = PpcMessage::new(0, 0, 0, "T-reconnect", "agencyA", b"hi again".to_vec());
    let result = gateway_a.async_send_message("B", msg).await;
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parked_messages_delivered_in_order_once_task_registers() {
    let (gateway_a, peers_a, gateway_b, peers_b, up) = gateway_pair(Duration::from_secs(10));
    up.store(true, Ordering::SeqCst);
    peers_a
        .start(vec![("B".to_owned(), vec!["B".to_owned()])], gateway_a.ingress_handler())
        .await;
    peers_b
        .start(vec![("A".to_owned(), vec!["A".to_owned()])], gateway_b.ingress_handler())
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    gateway_b.register_front("front-order", Arc::new(RecordingFront { seen: seen.clone() }));

    // two messages for the same taskID, sent far enough apart that
    // they arrive (and park) in a known order
    let first = tokio::spawn({
        let gateway_a = gateway_a.clone();
        async move {
            let msg = PpcMessage::new(0, 0, 0, "T-order", "agencyA", b"first".to_vec());
            gateway_a.async_send_message("B", msg).await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = tokio::spawn({
        let gateway_a = gateway_a.clone();
        async move {
            let msg = PpcMessage::new(0, 0, 0, "T-order", "agencyA", b"second".to_vec());
            gateway_a.async_send_message("B", msg).await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(seen.lock().await.is_empty(), "messages should still be parked");

    gateway_b.notify_task_info("T-order", "front-order").await.unwrap();
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());

    let delivered = seen.lock().await.clone();
    assert_eq!(delivered, vec![b"first".to_vec(), b"second".to_vec()]);
}
