//! The `Gateway` is the central router: it classifies inbound peer
//! traffic against the `TaskManager`/`FrontNodeManager`, parks
//! not-yet-routable messages in a per-task holding queue, correlates
//! acks back to their originating peer session, and offers the
//! `GatewayApi` surface the RPC layer and local fronts call into.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{oneshot, RwLock};

use crate::async_runtime::RunningFlag;
use crate::collections::{self, HashMap};
use crate::error::*;
use crate::front::{FrontDispatcher, FrontHandle, FrontNodeManager};
use crate::message::{self, AckStatus, CorrelationId, PpcMessage, TransportSeq};
use crate::peer::{IngressHandler, PeerConnector, SessionHandle, WireFrame};
use crate::task::TaskRouting;

/// Consumed by the RPC layer and local fronts; see the module
/// documentation for the routing rules each method participates in.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// A local front announces it now owns `task_id`. Drains any
    /// holding queue parked for it.
    async fn notify_task_info(&self, task_id: &str, endpoint: &str) -> Result<()>;

    /// A local front announces it no longer owns `task_id`.
    async fn erase_task_info(&self, task_id: &str) -> Result<()>;

    /// Sends `msg` to `agency`, resolving once the peer's ack (or a
    /// transport-level timeout/error) is known.
    async fn async_send_message(&self, agency: &str, msg: PpcMessage) -> Result<()>;

    /// Adds peer agencies to the connector's configured set, dialing
    /// them immediately.
    async fn register_gateway(&self, peers: Vec<(String, Vec<String>)>) -> Result<()>;

    /// The agencies this gateway knows about, regardless of current
    /// connection state.
    async fn async_get_agency_list(&self) -> Result<Vec<String>>;

    fn register_front(&self, endpoint: &str, handle: FrontHandle);
    fn unregister_front(&self, endpoint: &str);
}

/// A message parked because its `taskID` had no bound endpoint at
/// arrival time, together with the key its eventual ack must be filed
/// under.
struct HeldMessage {
    msg: PpcMessage,
    ack_key: CorrelationId,
}

/// Per-`taskID` buffer of not-yet-routable messages, plus the
/// single-shot timer that will drain it into timeout acks.
struct HoldingQueue {
    messages: Vec<HeldMessage>,
    cancel_timer: Option<oneshot::Sender<()>>,
}

/// Pending reply state for one inbound peer frame: the transport
/// `seq` to echo back, and the session to reply on.
struct AckSlotEntry {
    seq: TransportSeq,
    session: SessionHandle,
}

/// The routing core. Construct via [`Gateway::new`], wire to a
/// [`PeerConnector`] via [`Gateway::ingress_handler`], then use the
/// [`GatewayApi`] surface for everything else.
pub struct Gateway {
    tasks: Arc<dyn TaskRouting>,
    fronts: Arc<FrontNodeManager>,
    peers: Arc<PeerConnector>,
    holding_queues: RwLock<HashMap<String, HoldingQueue>>,
    ack_slots: RwLock<HashMap<CorrelationId, AckSlotEntry>>,
    holding_timeout: Duration,
    next_seq: AtomicU32,
    running: RunningFlag,
    weak_self: Weak<Gateway>,
}

impl Gateway {
    pub fn new(
        tasks: Arc<dyn TaskRouting>,
        peers: Arc<PeerConnector>,
        holding_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Gateway {
            tasks,
            fronts: Arc::new(FrontNodeManager::new()),
            peers,
            holding_queues: RwLock::new(collections::new_map()),
            ack_slots: RwLock::new(collections::new_map()),
            holding_timeout,
            next_seq: AtomicU32::new(1),
            running: RunningFlag::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// The `IngressHandler` the owning `PeerConnector` should be
    /// started with — a clone of the same `Arc` this gateway is held
    /// by, upcast to the trait object the connector expects.
    pub fn ingress_handler(self: &Arc<Self>) -> Arc<dyn IngressHandler> {
        self.clone()
    }

    pub fn stop(&self) {
        self.running.stop();
        self.peers.stop();
    }

    fn next_transport_seq(&self) -> TransportSeq {
        TransportSeq(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// §4.4.3 — classifies a freshly decoded message and either
    /// dispatches it, parks it, or broadcasts it.
    async fn on_message_arrived(self: &Arc<Self>, msg: PpcMessage, ack_key: CorrelationId) {
        if msg.is_broadcast() {
            self.broadcast(msg, ack_key).await;
            return;
        }

        let endpoint = self.tasks.lookup(&msg.task_id).await;
        match endpoint {
            Some(endpoint) => match self.fronts.lookup(&endpoint).await {
                Some(front) => self.dispatch_to_front(front, msg, ack_key).await,
                None => self.send_ack(&ack_key, AckStatus::Error).await,
            },
            None => self.enqueue_holding(msg, ack_key).await,
        }
    }

    async fn dispatch_to_front(self: &Arc<Self>, front: FrontHandle, msg: PpcMessage, ack_key: CorrelationId) {
        let task_id = msg.task_id.clone();
        let status = match front.dispatch(msg).await {
            Ok(()) => AckStatus::Success,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "front dispatch failed");
                AckStatus::Error
            }
        };
        self.send_ack(&ack_key, status).await;
    }

    /// Ack policy: `"success"` once any dispatch succeeds; `"error"`
    /// only if every front fails (or none exist). Every front in the
    /// snapshot is dispatched to concurrently, independent of when
    /// the ack fires.
    async fn broadcast(self: &Arc<Self>, msg: PpcMessage, ack_key: CorrelationId) {
        let targets = self.fronts.snapshot().await;
        let mut dispatches = FuturesUnordered::new();
        for (_, front) in targets {
            let msg = msg.clone();
            dispatches.push(tokio::spawn(async move { front.dispatch(msg).await }));
        }

        let mut any_success = false;
        while let Some(joined) = dispatches.next().await {
            if matches!(joined, Ok(Ok(()))) {
                any_success = true;
            }
        }
        self.send_ack(&ack_key, if any_success { AckStatus::Success } else { AckStatus::Error })
            .await;
    }

    /// §4.4.4 — parks `msg` in `taskID`'s holding queue, creating it
    /// (and arming its timeout timer) if this is the first arrival.
    async fn enqueue_holding(self: &Arc<Self>, msg: PpcMessage, ack_key: CorrelationId) {
        let task_id = msg.task_id.clone();
        let held = HeldMessage { msg, ack_key };

        let mut queues = self.holding_queues.write().await;
        if let Some(queue) = queues.get_mut(&task_id) {
            queue.messages.push(held);
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        queues.insert(
            task_id.clone(),
            HoldingQueue {
                messages: vec![held],
                cancel_timer: Some(cancel_tx),
            },
        );
        drop(queues);

        let weak = Arc::downgrade(self);
        let timeout = self.holding_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(gateway) = weak.upgrade() {
                        gateway.drain_holding_on_timeout(&task_id).await;
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    /// Invoked by [`GatewayApi::notify_task_info`] once the binding is
    /// registered: atomically pops the holding queue and dispatches
    /// its contents, in arrival order, to the newly-announced front.
    async fn on_task_registered(self: &Arc<Self>, task_id: &str, endpoint: &str) {
        let queue = {
            let mut queues = self.holding_queues.write().await;
            queues.remove(task_id)
        };
        let Some(mut queue) = queue else { return };
        if let Some(cancel) = queue.cancel_timer.take() {
            let _ = cancel.send(());
        }

        let front = self.fronts.lookup(endpoint).await;
        for held in queue.messages.drain(..) {
            match &front {
                Some(front) => self.dispatch_to_front(front.clone(), held.msg, held.ack_key).await,
                None => self.send_ack(&held.ack_key, AckStatus::Error).await,
            }
        }
    }

    async fn drain_holding_on_timeout(self: &Arc<Self>, task_id: &str) {
        let queue = {
            let mut queues = self.holding_queues.write().await;
            queues.remove(task_id)
        };
        let Some(queue) = queue else { return };
        for held in queue.messages {
            tracing::info!(task_id, "holding queue entry timed out");
            self.send_ack(&held.ack_key, AckStatus::Timeout).await;
        }
    }

    /// §4.4.5 — looks up and removes the ack slot for `key`, handing
    /// the status to the originating session. A missing slot means
    /// the reply window already closed; dropped silently.
    async fn send_ack(&self, key: &CorrelationId, status: AckStatus) {
        let slot = self.ack_slots.write().await.remove(key);
        let Some(slot) = slot else {
            tracing::trace!(uuid = key.as_str(), "ack slot already closed, dropping reply");
            return;
        };
        if let Err(e) = slot.session.reply(slot.seq, status.as_bytes().to_vec()) {
            tracing::warn!(uuid = key.as_str(), error = %e, "failed to deliver ack to peer session");
        }
    }
}

#[async_trait]
impl IngressHandler for Gateway {
    /// §4.4.1 — entry point for every peer-originated frame.
    async fn on_peer_frame(&self, session: SessionHandle, frame: WireFrame) {
        if !self.running.is_running() {
            return;
        }

        let msg = match message::codec::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(agency = session.agency(), error = %e, "failed to decode inbound frame");
                let _ = session.reply(frame.seq, AckStatus::Error.as_bytes().to_vec());
                return;
            }
        };

        let ack_key = if msg.uuid.is_empty() {
            CorrelationId::from(format!("seq:{}", frame.seq))
        } else {
            msg.uuid.clone()
        };

        self.ack_slots
            .write()
            .await
            .insert(ack_key.clone(), AckSlotEntry { seq: frame.seq, session });

        // on_message_arrived needs an owned Arc to hand weak refs to
        // spawned holding-queue timers; upgrade always succeeds since
        // this method is only ever reached through an Arc<Gateway>.
        if let Some(this) = self.weak_self.upgrade() {
            this.on_message_arrived(msg, ack_key).await;
        }
    }
}

#[async_trait]
impl GatewayApi for Arc<Gateway> {
    async fn notify_task_info(&self, task_id: &str, endpoint: &str) -> Result<()> {
        self.tasks.register(task_id, endpoint).await?;
        self.on_task_registered(task_id, endpoint).await;
        Ok(())
    }

    async fn erase_task_info(&self, task_id: &str) -> Result<()> {
        self.tasks.remove(task_id).await;
        Ok(())
    }

    /// §4.4.2 — encodes `msg`, stamps a fresh transport `seq`, and
    /// delegates to the `PeerConnector`, which owns the ack-timeout
    /// wait itself.
    async fn async_send_message(&self, agency: &str, msg: PpcMessage) -> Result<()> {
        let encoded = message::codec::encode(&msg)?;
        let frame = WireFrame {
            seq: self.next_transport_seq(),
            is_response: false,
            payload: encoded,
        };
        match self.peers.send(agency, frame, self.holding_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.to_string().contains("timed out") {
                    tracing::info!(agency, error = %e, "send to peer timed out");
                } else {
                    tracing::error!(agency, error = %e, "send to peer failed");
                }
                Err(e)
            }
        }
    }

    async fn register_gateway(&self, peers: Vec<(String, Vec<String>)>) -> Result<()> {
        let ingress = self.ingress_handler();
        for (agency, endpoints) in peers {
            self.peers.register_peer(&agency, endpoints, ingress.clone()).await;
        }
        Ok(())
    }

    async fn async_get_agency_list(&self) -> Result<Vec<String>> {
        Ok(self.peers.agency_list().await)
    }

    fn register_front(&self, endpoint: &str, handle: FrontHandle) {
        let fronts = self.fronts.clone();
        let endpoint = endpoint.to_owned();
        tokio::spawn(async move {
            fronts.register(&endpoint, handle).await;
        });
    }

    fn unregister_front(&self, endpoint: &str) {
        let fronts = self.fronts.clone();
        let endpoint = endpoint.to_owned();
        tokio::spawn(async move {
            fronts.unregister(&endpoint).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use super::*;
    use crate::peer::inmemory::InMemoryTransport;
    use crate::peer::{PeerConnector, DEFAULT_MAX_MSG_SIZE};
    use crate::task::TaskManager;

    struct CountingFront {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl FrontDispatcher for CountingFront {
        async fn dispatch(&self, _msg: PpcMessage) -> Result<()> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail {
                Err("front refused message").simple(ErrorKind::Other)
            } else {
                Ok(())
            }
        }
    }

    /// Wires up a connected pair of gateways (`a`, `b`), mirroring the
    /// two-party setup described by the end-to-end scenarios.
    async fn connected_pair() -> (Arc<Gateway>, Arc<Gateway>) {
        let (transport_a, transport_b) = InMemoryTransport::paired_pair("B", "A");
        let gateway_a = Gateway::new(
            Arc::new(TaskManager::new()),
            PeerConnector::new(Arc::new(transport_a), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10)),
            Duration::from_millis(200),
        );
        let gateway_b = Gateway::new(
            Arc::new(TaskManager::new()),
            PeerConnector::new(Arc::new(transport_b), DEFAULT_MAX_MSG_SIZE, Duration::from_secs(10)),
            Duration::from_millis(200),
        );

        gateway_a
            .peers
            .start(vec![("B".to_owned(), vec!["B".to_owned()])], gateway_a.ingress_handler())
            .await;
        gateway_b
            .peers
            .start(vec![("A".to_owned(), vec!["A".to_owned()])], gateway_b.ingress_handler())
            .await;

        (gateway_a, gateway_b)
    }

    #[tokio::test]
    async fn parked_then_drained_delivers_once_task_registers() {
        let (gateway_a, gateway_b) = connected_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        gateway_b.register_front(
            "front1",
            Arc::new(CountingFront {
                calls: calls.clone(),
                fail: false,
            }),
        );

        let msg = PpcMessage::new(0, 0, 0, "T1", "agencyA", b"hello".to_vec());
        let send = tokio::spawn({
            let gateway_a = gateway_a.clone();
            async move { gateway_a.async_send_message("B", msg).await }
        });

        // give the message a moment to arrive and park
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);

        gateway_b.notify_task_info("T1", "front1").await.unwrap();
        let result = send.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_message_times_out() {
        let (gateway_a, _gateway_b) = connected_pair().await;
        let msg = PpcMessage::new(0, 0, 0, "T-never-registered", "agencyA", b"hello".to_vec());
        let result = gateway_a.async_send_message("B", msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn front_gone_before_arrival_yields_error_ack() {
        let (gateway_a, gateway_b) = connected_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        gateway_b.register_front(
            "frontGone",
            Arc::new(CountingFront {
                calls: calls.clone(),
                fail: false,
            }),
        );
        gateway_b.notify_task_info("T2", "frontGone").await.unwrap();
        gateway_b.unregister_front("frontGone");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let msg = PpcMessage::new(0, 0, 0, "T2", "agencyA", b"hello".to_vec());
        let result = gateway_a.async_send_message("B", msg).await;
        assert!(result.is_err());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_front() {
        let (gateway_a, gateway_b) = connected_pair().await;
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["f1", "f2", "f3"] {
            gateway_b.register_front(
                name,
                Arc::new(CountingFront {
                    calls: calls.clone(),
                    fail: false,
                }),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let msg = PpcMessage::new(0, 0, 0, "", "agencyA", b"broadcast".to_vec());
        let result = gateway_a.async_send_message("B", msg).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn double_register_task_is_already_exists_and_first_binding_stands() {
        let gateway = Gateway::new(
            Arc::new(TaskManager::new()),
            PeerConnector::new(
                Arc::new(InMemoryTransport::paired_pair("B", "A").0),
                DEFAULT_MAX_MSG_SIZE,
                Duration::from_secs(10),
            ),
            Duration::from_millis(200),
        );
        gateway.notify_task_info("T3", "x").await.unwrap();
        let err = gateway.notify_task_info("T3", "y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(gateway.tasks.lookup("T3").await, Some("x".to_owned()));
    }
}
