use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DisconnectReason, SendOutcome, TransportError};

/// The handle for an established connection, regardless of the transport.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;

    fn is_disconnected(&self) -> bool;

    /// Send a single message payload. Sending on a disconnected connection is a no-op that
    ///  returns [SendOutcome::NotConnected].
    async fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError>;

    /// Close the connection. This is idempotent: only the first call (or the first of any other
    ///  reason for terminating the connection) has an effect.
    async fn disconnect(&self);

    /// Resolves once the connection is disconnected, returning the reason.
    async fn closed(&self) -> DisconnectReason;

    fn last_send(&self) -> Instant;
    fn last_receive(&self) -> Instant;
}

/// Notifications from a transport's background tasks
#[derive(Debug)]
pub enum TransportEvent {
    Disconnected {
        remote_addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// A message dispatcher returned an error or panicked. The connection keeps running.
    HandlerFault {
        remote_addr: SocketAddr,
        error: anyhow::Error,
    },
    ReceiveError {
        remote_addr: SocketAddr,
        error: String,
    },
    AcceptError {
        error: String,
    },
}

/// Sender side of a transport's event channel. Events are dropped with a warning if the receiver
///  does not keep up or went away: background tasks must never block on event delivery.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<TransportEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> (EventSender, mpsc::Receiver<TransportEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (EventSender { sender }, receiver)
    }

    pub fn send_event(&self, event: TransportEvent) {
        if let Err(e) = self.sender.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => warn!("event channel is full, dropping {:?}", event),
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// State that every connection has regardless of the transport: timestamps and the
///  disconnected flag with its one-time notification.
#[derive(Debug)]
pub struct PeerState {
    remote_addr: SocketAddr,
    created_at: Instant,
    last_send_millis: AtomicU64,
    last_receive_millis: AtomicU64,
    disconnected: AtomicBool,
    reason: watch::Sender<Option<DisconnectReason>>,
    cancel: CancellationToken,
    events: EventSender,
}

impl PeerState {
    pub fn new(remote_addr: SocketAddr, cancel: CancellationToken, events: EventSender) -> PeerState {
        let (reason, _) = watch::channel(None);
        PeerState {
            remote_addr,
            created_at: Instant::now(),
            last_send_millis: AtomicU64::new(0),
            last_receive_millis: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            reason,
            cancel,
            events,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Cancelled once the connection is disconnected. Background tasks of the connection
    ///  terminate when this fires.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Marks the connection as disconnected. Returns `true` for exactly one caller over the
    ///  connection's lifetime - that caller is responsible for closing the socket. Notification
    ///  and cancellation of background tasks happen here.
    pub fn try_mark_disconnected(&self, reason: DisconnectReason) -> bool {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!(remote_addr = ?self.remote_addr, %reason, "disconnected");
        self.reason.send_replace(Some(reason));
        self.cancel.cancel();
        self.events.send_event(TransportEvent::Disconnected {
            remote_addr: self.remote_addr,
            reason,
        });
        true
    }

    pub async fn closed(&self) -> DisconnectReason {
        let mut receiver = self.reason.subscribe();
        loop {
            if let Some(reason) = *receiver.borrow_and_update() {
                return reason;
            }
            // the sender lives in self, so this can not fail while we are borrowed
            if receiver.changed().await.is_err() {
                return DisconnectReason::LocalRequest;
            }
        }
    }

    pub fn on_sent(&self) {
        self.last_send_millis.store(self.millis_since_creation(), Ordering::Release);
    }

    pub fn on_received(&self) {
        self.last_receive_millis.store(self.millis_since_creation(), Ordering::Release);
    }

    pub fn last_send(&self) -> Instant {
        self.created_at + std::time::Duration::from_millis(self.last_send_millis.load(Ordering::Acquire))
    }

    pub fn last_receive(&self) -> Instant {
        self.created_at + std::time::Duration::from_millis(self.last_receive_millis.load(Ordering::Acquire))
    }

    fn millis_since_creation(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn peer_state() -> (PeerState, mpsc::Receiver<TransportEvent>) {
        let (events, receiver) = EventSender::new(16);
        let state = PeerState::new("127.0.0.1:1234".parse().unwrap(), CancellationToken::new(), events);
        (state, receiver)
    }

    #[tokio::test]
    async fn test_mark_disconnected_once() {
        let (state, mut events) = peer_state();

        assert!(!state.is_disconnected());
        assert!(state.try_mark_disconnected(DisconnectReason::RemoteRequest));
        assert!(!state.try_mark_disconnected(DisconnectReason::LocalRequest));
        assert!(state.is_disconnected());
        assert!(state.cancel_token().is_cancelled());

        assert_eq!(state.closed().await, DisconnectReason::RemoteRequest);

        match events.try_recv() {
            Ok(TransportEvent::Disconnected { reason, .. }) => assert_eq!(reason, DisconnectReason::RemoteRequest),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_waits_for_disconnect() {
        let (state, _events) = peer_state();
        let state = Arc::new(state);

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        state.try_mark_disconnected(DisconnectReason::Timeout);
        assert_eq!(waiter.await.unwrap(), DisconnectReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps() {
        let (state, _events) = peer_state();
        let start = Instant::now();

        tokio::time::sleep(Duration::from_millis(50)).await;
        state.on_sent();
        tokio::time::sleep(Duration::from_millis(30)).await;
        state.on_received();

        assert_eq!(state.last_send() - start, Duration::from_millis(50));
        assert_eq!(state.last_receive() - start, Duration::from_millis(80));
    }

    #[test]
    fn test_event_sender_drops_when_full() {
        let (events, mut receiver) = EventSender::new(1);
        events.send_event(TransportEvent::AcceptError { error: "a".to_string() });
        events.send_event(TransportEvent::AcceptError { error: "b".to_string() });

        match receiver.try_recv() {
            Ok(TransportEvent::AcceptError { error }) => assert_eq!(error, "a"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(receiver.try_recv().is_err());
    }
}
