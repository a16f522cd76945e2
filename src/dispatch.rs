use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use crate::codec::{MessageCodec, MessageTag, TaggedMessage};
use crate::connection::{Connection, EventSender, TransportEvent};

/// The receiving end of a transport: it is called with every message payload that arrives on a
///  connection.
///
/// Calls for the same connection are made one at a time. Errors (and panics) are reported as
///  [TransportEvent::HandlerFault] without affecting the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, sender: Arc<dyn Connection>, msg_buf: Bytes) -> anyhow::Result<()>;
}

/// Calls a dispatcher, catching both errors and panics. The dispatcher runs in a separate task
///  so that a panic unwinds that task only, and it is awaited so that messages from a connection
///  are still processed one at a time.
pub async fn dispatch_isolated(dispatcher: &Arc<dyn MessageDispatcher>, sender: Arc<dyn Connection>, msg_buf: Bytes, events: &EventSender) {
    let remote_addr = sender.remote_addr();
    let dispatcher = dispatcher.clone();

    let handle = tokio::spawn(async move {
        dispatcher.on_message(sender, msg_buf).await
    });

    let error = match handle.await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) if e.is_panic() => anyhow!("message handler panicked"),
        Err(_) => {
            debug!("message handler was cancelled - shutting down?");
            return;
        }
    };

    warn!(?remote_addr, "error handling received message: {:#}", error);
    events.send_event(TransportEvent::HandlerFault { remote_addr, error });
}

/// Received messages of a single connection, waiting to be dispatched by a task of their own.
///
/// A receive loop that serves many connections (NCP servers share one socket between all
///  clients) must not wait for handlers: a slow handler would hold up every other connection.
///  The queue's task handles the messages of its connection one at a time, in the order they
///  were enqueued.
///
/// The task holds only a weak reference to the connection, and it terminates once the queue is
///  dropped together with the connection.
pub struct DispatchQueue {
    sender: mpsc::Sender<Bytes>,
}

impl DispatchQueue {
    pub fn spawn(connection: Weak<dyn Connection>, dispatcher: Arc<dyn MessageDispatcher>, events: EventSender, capacity: usize) -> DispatchQueue {
        let (sender, mut receiver) = mpsc::channel::<Bytes>(capacity);

        tokio::spawn(async move {
            while let Some(msg_buf) = receiver.recv().await {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                dispatch_isolated(&dispatcher, connection, msg_buf, &events).await;
            }
            trace!("dispatch queue terminated");
        });

        DispatchQueue { sender }
    }

    /// Reserves room for a message before it is accepted from the wire. `None` means that the
    ///  handler is lagging behind and the queue is full.
    pub fn try_reserve(&self) -> Option<mpsc::Permit<'_, Bytes>> {
        match self.sender.try_reserve() {
            Ok(permit) => Some(permit),
            Err(TrySendError::Full(())) => None,
            Err(TrySendError::Closed(())) => {
                debug!("dispatch queue was closed");
                None
            }
        }
    }
}

/// Handles messages of one specific kind
#[async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    async fn on_message(&self, message: M, sender: Arc<dyn Connection>) -> anyhow::Result<()>;
}

/// Maps message tags to (at most one) handler each.
pub struct HandlerRegistry<M: TaggedMessage> {
    handlers: RwLock<FxHashMap<MessageTag, Arc<dyn MessageHandler<M>>>>,
}

impl<M: TaggedMessage> Default for HandlerRegistry<M> {
    fn default() -> Self {
        HandlerRegistry { handlers: Default::default() }
    }
}

impl<M: TaggedMessage> HandlerRegistry<M> {
    pub fn new() -> HandlerRegistry<M> {
        Default::default()
    }

    pub async fn register(&self, tag: MessageTag, handler: Arc<dyn MessageHandler<M>>) -> anyhow::Result<()> {
        match self.handlers.write().await
            .entry(tag)
        {
            Entry::Occupied(_) => Err(anyhow!("a handler is already registered for message tag {:?}", tag)),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn deregister(&self, tag: MessageTag) -> anyhow::Result<()> {
        if self.handlers.write().await.remove(&tag).is_none() {
            return Err(anyhow!("deregistering a handler that was not previously registered: {:?}", tag));
        }
        Ok(())
    }

    /// Messages without a registered handler are logged and dropped
    pub async fn dispatch(&self, message: M, sender: Arc<dyn Connection>) -> anyhow::Result<()> {
        let tag = message.tag();
        let handler = self.handlers.read().await
            .get(&tag)
            .cloned();

        match handler {
            Some(handler) => {
                trace!(?tag, "dispatching message");
                handler.on_message(message, sender).await
            }
            None => {
                debug!(?tag, "no handler for received message - skipping");
                Ok(())
            }
        }
    }
}

/// Connects a transport to a [HandlerRegistry], decoding payloads with a codec. Payloads that
///  fail to decode are reported the same way as handler errors.
pub struct CodecDispatcher<C: MessageCodec> where C::Message: TaggedMessage {
    codec: C,
    registry: Arc<HandlerRegistry<C::Message>>,
}

impl<C: MessageCodec> CodecDispatcher<C> where C::Message: TaggedMessage {
    pub fn new(codec: C, registry: Arc<HandlerRegistry<C::Message>>) -> CodecDispatcher<C> {
        CodecDispatcher { codec, registry }
    }
}

#[async_trait]
impl<C: MessageCodec> MessageDispatcher for CodecDispatcher<C> where C::Message: TaggedMessage {
    async fn on_message(&self, sender: Arc<dyn Connection>, msg_buf: Bytes) -> anyhow::Result<()> {
        let message = self.codec.decode(&msg_buf)?;
        self.registry.dispatch(message, sender).await
    }
}
