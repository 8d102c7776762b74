//! Message ports.
//!
//! A [`MessagePort`] is the receiving end a thread listens on. It is created on,
//! and never leaves, the thread that owns it. Peers hold a cloneable
//! [`PortRef`] to send into it. Delivery is FIFO per port.

use std::fmt;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::ThreadError;
use crate::message::Message;

/// Identity of a port endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(uuid::Uuid);

impl PortId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound port, owned by the thread that opened it.
pub struct MessagePort {
    id: PortId,
    owner: ThreadId,
    rx: mpsc::UnboundedReceiver<Message>,
    /// Keeps the port on its owning thread.
    _not_send: PhantomData<*const ()>,
}

/// Sending reference to a peer's [`MessagePort`].
#[derive(Clone)]
pub struct PortRef {
    id: PortId,
    tx: mpsc::UnboundedSender<Message>,
}

impl MessagePort {
    /// Open a port owned by the calling thread, returning the port and the
    /// first reference peers can send through.
    pub fn open() -> (MessagePort, PortRef) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = PortId::new();
        (
            MessagePort {
                id,
                owner: thread::current().id(),
                rx,
                _not_send: PhantomData,
            },
            PortRef { id, tx },
        )
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Wait for the next message. Returns `None` once every [`PortRef`] is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> Result<Option<Message>, ThreadError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ThreadError::PortClosed),
        }
    }

    /// Drop everything currently queued, returning how many messages were
    /// discarded.
    pub fn discard_pending(&mut self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

impl PortRef {
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Fire-and-forget send. Fails only when the owning port is gone.
    pub fn send(&self, message: Message) -> Result<(), ThreadError> {
        self.tx.send(message).map_err(|_| ThreadError::PortClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortRef").field("id", &self.id).finish()
    }
}
