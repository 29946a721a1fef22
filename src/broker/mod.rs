//! The seam between the controllers and the message broker.
//!
//! The broker collaborator reports everything that happens to a session or to a queue binding as a
//! [`BrokerEvent`], pushed onto a single ordered channel. The controllers never poll the broker:
//! they react to events, one at a time, in the order they were emitted.
//!
//! [`amqp::AmqpBroker`] implements these traits on top of [`lapin`].
use crate::{amqp::configuration::ConnectionParams, consumers::InboundMessage};
use std::fmt;
use tokio::sync::mpsc;

pub mod amqp;

/// The sending half of the event channel handed to the broker collaborator.
pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
/// The receiving half of the event channel, owned by [`ConsumerService`](crate::service::ConsumerService).
pub type EventReceiver = mpsc::UnboundedReceiver<BrokerEvent>;

/// Identifies a session for its whole lifetime.
///
/// Every event emitted by a session carries its id: events from a session that has since been
/// released are stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Identifies a queue binding for its whole lifetime.
///
/// Every event emitted by a binding carries its id: events from a binding that has since been
/// disposed are stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(pub u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

#[derive(Debug)]
pub enum BrokerEvent {
    Session {
        session: SessionId,
        event: SessionEvent,
    },
    Consumer {
        binding: BindingId,
        event: ConsumerEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is connected and ready to create queue bindings.
    Up,
    /// The connect request failed; the session will not come up.
    ConnectFailed(String),
    /// The session is gone, either because it was asked to disconnect or because it broke.
    Disconnected,
}

#[derive(Debug)]
pub enum ConsumerEvent {
    /// The binding is attached to its queue and deliveries may follow.
    Up,
    /// The binding could not attach to its queue (e.g. the queue does not exist).
    ConnectFailed(String),
    /// The binding went down after a disconnect request.
    Down,
    /// The binding went down because of an error.
    DownError(String),
    /// A message was delivered on the binding.
    Message(InboundMessage),
}

/// Whether the broker considers a message consumed as soon as it is delivered or only once the
/// consumer acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeMode {
    Auto,
    Client,
}

/// Everything a broker needs to know to bind a consumer to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub acknowledge_mode: AcknowledgeMode,
    /// How many unacknowledged deliveries the broker is allowed to push to the binding.
    ///
    /// Deliveries left unacknowledged (undecodable, or not forwarded) keep holding a slot until
    /// the binding goes away.
    pub prefetch_count: u16,
}

impl QueueDescriptor {
    pub const DEFAULT_PREFETCH_COUNT: u16 = 16;

    /// A durable queue consumed under client acknowledgment.
    pub fn durable<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            acknowledge_mode: AcknowledgeMode::Client,
            prefetch_count: Self::DEFAULT_PREFETCH_COUNT,
        }
    }

    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid connection parameters: {0:#}")]
    Configuration(anyhow::Error),
    #[error("the session is not connected")]
    NotConnected,
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// A message broker able to open sessions.
pub trait Broker: Send + Sync + 'static {
    /// Create a session that reports its lifecycle on `events`, tagged with `id`.
    ///
    /// Creating a session does not connect it: see [`Session::connect`].
    fn create_session(
        &self,
        params: &ConnectionParams,
        id: SessionId,
        events: EventSender,
    ) -> Result<Box<dyn Session>, BrokerError>;
}

/// A session with the broker.
///
/// Requests return as soon as they have been issued; their outcome is reported later as a
/// [`SessionEvent`].
pub trait Session: Send {
    fn connect(&mut self) -> Result<(), BrokerError>;

    fn disconnect(&mut self) -> Result<(), BrokerError>;

    /// Create a binding to `queue` that reports its lifecycle and deliveries tagged with `id`.
    ///
    /// Fails with [`BrokerError::NotConnected`] if the session is not up.
    fn create_binding(
        &mut self,
        queue: &QueueDescriptor,
        id: BindingId,
    ) -> Result<Box<dyn QueueBinding>, BrokerError>;

    /// Release every resource held by the session.
    fn dispose(self: Box<Self>);
}

/// A consumer bound to a queue.
///
/// Like [`Session`], requests only initiate the work: outcomes come back as [`ConsumerEvent`]s.
pub trait QueueBinding: Send {
    fn connect(&mut self) -> Result<(), BrokerError>;

    fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn dispose(self: Box<Self>);
}

/// assert they're object safe
type _CHECK = (Box<dyn Broker>, Box<dyn Session>, Box<dyn QueueBinding>);
