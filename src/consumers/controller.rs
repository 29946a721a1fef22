use crate::{
    broker::{BindingId, ConsumerEvent, QueueBinding, QueueDescriptor, Session},
    consumers::{ConsumerError, InboundMessage},
    decoder,
    persistence::{ForwardResult, PersistenceForwarder},
};
use tracing::{debug, error, info, warn};

/// The lifecycle of the queue binding, as last reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Down,
    Connecting,
    Up,
    Error,
}

/// What happened to a delivery once it went through the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The record reached the sink and the delivery was acknowledged.
    Acknowledged,
    /// The payload could not be decoded; the delivery was left unacknowledged.
    Undecodable,
    /// The sink did not take the record; the delivery was left unacknowledged.
    NotForwarded(String),
    /// The record reached the sink but the acknowledgment did not reach the broker: the delivery
    /// will come back.
    AcknowledgeFailed(String),
}

struct ActiveBinding {
    id: BindingId,
    binding: Box<dyn QueueBinding>,
}

/// Owns the binding to a single queue and processes its deliveries.
///
/// There is at most one live binding at any time: every event is tagged with the id of the binding
/// that emitted it, and events from any other binding are dropped.
pub struct ConsumerController {
    queue: QueueDescriptor,
    forwarder: PersistenceForwarder,
    state: ConsumerState,
    binding: Option<ActiveBinding>,
    next_binding_id: u64,
    /// Deliveries left unacknowledged on the live binding.
    unacknowledged: u16,
}

impl ConsumerController {
    pub fn new(queue: QueueDescriptor, forwarder: PersistenceForwarder) -> Self {
        Self {
            queue,
            forwarder,
            state: ConsumerState::Down,
            binding: None,
            next_binding_id: 0,
            unacknowledged: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// The id of the live binding, if any.
    pub fn binding_id(&self) -> Option<BindingId> {
        self.binding.as_ref().map(|active| active.id)
    }

    /// Bind to the queue in client-acknowledgment mode.
    ///
    /// `session` must be `Some` only while the session is up. Starting an already started (or
    /// starting) consumer does nothing.
    #[tracing::instrument(name = "consumer_start", skip_all, fields(queue_name = %self.queue.name))]
    pub fn start(&mut self, session: Option<&mut Box<dyn Session>>) -> Result<(), ConsumerError> {
        if self.state == ConsumerState::Up || self.binding.is_some() {
            info!("Consumer already started and ready to receive messages");
            return Ok(());
        }
        let Some(session) = session else {
            let e = ConsumerError::NotConnected {
                queue_name: self.queue.name.clone(),
            };
            warn!("{}", e);
            return Err(e);
        };

        info!("Starting consumer");
        let id = BindingId(self.next_binding_id);
        self.next_binding_id += 1;

        let bound = session.create_binding(&self.queue, id).and_then(|mut binding| {
            match binding.connect() {
                Ok(()) => Ok(binding),
                Err(e) => {
                    binding.dispose();
                    Err(e)
                }
            }
        });
        match bound {
            Ok(binding) => {
                self.binding = Some(ActiveBinding { id, binding });
                self.unacknowledged = 0;
                self.state = ConsumerState::Connecting;
                Ok(())
            }
            Err(source) => {
                self.state = ConsumerState::Error;
                error!(reason = %source, "Failed to start consumer");
                Err(ConsumerError::Binding {
                    queue_name: self.queue.name.clone(),
                    source,
                })
            }
        }
    }

    /// Disconnect and dispose of the live binding, if any.
    ///
    /// The state is set to [`ConsumerState::Down`] straight away, without waiting for the broker to
    /// confirm: no delivery from the old binding will be processed after this returns.
    #[tracing::instrument(name = "consumer_stop", skip_all, fields(queue_name = %self.queue.name))]
    pub fn stop(&mut self) {
        self.unacknowledged = 0;
        let Some(ActiveBinding { id, mut binding }) = self.binding.take() else {
            info!("Consumer is not bound to its queue, nothing to stop");
            self.state = ConsumerState::Down;
            return;
        };
        self.state = ConsumerState::Down;
        info!(%id, "Disconnecting consumer from queue");
        if let Err(e) = binding.disconnect() {
            warn!(error = %e, "Failed to disconnect consumer cleanly");
        }
        binding.dispose();
    }

    /// React to an event emitted by a binding.
    ///
    /// `session` must be `Some` only while the session is up: a binding is never reported as up
    /// while its session is not.
    pub async fn handle_event(
        &mut self,
        binding: BindingId,
        event: ConsumerEvent,
        session: Option<&mut Box<dyn Session>>,
    ) {
        if self.binding_id() != Some(binding) {
            debug!(%binding, ?event, "Dropping event from a stale binding");
            return;
        }
        match event {
            ConsumerEvent::Up if session.is_some() => {
                self.state = ConsumerState::Up;
                info!(queue_name = %self.queue.name, "Ready to receive messages");
            }
            ConsumerEvent::Up => {
                warn!(queue_name = %self.queue.name, "Binding came up while the session is not, tearing it down");
                self.stop();
            }
            ConsumerEvent::ConnectFailed(reason) => {
                self.release_binding(ConsumerState::Error);
                error!(
                    queue_name = %self.queue.name,
                    %reason,
                    "The consumer could not bind to the queue, ensure it exists on the broker"
                );
            }
            ConsumerEvent::Down => {
                self.release_binding(ConsumerState::Down);
                info!(queue_name = %self.queue.name, "The consumer is now down");
            }
            ConsumerEvent::DownError(reason) => {
                self.release_binding(ConsumerState::Down);
                error!(queue_name = %self.queue.name, %reason, "An error happened, the consumer is down");
            }
            ConsumerEvent::Message(message) => {
                if self.process(message).await != ProcessingOutcome::Acknowledged {
                    self.unacknowledged = self.unacknowledged.saturating_add(1);
                }
                if self.is_starved() {
                    self.recycle(session);
                }
            }
        }
    }

    /// Whether every delivery the broker may push is held unacknowledged by the live binding.
    ///
    /// A prefetch count of zero means no limit: the binding cannot be starved.
    fn is_starved(&self) -> bool {
        self.queue.prefetch_count > 0 && self.unacknowledged >= self.queue.prefetch_count
    }

    /// Replace the live binding with a fresh one.
    ///
    /// Closing the old binding hands its unacknowledged deliveries back to the broker, which
    /// redelivers them.
    fn recycle(&mut self, session: Option<&mut Box<dyn Session>>) {
        warn!(
            queue_name = %self.queue.name,
            unacknowledged = self.unacknowledged,
            "The prefetch window is full of unacknowledged deliveries, rebinding to get them redelivered"
        );
        self.stop();
        // Failures are logged by `start` and leave the consumer in a state operators can see.
        let _ = self.start(session);
    }

    /// Decode, forward, then acknowledge a delivery.
    ///
    /// The delivery is acknowledged if and only if the record was forwarded successfully.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(
            queue_name = %self.queue.name,
            delivery_tag = message.delivery.delivery_tag(),
            redelivered = message.redelivered
        )
    )]
    pub async fn process(&self, message: InboundMessage) -> ProcessingOutcome {
        let InboundMessage {
            payload, delivery, ..
        } = message;
        info!(payload = %String::from_utf8_lossy(&payload), "Received message");

        let record = match decoder::decode(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Leaving undecodable message unacknowledged");
                return ProcessingOutcome::Undecodable;
            }
        };

        match self.forwarder.forward(record).await {
            ForwardResult::Success => {}
            ForwardResult::Failure(reason) => {
                error!(%reason, "Failed to forward record, leaving message unacknowledged");
                return ProcessingOutcome::NotForwarded(reason);
            }
        }

        match delivery.acknowledge().await {
            Ok(()) => {
                debug!("Message acknowledged");
                ProcessingOutcome::Acknowledged
            }
            Err(e) => {
                warn!(error = %e, "Record forwarded but the acknowledgment failed, expect a redelivery");
                ProcessingOutcome::AcknowledgeFailed(e.to_string())
            }
        }
    }

    fn release_binding(&mut self, state: ConsumerState) {
        self.state = state;
        self.unacknowledged = 0;
        if let Some(active) = self.binding.take() {
            active.binding.dispose();
        }
    }
}

