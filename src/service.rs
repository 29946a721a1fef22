//! The top-level consumer: one session, one queue, one ordered stream of events.
use crate::{
    amqp::configuration::ConnectionParams,
    broker::{Broker, BrokerEvent, EventReceiver, EventSender, QueueDescriptor},
    consumers::ConsumerController,
    persistence::PersistenceForwarder,
    session::{SessionController, SessionState},
};
use futures_util::FutureExt;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Relays messages from a queue to a persistence sink until told to stop.
///
/// Every broker callback lands on a single channel and is handled to completion, sink write and
/// acknowledgment included, before the next one is looked at.
pub struct ConsumerService {
    session: SessionController,
    events: EventReceiver,
    grace_period: Duration,
}

impl ConsumerService {
    /// How long [`ConsumerService::exit`] keeps handling events while the broker winds down.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

    pub fn new(
        broker: Arc<dyn Broker>,
        queue: QueueDescriptor,
        forwarder: PersistenceForwarder,
    ) -> Self {
        let (sender, receiver): (EventSender, EventReceiver) = mpsc::unbounded_channel();
        let consumer = ConsumerController::new(queue, forwarder);
        info!(
            queue_name = %consumer.queue_name(),
            "Consumer is ready to connect"
        );
        Self {
            session: SessionController::new(broker, sender, consumer),
            events: receiver,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
        }
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    /// Connect to the broker and process events until `shutdown` resolves, then [`exit`].
    ///
    /// Connection and binding failures do not stop the service: they are logged and the service
    /// keeps waiting for events (or for the shutdown signal).
    ///
    /// [`exit`]: ConsumerService::exit
    #[tracing::instrument(skip_all, name = "consumer_service_run")]
    pub async fn run(&mut self, params: &ConnectionParams, shutdown: impl Future<Output = ()>) {
        self.session.connect(params);

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Prefer shutting down over picking up more events.
                biased;

                _ = &mut shutdown => {
                    info!("Consumer service received shutdown event");
                    break;
                }

                event = self.events.recv() => match event {
                    Some(event) => self.session.dispatch(event).await,
                    // The controller holds a sender, this only happens if it was dropped.
                    None => break,
                },
            }
        }

        self.exit().await;
    }

    /// Stop consuming, disconnect, and keep handling events for the grace period.
    ///
    /// This is a best-effort drain: it returns as soon as the session is gone, or when the grace
    /// period elapses, whichever comes first.
    #[tracing::instrument(skip_all, name = "consumer_service_exit")]
    pub async fn exit(&mut self) {
        self.session.consumer_mut().stop();
        self.session.disconnect();

        let deadline = tokio::time::sleep(self.grace_period);
        tokio::pin!(deadline);

        while !self.is_settled() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Grace period elapsed before the broker confirmed the disconnection");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => dispatch_while_exiting(&mut self.session, event).await,
                    None => break,
                },
            }
        }
        info!("Consumer service stopped");
    }

    /// Feed a single event to the controllers, as [`ConsumerService::run`] does.
    pub async fn dispatch(&mut self, event: BrokerEvent) {
        self.session.dispatch(event).await;
    }

    fn is_settled(&self) -> bool {
        matches!(
            self.session.state(),
            SessionState::Disconnected | SessionState::Failed
        )
    }
}

async fn dispatch_while_exiting(session: &mut SessionController, event: BrokerEvent) {
    session.dispatch(event).await;
    // A session coming up now must not start consuming again.
    if session.consumer().binding_id().is_some() {
        session.consumer_mut().stop();
        session.disconnect();
    }
}
