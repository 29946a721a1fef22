//! The lifecycle of the session with the broker.
use crate::{
    amqp::configuration::ConnectionParams,
    broker::{Broker, BrokerEvent, EventSender, Session, SessionEvent, SessionId},
    consumers::ConsumerController,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The lifecycle of the session, as last reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Up,
    /// The last connect attempt failed. It is not retried: call `connect` again.
    Failed,
}

struct ActiveSession {
    id: SessionId,
    session: Box<dyn Session>,
}

/// Owns the session with the broker and, through it, the [`ConsumerController`].
///
/// The consumer is started when the session comes up and torn down when it goes away. Like
/// bindings, sessions are tagged: events from a session that has been released are dropped, so a
/// late `Disconnected` cannot tear down the session that replaced it.
pub struct SessionController {
    broker: Arc<dyn Broker>,
    events: EventSender,
    state: SessionState,
    session: Option<ActiveSession>,
    next_session_id: u64,
    consumer: ConsumerController,
}

impl SessionController {
    /// `events` is handed to every session created by `broker`: whoever owns the receiving half is
    /// expected to feed events back through [`SessionController::dispatch`].
    pub fn new(broker: Arc<dyn Broker>, events: EventSender, consumer: ConsumerController) -> Self {
        Self {
            broker,
            events,
            state: SessionState::Disconnected,
            session: None,
            next_session_id: 0,
            consumer,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|active| active.id)
    }

    pub fn consumer(&self) -> &ConsumerController {
        &self.consumer
    }

    pub fn consumer_mut(&mut self) -> &mut ConsumerController {
        &mut self.consumer
    }

    /// Open a session with the broker and ask it to connect.
    ///
    /// Does nothing if the session is already up or connecting. The outcome of the attempt is
    /// reported later, as a [`SessionEvent`].
    #[tracing::instrument(name = "session_connect", skip_all, fields(host = %params.host, vhost = %params.vhost))]
    pub fn connect(&mut self, params: &ConnectionParams) {
        if matches!(self.state, SessionState::Up | SessionState::Connecting) {
            info!("Already connected and ready to consume messages");
            return;
        }
        self.release_session();
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        info!(
            username = %params.username,
            port = params.port,
            session = %id,
            "Connecting to the message broker"
        );

        let mut session = match self.broker.create_session(params, id, self.events.clone()) {
            Ok(session) => session,
            Err(e) => {
                self.state = SessionState::Failed;
                error!(error = %e, "Failed to create a session with the message broker");
                return;
            }
        };
        match session.connect() {
            Ok(()) => {
                self.session = Some(ActiveSession { id, session });
                self.state = SessionState::Connecting;
            }
            Err(e) => {
                session.dispose();
                self.state = SessionState::Failed;
                error!(error = %e, "Failed to connect to the message broker");
            }
        }
    }

    /// Ask the broker to close the session.
    ///
    /// The state only changes once the broker reports [`SessionEvent::Disconnected`].
    #[tracing::instrument(name = "session_disconnect", skip_all)]
    pub fn disconnect(&mut self) {
        let Some(active) = self.session.as_mut() else {
            info!("Not connected to the message broker");
            return;
        };
        info!(session = %active.id, "Disconnecting from the message broker");
        if let Err(e) = active.session.disconnect() {
            warn!(error = %e, "Failed to request a disconnection from the message broker");
        }
    }

    /// Route an event to the controller it is meant for.
    pub async fn dispatch(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Session { session, event } => self.handle_event(session, event),
            BrokerEvent::Consumer { binding, event } => {
                let session = match self.state {
                    SessionState::Up => self.session.as_mut().map(|active| &mut active.session),
                    _ => None,
                };
                self.consumer.handle_event(binding, event, session).await;
            }
        }
    }

    pub fn handle_event(&mut self, session: SessionId, event: SessionEvent) {
        if self.session_id() != Some(session) {
            debug!(%session, ?event, "Dropping event from a stale session");
            return;
        }
        match event {
            SessionEvent::Up => {
                self.state = SessionState::Up;
                info!("Successfully connected and ready to start the message consumer");
                self.start_consumer();
            }
            SessionEvent::ConnectFailed(reason) => {
                self.state = SessionState::Failed;
                if self.consumer.binding_id().is_some() {
                    self.consumer.stop();
                }
                self.release_session();
                error!(
                    %reason,
                    "Connection to the message broker failed, check parameter values and connectivity"
                );
            }
            SessionEvent::Disconnected => {
                self.state = SessionState::Disconnected;
                info!("Disconnected from the message broker");
                self.consumer.stop();
                self.release_session();
            }
        }
    }

    /// Start the consumer, handing it the session only if it is up.
    fn start_consumer(&mut self) {
        let session = match self.state {
            SessionState::Up => self.session.as_mut().map(|active| &mut active.session),
            _ => None,
        };
        // Failures are logged by the consumer and leave it in a state operators can see.
        let _ = self.consumer.start(session);
    }

    fn release_session(&mut self) {
        if let Some(active) = self.session.take() {
            active.session.dispose();
        }
    }
}
