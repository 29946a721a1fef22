//! [`Broker`] implementation for RabbitMq, on top of [`lapin`].
//!
//! Every request spawns a task on the current tokio runtime; the task reports its outcome on the
//! event channel. Requests must therefore be issued from within a runtime.
use crate::{
    amqp::{configuration::ConnectionParams, ConnectionFactory},
    broker::{
        AcknowledgeMode, BindingId, Broker, BrokerError, BrokerEvent, ConsumerEvent, EventSender,
        QueueBinding, QueueDescriptor, Session, SessionEvent, SessionId,
    },
    consumers::InboundMessage,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// A RabbitMq broker, reached through a fresh connection for every session.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBroker;

impl Broker for AmqpBroker {
    fn create_session(
        &self,
        params: &ConnectionParams,
        id: SessionId,
        events: EventSender,
    ) -> Result<Box<dyn Session>, BrokerError> {
        let factory =
            ConnectionFactory::new_from_params(params).map_err(BrokerError::Configuration)?;
        Ok(Box::new(AmqpSession {
            id,
            factory,
            events,
            connection: Arc::default(),
            connect_task: None,
        }))
    }
}

type ConnectionSlot = Arc<Mutex<Option<Arc<lapin::Connection>>>>;

struct AmqpSession {
    id: SessionId,
    factory: ConnectionFactory,
    events: EventSender,
    /// Filled by the connect task right before it reports [`SessionEvent::Up`].
    connection: ConnectionSlot,
    connect_task: Option<JoinHandle<()>>,
}

impl AmqpSession {
    fn current_connection(&self) -> Option<Arc<lapin::Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_connection(&self) -> Option<Arc<lapin::Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

fn emit_session(events: &EventSender, session: SessionId, event: SessionEvent) {
    if events.send(BrokerEvent::Session { session, event }).is_err() {
        debug!(%session, "Session event dropped, nobody is listening anymore");
    }
}

impl Session for AmqpSession {
    fn connect(&mut self) -> Result<(), BrokerError> {
        let id = self.id;
        let factory = self.factory.clone();
        let events = self.events.clone();
        let slot = Arc::clone(&self.connection);
        self.connect_task = Some(tokio::spawn(async move {
            match factory.new_connection().await {
                Ok(connection) => {
                    let on_error_events = events.clone();
                    // Register a callback to report broken connections.
                    connection.on_error(move |e| {
                        warn!("RabbitMQ broken connection: {:?}", e);
                        emit_session(&on_error_events, id, SessionEvent::Disconnected);
                    });
                    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                        Some(Arc::new(connection));
                    emit_session(&events, id, SessionEvent::Up);
                }
                Err(e) => {
                    emit_session(&events, id, SessionEvent::ConnectFailed(format!("{e:#}")))
                }
            }
        }));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        let id = self.id;
        let events = self.events.clone();
        match self.take_connection() {
            Some(connection) => {
                tokio::spawn(async move {
                    if let Err(e) = connection.close(REPLY_SUCCESS, "OK").await {
                        warn!(error = %e, "Failed to close the RabbitMQ connection cleanly");
                    }
                    emit_session(&events, id, SessionEvent::Disconnected);
                });
            }
            None => {
                // Still connecting: abandon the attempt.
                if let Some(task) = self.connect_task.take() {
                    task.abort();
                }
                emit_session(&events, id, SessionEvent::Disconnected);
            }
        }
        Ok(())
    }

    fn create_binding(
        &mut self,
        queue: &QueueDescriptor,
        id: BindingId,
    ) -> Result<Box<dyn QueueBinding>, BrokerError> {
        let connection = self.current_connection().ok_or(BrokerError::NotConnected)?;
        Ok(Box::new(AmqpBinding {
            id,
            queue: queue.clone(),
            connection,
            events: self.events.clone(),
            channel: Arc::default(),
            consumer_tag: Uuid::new_v4().to_string(),
            consume_task: None,
        }))
    }

    fn dispose(self: Box<Self>) {
        // Dropping the last reference to the connection releases it.
        drop(self.take_connection());
        if let Some(task) = self.connect_task {
            task.abort();
        }
    }
}

struct AmqpBinding {
    id: BindingId,
    queue: QueueDescriptor,
    connection: Arc<lapin::Connection>,
    events: EventSender,
    /// Filled by the consume task right before it reports [`ConsumerEvent::Up`].
    channel: Arc<Mutex<Option<lapin::Channel>>>,
    consumer_tag: String,
    consume_task: Option<JoinHandle<()>>,
}

fn emit_consumer(events: &EventSender, binding: BindingId, event: ConsumerEvent) {
    if events
        .send(BrokerEvent::Consumer { binding, event })
        .is_err()
    {
        debug!(%binding, "Consumer event dropped, nobody is listening anymore");
    }
}

impl QueueBinding for AmqpBinding {
    fn connect(&mut self) -> Result<(), BrokerError> {
        let id = self.id;
        let queue = self.queue.clone();
        let connection = Arc::clone(&self.connection);
        let events = self.events.clone();
        let slot = Arc::clone(&self.channel);
        let consumer_tag = self.consumer_tag.clone();

        self.consume_task = Some(tokio::spawn(async move {
            let bound = async {
                let channel = connection.create_channel().await?;
                channel
                    .basic_qos(queue.prefetch_count, BasicQosOptions { global: false })
                    .await?;
                let consumer = channel
                    .basic_consume(
                        &queue.name,
                        &consumer_tag,
                        BasicConsumeOptions {
                            no_ack: queue.acknowledge_mode == AcknowledgeMode::Auto,
                            ..BasicConsumeOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
                Ok::<_, lapin::Error>((channel, consumer))
            };
            let mut consumer = match bound.await {
                Ok((channel, consumer)) => {
                    *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(channel);
                    emit_consumer(&events, id, ConsumerEvent::Up);
                    consumer
                }
                Err(e) => {
                    emit_consumer(&events, id, ConsumerEvent::ConnectFailed(e.to_string()));
                    return;
                }
            };

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let message = InboundMessage::from(delivery);
                        emit_consumer(&events, id, ConsumerEvent::Message(message));
                    }
                    Err(e) => {
                        emit_consumer(&events, id, ConsumerEvent::DownError(e.to_string()));
                        return;
                    }
                }
            }
            emit_consumer(&events, id, ConsumerEvent::Down);
        }));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(channel) = channel else {
            return Ok(());
        };
        let consumer_tag = self.consumer_tag.clone();
        tokio::spawn(async move {
            if let Err(e) = channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = %e, "Failed to cancel the RabbitMQ consumer");
            }
            // Closing the channel hands every unacknowledged delivery back to the queue.
            if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
                warn!(error = %e, "Failed to close the RabbitMQ channel cleanly");
            }
        });
        Ok(())
    }

    fn dispose(self: Box<Self>) {
        if let Some(task) = self.consume_task {
            task.abort();
        }
    }
}
