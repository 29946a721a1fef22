use crate::broker::BrokerError;
use amq_protocol_types::DeliveryTag;
use lapin::{acker::Acker, options::BasicAckOptions};
use std::fmt;

/// A message delivered on a queue binding, waiting to be processed.
#[derive(Debug)]
pub struct InboundMessage {
    /// The payload of the message in binary format.
    pub payload: Vec<u8>,
    /// Whether this message was delivered before and left unacknowledged.
    pub redelivered: bool,
    /// The capability to acknowledge this specific delivery.
    pub delivery: DeliveryHandle,
}

impl InboundMessage {
    pub fn new(payload: Vec<u8>, redelivered: bool, delivery: DeliveryHandle) -> Self {
        Self {
            payload,
            redelivered,
            delivery,
        }
    }
}

impl From<lapin::message::Delivery> for InboundMessage {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            payload: value.data,
            redelivered: value.redelivered,
            delivery: DeliveryHandle::new(value.delivery_tag, AmqpAcker(value.acker)),
        }
    }
}

/// Something able to acknowledge one delivery with the broker.
///
/// `acknowledge` takes ownership of the acknowledger: it can only ever be called once.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn acknowledge(self: Box<Self>) -> Result<(), BrokerError>;
}

/// The acknowledgment capability attached to an [`InboundMessage`].
///
/// A handle is consumed when acknowledging: a delivery cannot be acknowledged twice. Dropping a
/// handle without acknowledging leaves the delivery with the broker, which will redeliver it.
// The AMQP protocol forbids acking the same delivery tag more than once:
// https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag
pub struct DeliveryHandle {
    delivery_tag: DeliveryTag,
    acker: Box<dyn Acknowledge>,
}

impl DeliveryHandle {
    pub fn new<A: Acknowledge>(delivery_tag: DeliveryTag, acker: A) -> Self {
        Self {
            delivery_tag,
            acker: Box::new(acker),
        }
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    pub async fn acknowledge(self) -> Result<(), BrokerError> {
        self.acker.acknowledge().await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

struct AmqpAcker(Acker);

#[async_trait::async_trait]
impl Acknowledge for AmqpAcker {
    async fn acknowledge(self: Box<Self>) -> Result<(), BrokerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}
