//! Consuming messages from a RabbitMq queue. Check out [`ConsumerController`] as a
//! starting point.
pub use controller::{ConsumerController, ConsumerState, ProcessingOutcome};
pub use error::ConsumerError;
pub use incoming_message::{Acknowledge, DeliveryHandle, InboundMessage};

mod controller;
mod error;
mod incoming_message;
