//! `queue-relay` is a durable queue consumer, built on top of [`lapin`], that relays shipment
//! tracking events from a RabbitMq queue into a relational sink.
//!
//! Messages are consumed under client acknowledgment: a delivery is acknowledged only once its
//! decoded record has been written to the sink. Anything else leaves the delivery with the broker,
//! which redelivers it according to its own policy.
//!
//! [`ConsumerService`](crate::service::ConsumerService) is the best starting point to learn more
//! about how the pieces fit together.

pub mod amqp;
pub mod broker;
pub mod consumers;
pub mod decoder;
pub mod persistence;
pub mod service;
pub mod session;
