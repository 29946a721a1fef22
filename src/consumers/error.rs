use crate::broker::BrokerError;

/// Why a queue binding could not be started.
///
/// None of these are fatal: the controller logs them and keeps running, waiting for the session
/// to come back or for an operator to fix the queue.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("cannot start the consumer for queue `{queue_name}`: not connected to the broker")]
    NotConnected { queue_name: String },
    #[error("cannot bind to queue `{queue_name}`")]
    Binding {
        queue_name: String,
        #[source]
        source: BrokerError,
    },
}
