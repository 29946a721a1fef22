//! Forwarding decoded records to the persistence sink.
//!
//! The sink is reached through a [`SinkClient`], which hands out scoped [`SinkConnection`]s: a
//! connection is opened for every record and released when it goes out of scope, whatever the
//! outcome of the write.
use crate::decoder::DecodedRecord;
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};

pub mod sqlite;

pub use sqlite::{SinkSettings, SqliteSink};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot connect to the sink: {0}")]
    Connection(String),
    #[error("the sink rejected the statement: {0}")]
    Statement(#[from] rusqlite::Error),
    #[error("`{0}` is not a valid table name")]
    InvalidTable(String),
}

/// A persistence sink able to open connections.
///
/// Implementations are blocking: [`PersistenceForwarder`] runs them on the blocking thread pool.
pub trait SinkClient: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn SinkConnection>, SinkError>;
}

/// An open connection to the sink. Dropping it closes it.
pub trait SinkConnection: Send {
    /// Insert a single row describing `record`, returning the number of rows written.
    fn insert(&mut self, record: &DecodedRecord) -> Result<usize, SinkError>;
}

/// The outcome of forwarding a record to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    Success,
    Failure(String),
}

impl ForwardResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Sends decoded records to a [`SinkClient`].
#[derive(Clone)]
pub struct PersistenceForwarder {
    sink: Arc<dyn SinkClient>,
}

impl PersistenceForwarder {
    pub fn new<S: SinkClient>(sink: S) -> Self {
        Self::from_arc(Arc::new(sink))
    }

    /// Useful to keep a handle on the sink, e.g. to inspect a fake in tests.
    pub fn from_arc(sink: Arc<dyn SinkClient>) -> Self {
        Self { sink }
    }

    /// Write `record` to the sink.
    ///
    /// The write runs on the blocking thread pool and is awaited: by the time this returns the
    /// connection has been released and the outcome is final.
    #[tracing::instrument(name = "forward_record", skip_all, fields(shipno = %record.shipno))]
    pub async fn forward(&self, record: DecodedRecord) -> ForwardResult {
        let sink = Arc::clone(&self.sink);
        let started = Instant::now();
        let written = tokio::task::spawn_blocking(move || {
            let mut connection = sink.open()?;
            connection.insert(&record)
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match written {
            Ok(Ok(rows)) => {
                debug!(rows, elapsed_ms, "Record written to the sink");
                ForwardResult::Success
            }
            Ok(Err(e)) => {
                warn!(error = %e, elapsed_ms, "Failed to write the record to the sink");
                ForwardResult::Failure(e.to_string())
            }
            Err(e) => ForwardResult::Failure(format!("the sink worker did not complete: {e}")),
        }
    }
}
