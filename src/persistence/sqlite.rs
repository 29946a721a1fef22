//! [`SinkClient`] implementation backed by a SQLite database file.
use crate::{
    decoder::DecodedRecord,
    persistence::{SinkClient, SinkConnection, SinkError},
};
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::{path::PathBuf, time::Duration};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
/// Where tracking records are written.
pub struct SinkSettings {
    /// Path to the SQLite database file. Created on first use.
    pub path: PathBuf,
    /// The table receiving one row per tracking record.
    #[serde(default = "SinkSettings::default_table")]
    pub table: String,
    /// How long a write waits for a lock held by another writer, in milliseconds.
    #[serde(
        default = "SinkSettings::default_busy_timeout_ms",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub busy_timeout_ms: u64,
}

impl SinkSettings {
    pub const DEFAULT_TABLE: &'static str = "FEDEX_SHIP";

    fn default_table() -> String {
        Self::DEFAULT_TABLE.to_owned()
    }

    fn default_busy_timeout_ms() -> u64 {
        5_000
    }

    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            table: Self::default_table(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

/// Writes records into a SQLite table, one connection per record.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    path: PathBuf,
    busy_timeout: Duration,
    insert_statement: String,
    create_statement: String,
}

impl SqliteSink {
    /// Fails if the configured table name is not a plain SQL identifier: table names cannot be
    /// bound as parameters, so they are only ever accepted from this allow-list of characters.
    pub fn new(settings: &SinkSettings) -> Result<Self, SinkError> {
        let table = &settings.table;
        let is_identifier = table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier {
            return Err(SinkError::InvalidTable(table.clone()));
        }
        Ok(Self {
            path: settings.path.clone(),
            busy_timeout: Duration::from_millis(settings.busy_timeout_ms),
            insert_statement: format!(
                "INSERT INTO \"{table}\" (shipno, text, location, status, lattitude, longitude) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            create_statement: format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 shipno TEXT NOT NULL, \
                 text TEXT NOT NULL, \
                 location TEXT NOT NULL, \
                 status TEXT NOT NULL, \
                 lattitude TEXT NOT NULL, \
                 longitude TEXT NOT NULL)"
            ),
        })
    }

    /// Create the sink table if it does not exist yet.
    pub fn ensure_schema(&self) -> Result<(), SinkError> {
        let connection = self.connect()?;
        connection.execute_batch(&self.create_statement)?;
        info!(path = %self.path.display(), "Sink schema ready");
        Ok(())
    }

    fn connect(&self) -> Result<Connection, SinkError> {
        let connection = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|e| SinkError::Connection(e.to_string()))?;
        connection.busy_timeout(self.busy_timeout)?;
        Ok(connection)
    }
}

impl SinkClient for SqliteSink {
    fn open(&self) -> Result<Box<dyn SinkConnection>, SinkError> {
        Ok(Box::new(SqliteConnection {
            connection: self.connect()?,
            insert_statement: self.insert_statement.clone(),
        }))
    }
}

struct SqliteConnection {
    connection: Connection,
    insert_statement: String,
}

impl SinkConnection for SqliteConnection {
    fn insert(&mut self, record: &DecodedRecord) -> Result<usize, SinkError> {
        let rows = self.connection.execute(
            &self.insert_statement,
            params![
                record.shipno,
                record.text,
                record.location,
                record.status,
                record.latitude,
                record.longitude
            ],
        )?;
        Ok(rows)
    }
}
