//! `queue-relay` binary entry point.
//!
//! Usage: queue-relay <amqp[s]://host[:port]> <username>@<vhost> <password> [OPTIONS]
use anyhow::Context;
use clap::Parser;
use queue_relay::{
    amqp::configuration::{BrokerSettings, ConnectionParams, RabbitMqTlsSettings, TransportScheme},
    broker::{amqp::AmqpBroker, QueueDescriptor},
    persistence::{PersistenceForwarder, SinkSettings, SqliteSink},
    service::ConsumerService,
};
use redact::Secret;
use shutdown_handler::ShutdownHandler;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay shipment tracking events from a durable queue into a SQLite table.
#[derive(Parser, Debug)]
#[command(name = "queue-relay")]
#[command(after_help = "Available protocols are amqp:// and amqps://")]
struct Args {
    /// Broker endpoint, e.g. amqp://localhost:5672.
    endpoint: String,

    /// Identity to authenticate with, as <username>@<vhost>.
    identity: String,

    /// Password of the client user.
    #[arg(env = "QUEUE_RELAY_PASSWORD", hide_env_values = true)]
    password: String,

    /// Durable queue to consume from.
    #[arg(long, default_value = "FEDEX_TRACKING")]
    queue: String,

    /// Maximum number of unacknowledged deliveries in flight.
    #[arg(long, default_value_t = QueueDescriptor::DEFAULT_PREFETCH_COUNT)]
    prefetch: u16,

    /// Path to the SQLite database receiving tracking records.
    #[arg(long, env = "QUEUE_RELAY_SINK_PATH", default_value = "tracking.db")]
    sink_path: PathBuf,

    /// Table receiving tracking records.
    #[arg(long, default_value = SinkSettings::DEFAULT_TABLE)]
    table: String,

    /// How long to wait for the broker to accept a connection, in seconds.
    #[arg(long)]
    connection_timeout_seconds: Option<u64>,

    /// PEM file with the CA certificate chain trusted to validate the broker certificate.
    #[arg(long)]
    tls_ca_file: Option<PathBuf>,

    /// Domain expected on the broker certificate, if it differs from the endpoint host.
    #[arg(long)]
    tls_domain: Option<String>,

    /// How long to wait for in-flight work when shutting down, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    grace_period_ms: u64,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Validate everything the process needs before touching the broker.
///
/// Any error returned here is a configuration error: the process terminates.
fn configure(args: &Args) -> Result<(ConnectionParams, SqliteSink), anyhow::Error> {
    let tls = RabbitMqTlsSettings::load(args.tls_domain.clone(), args.tls_ca_file.as_deref())?;
    let settings = BrokerSettings {
        endpoint: args.endpoint.clone(),
        identity: args.identity.clone(),
        password: Secret::new(args.password.clone()),
        connection_timeout_seconds: args.connection_timeout_seconds,
        tls,
    };
    let params = ConnectionParams::try_from(&settings).with_context(|| {
        format!(
            "Cannot connect: expecting <{{{}}}host[:port]> <username>@<vhost> <password>",
            TransportScheme::SUPPORTED
        )
    })?;

    let sink = SqliteSink::new(&SinkSettings {
        table: args.table.clone(),
        ..SinkSettings::new(args.sink_path.clone())
    })?;
    sink.ensure_schema()
        .context("Failed to prepare the sink table")?;
    Ok((params, sink))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let (params, sink) = configure(&args).map_err(|e| {
        error!(error = %format!("{e:#}"), "Invalid configuration");
        e
    })?;

    let queue = QueueDescriptor::durable(&args.queue).with_prefetch_count(args.prefetch);
    let mut service = ConsumerService::new(
        Arc::new(AmqpBroker),
        queue,
        PersistenceForwarder::new(sink),
    )
    .with_grace_period(Duration::from_millis(args.grace_period_ms));

    let shutdown = Arc::new(ShutdownHandler::new());
    tokio::spawn({
        let shutdown = Arc::clone(&shutdown);
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => shutdown.shutdown(),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    });

    info!("Press Ctrl-C to exit");
    service.run(&params, shutdown.wait_for_signal()).await;
    Ok(())
}
