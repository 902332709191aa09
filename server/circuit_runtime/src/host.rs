//! Single-connection host: framed envelopes in on a reader, out on a writer.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::QueuedClientProxy;
use crate::factory::{CircuitFactory, CircuitFactoryBuilder, ConfigurationError};
use crate::hub::CircuitHub;
use crate::protocol::{reader_loop, writer_loop};

const DEFAULT_REQUEST_PATH: &str = "/_circuit";
const DEFAULT_CONNECTION_ID: &str = "C1";
const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("transport: {0}")]
    Io(#[from] io::Error),

    #[error("writer thread panicked")]
    WriterPanicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub request_path: String,
    pub connection_id: String,
    pub outbound_queue_cap: usize,
    pub invoke_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            request_path: DEFAULT_REQUEST_PATH.to_string(),
            connection_id: DEFAULT_CONNECTION_ID.to_string(),
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            invoke_timeout: Duration::from_millis(DEFAULT_INVOKE_TIMEOUT_MS),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset, empty or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Self {
            request_path: non_empty("CIRCUIT_REQUEST_PATH")
                .unwrap_or_else(|| DEFAULT_REQUEST_PATH.to_string()),
            connection_id: non_empty("CIRCUIT_CONNECTION_ID")
                .unwrap_or_else(|| DEFAULT_CONNECTION_ID.to_string()),
            outbound_queue_cap: non_empty("CIRCUIT_OUTBOUND_QUEUE_CAP")
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAP),
            invoke_timeout: Duration::from_millis(
                non_empty("CIRCUIT_INVOKE_TIMEOUT_MS")
                    .and_then(|raw| raw.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS),
            ),
        }
    }
}

/// Builds the factory with settings from the environment and serves one
/// connection over stdin/stdout until stdin closes.
pub fn run(builder: CircuitFactoryBuilder) -> Result<(), HostError> {
    let config = HostConfig::from_env();
    log::info!(
        "circuit host starting: path={} connection={} queue_cap={} invoke_timeout={:?}",
        config.request_path,
        config.connection_id,
        config.outbound_queue_cap,
        config.invoke_timeout
    );

    let factory = builder.invoke_timeout(config.invoke_timeout).build()?;
    serve(Arc::new(factory), &config, io::stdin().lock(), io::stdout())
}

pub fn serve<R, W>(
    factory: Arc<CircuitFactory>,
    config: &HostConfig,
    reader: R,
    writer: W,
) -> Result<(), HostError>
where
    R: Read,
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(config.outbound_queue_cap);
    let writer_handle = thread::Builder::new()
        .name("circuit-writer".to_string())
        .spawn(move || writer_loop(rx, writer))?;

    let hub = CircuitHub::new(factory);
    hub.on_connected(
        &config.connection_id,
        &config.request_path,
        Arc::new(QueuedClientProxy::new(tx, config.outbound_queue_cap)),
    );

    let connection = config.connection_id.as_str();
    let read_result = reader_loop(
        reader,
        |envelope| {
            if let Err(err) = hub.handle(connection, envelope) {
                log::warn!("connection {connection}: {err}");
            }
        },
        |err| {
            log::warn!("connection {connection}: dropping malformed envelope: {err}");
            hub.report_error(connection, "decode_error", &err.to_string());
        },
    );

    // Startups still in flight finish, or time out, before their circuit is
    // disposed.
    hub.wait_for_startups();
    let reason = read_result.as_ref().err().map(ToString::to_string);
    hub.on_disconnected(connection, reason.as_deref());
    // The writer drains until the last circuit handle releases the queue.
    drop(hub);

    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("writer stopped: {err}"),
        Err(_) => return Err(HostError::WriterPanicked),
    }

    read_result.map_err(HostError::from)
}
