//! Maps live connections to their circuits and routes inbound envelopes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::circuit::{Circuit, CircuitError, CircuitEvent};
use crate::dispatch::ClientProxy;
use crate::factory::{CircuitFactory, ConfigurationError};
use crate::protocol::{HubEnvelope, circuit_started_envelope, error_envelope};

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Circuit(#[from] CircuitError),

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("connection '{0}' already started a circuit")]
    AlreadyStarted(String),

    #[error("connection '{0}' has not started a circuit")]
    NoCircuit(String),

    #[error("failed to spawn startup thread: {0}")]
    Spawn(#[from] io::Error),
}

struct Connection {
    request_path: String,
    client: Arc<dyn ClientProxy>,
    circuit: Option<Circuit>,
}

type Connections = Arc<Mutex<HashMap<String, Connection>>>;

pub struct CircuitHub {
    factory: Arc<CircuitFactory>,
    connections: Connections,
    startups: Mutex<Vec<JoinHandle<()>>>,
}

impl CircuitHub {
    pub fn new(factory: Arc<CircuitFactory>) -> Self {
        Self {
            factory,
            connections: Arc::new(Mutex::new(HashMap::new())),
            startups: Mutex::new(Vec::new()),
        }
    }

    /// Registers a connection accepted on `request_path`. A circuit is only
    /// created once the client sends `start_circuit`.
    pub fn on_connected(&self, connection: &str, request_path: &str, client: Arc<dyn ClientProxy>) {
        log::info!("connection {connection} opened on {request_path}");
        let previous = self.connections.lock().insert(
            connection.to_string(),
            Connection {
                request_path: request_path.to_string(),
                client,
                circuit: None,
            },
        );

        if let Some(Connection {
            circuit: Some(circuit),
            ..
        }) = previous
        {
            log::warn!("connection {connection} reopened; disposing its previous circuit");
            circuit.dispose();
        }
    }

    /// Creates the connection's circuit and runs its startup action on the
    /// calling thread. The client gets `circuit_started` once it is active.
    pub fn start_circuit(
        &self,
        connection: &str,
        uri: &str,
        base_uri: &str,
    ) -> Result<Circuit, HubError> {
        let (circuit, client) = self.register_circuit(connection)?;
        complete_start(&self.connections, connection, &circuit, client.as_ref(), uri, base_uri)?;
        Ok(circuit)
    }

    /// Like [`CircuitHub::start_circuit`] but runs the startup action on its
    /// own thread, so the caller can keep routing `end_invoke_js` replies the
    /// action may be waiting on. Startup failures are reported to the client.
    pub fn begin_start_circuit(
        &self,
        connection: &str,
        uri: &str,
        base_uri: &str,
    ) -> Result<(), HubError> {
        let (circuit, client) = self.register_circuit(connection)?;

        let connections = self.connections.clone();
        let connection_id = connection.to_string();
        let started = circuit.clone();
        let uri = uri.to_string();
        let base_uri = base_uri.to_string();

        let spawned = thread::Builder::new()
            .name(format!("circuit-start-{}", circuit.renderer_id()))
            .spawn(move || {
                let outcome = complete_start(
                    &connections,
                    &connection_id,
                    &started,
                    client.as_ref(),
                    &uri,
                    &base_uri,
                );
                if let Err(err) = outcome {
                    log::warn!("connection {connection_id}: {err}");
                }
            });

        match spawned {
            Ok(handle) => {
                self.startups.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                forget_circuit(&self.connections, connection, &circuit);
                circuit.dispose();
                Err(err.into())
            }
        }
    }

    /// Blocks until every startup begun with
    /// [`CircuitHub::begin_start_circuit`] has finished.
    pub fn wait_for_startups(&self) {
        let startups = std::mem::take(&mut *self.startups.lock());
        for handle in startups {
            if handle.join().is_err() {
                log::error!("circuit startup thread panicked");
            }
        }
    }

    /// Sends an error envelope to the connection's client, if it is known.
    pub fn report_error(&self, connection: &str, code: &str, message: &str) {
        let client = self
            .connections
            .lock()
            .get(connection)
            .map(|entry| entry.client.clone());
        match client {
            Some(client) => report(client.as_ref(), code, message),
            None => log::debug!("dropping {code} report for unknown connection {connection}"),
        }
    }

    /// Creates a circuit for the connection and registers it before
    /// initialization so replies to calls made by the startup action can be
    /// routed.
    fn register_circuit(
        &self,
        connection: &str,
    ) -> Result<(Circuit, Arc<dyn ClientProxy>), HubError> {
        let (request_path, client) = {
            let connections = self.connections.lock();
            let entry = connections
                .get(connection)
                .ok_or_else(|| HubError::UnknownConnection(connection.to_string()))?;
            if entry.circuit.is_some() {
                return Err(HubError::AlreadyStarted(connection.to_string()));
            }
            (entry.request_path.clone(), entry.client.clone())
        };

        let circuit = match self.factory.create_circuit(&request_path, client.clone()) {
            Ok(circuit) => circuit,
            Err(err) => {
                log::error!("connection {connection}: {err}");
                report(client.as_ref(), "configuration", &err.to_string());
                return Err(err.into());
            }
        };

        forward_events(&circuit, client.clone());

        let mut connections = self.connections.lock();
        let Some(entry) = connections.get_mut(connection) else {
            circuit.dispose();
            return Err(HubError::UnknownConnection(connection.to_string()));
        };
        if entry.circuit.is_some() {
            circuit.dispose();
            return Err(HubError::AlreadyStarted(connection.to_string()));
        }
        entry.circuit = Some(circuit.clone());
        Ok((circuit, client))
    }

    pub fn handle(&self, connection: &str, envelope: HubEnvelope) -> Result<(), HubError> {
        match envelope {
            HubEnvelope::StartCircuit { uri, base_uri } => {
                self.begin_start_circuit(connection, &uri, &base_uri)
            }
            HubEnvelope::BeginInvokeDotNet {
                call_id,
                module,
                method,
                args_json,
            } => {
                let circuit = self.circuit(connection)?;
                circuit.dispatch_inbound_call(call_id, &module, &method, &args_json)?;
                Ok(())
            }
            HubEnvelope::EndInvokeJs {
                handle,
                succeeded,
                result_json,
            } => {
                let circuit = self.circuit(connection)?;
                circuit.end_invoke_js(handle, succeeded, result_json)?;
                Ok(())
            }
        }
    }

    /// Disposes and forgets whatever circuit the connection owned. Circuits
    /// are never kept around for a reconnect.
    pub fn on_disconnected(&self, connection: &str, reason: Option<&str>) {
        let removed = self.connections.lock().remove(connection);

        match reason {
            Some(reason) => log::info!("connection {connection} closed: {reason}"),
            None => log::info!("connection {connection} closed"),
        }

        if let Some(Connection {
            circuit: Some(circuit),
            ..
        }) = removed
        {
            circuit.dispose();
        }
    }

    pub fn circuit(&self, connection: &str) -> Result<Circuit, HubError> {
        let connections = self.connections.lock();
        let entry = connections
            .get(connection)
            .ok_or_else(|| HubError::UnknownConnection(connection.to_string()))?;
        entry
            .circuit
            .clone()
            .ok_or_else(|| HubError::NoCircuit(connection.to_string()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

fn complete_start(
    connections: &Mutex<HashMap<String, Connection>>,
    connection: &str,
    circuit: &Circuit,
    client: &dyn ClientProxy,
    uri: &str,
    base_uri: &str,
) -> Result<(), HubError> {
    if let Err(err) = circuit.initialize(uri, base_uri) {
        forget_circuit(connections, connection, circuit);
        report(client, "startup", &err.to_string());
        return Err(err.into());
    }

    log::info!(
        "connection {connection} started circuit {} (renderer {})",
        circuit.id(),
        circuit.renderer_id()
    );
    if let Err(err) = client.send(circuit_started_envelope(circuit.id(), circuit.renderer_id())) {
        log::warn!("failed to confirm circuit {} start: {err}", circuit.id());
    }
    Ok(())
}

/// Clears the connection's slot if it still holds `circuit`.
fn forget_circuit(connections: &Mutex<HashMap<String, Connection>>, connection: &str, circuit: &Circuit) {
    if let Some(entry) = connections.lock().get_mut(connection) {
        if entry.circuit.as_ref().is_some_and(|held| held.id() == circuit.id()) {
            entry.circuit = None;
        }
    }
}

fn report(client: &dyn ClientProxy, code: &str, message: &str) {
    if let Err(err) = client.send(error_envelope(code, message)) {
        log::warn!("failed to report {code} error to client: {err}");
    }
}

fn forward_events(circuit: &Circuit, client: Arc<dyn ClientProxy>) {
    circuit.on_event(move |event| match event {
        CircuitEvent::UnhandledFault(fault) => {
            report(client.as_ref(), "circuit_fault", &fault.message);
        }
        CircuitEvent::ProtocolViolation(message) => {
            report(client.as_ref(), "protocol_violation", message);
        }
        CircuitEvent::SendFailed(_) | CircuitEvent::Disposed => {}
    });
}
