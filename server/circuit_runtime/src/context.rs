use std::sync::Arc;
use std::time::Duration;

use crate::circuit::CircuitId;
use crate::dispatch::{InvokeJsError, RemoteDispatchChannel};
use crate::protocol::ATTACH_ROOT_COMPONENT;
use crate::renderer::Renderer;
use crate::scope::ServiceScope;
use crate::uri_helper::RemoteUriHelper;

/// Everything a piece of circuit code may touch. Owned by the circuit's
/// worker and handed by reference to startup actions and inbound handlers.
pub struct CircuitContext {
    circuit_id: CircuitId,
    renderer: Box<dyn Renderer>,
    channel: Arc<RemoteDispatchChannel>,
    uri_helper: RemoteUriHelper,
    scope: ServiceScope,
    invoke_timeout: Duration,
}

impl CircuitContext {
    pub(crate) fn new(
        circuit_id: CircuitId,
        renderer: Box<dyn Renderer>,
        channel: Arc<RemoteDispatchChannel>,
        scope: ServiceScope,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            circuit_id,
            renderer,
            uri_helper: RemoteUriHelper::new(channel.clone()),
            channel,
            scope,
            invoke_timeout,
        }
    }

    pub fn circuit_id(&self) -> &CircuitId {
        &self.circuit_id
    }

    pub fn renderer_mut(&mut self) -> &mut dyn Renderer {
        self.renderer.as_mut()
    }

    pub fn channel(&self) -> &RemoteDispatchChannel {
        &self.channel
    }

    pub fn uri_helper(&self) -> &RemoteUriHelper {
        &self.uri_helper
    }

    pub fn uri_helper_mut(&mut self) -> &mut RemoteUriHelper {
        &mut self.uri_helper
    }

    pub fn scope(&self) -> &ServiceScope {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut ServiceScope {
        &mut self.scope
    }

    /// Asks the remote side to mount `component_id` into the element matched
    /// by `selector`.
    pub fn attach_root_component(&self, selector: &str, component_id: u32) {
        let args = serde_json::json!([self.channel.renderer_id(), selector, component_id]);
        self.channel
            .begin_invoke_js(0, ATTACH_ROOT_COMPONENT, &args.to_string());
    }

    /// Calls a remote function and blocks until it replies or the configured
    /// invoke timeout elapses.
    pub fn invoke_js(&self, identifier: &str, args_json: &str) -> Result<String, InvokeJsError> {
        self.channel
            .invoke_js(identifier, args_json)?
            .wait(self.invoke_timeout)
    }

    pub(crate) fn teardown(&mut self) {
        self.channel.cancel_pending();
        self.renderer.dispose();
        self.scope.dispose();
    }
}
