pub mod batch;
pub mod circuit;
pub mod context;
pub mod dispatch;
pub mod factory;
pub mod host;
pub mod hub;
pub mod interop;
pub mod protocol;
pub mod receiver;
pub mod renderer;
pub mod scope;
pub mod sync_context;
pub mod uri_helper;

#[cfg(test)]
mod testing;

pub use crate::batch::{
    BatchError, ComponentDiff, EditKind, RenderBatch, RenderFrame, RenderTreeEdit,
};
pub use crate::circuit::{
    Circuit, CircuitError, CircuitEvent, CircuitFault, CircuitId, CircuitState, StartupAction,
    StartupError,
};
pub use crate::context::CircuitContext;
pub use crate::dispatch::{
    ClientProxy, DispatchError, InvokeJsError, PendingInvocation, QueuedClientProxy,
    RemoteDispatchChannel, SendError,
};
pub use crate::factory::{CircuitFactory, CircuitFactoryBuilder, ConfigurationError};
pub use crate::host::{HostConfig, HostError, run, serve};
pub use crate::hub::{CircuitHub, HubError};
pub use crate::interop::{InboundMethod, InvokeError, MethodTable};
pub use crate::protocol::{CLIENT_TO_SERVER_CAP, ClientEnvelope, HubEnvelope, SERVER_TO_CLIENT_CAP};
pub use crate::receiver::{BatchReceiver, ReceiveError};
pub use crate::renderer::{RenderError, Renderer, RendererFactory};
pub use crate::scope::{ScopedFactory, ServiceScope};
pub use crate::uri_helper::{RemoteUriHelper, UriError};
pub use serde_json;
