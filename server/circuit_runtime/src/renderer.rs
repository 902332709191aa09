use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown component {0}")]
    UnknownComponent(u32),

    #[error("unknown event handler {0}")]
    UnknownEventHandler(u64),

    #[error("{0}")]
    Failed(String),
}

/// The component renderer a circuit drives. Diffing lives behind this trait;
/// the circuit only pulls finished batches and forwards events.
pub trait Renderer: Send {
    /// Returns the next batch to ship, or `None` when the tree is clean.
    fn compute_next_batch(&mut self) -> Option<crate::batch::RenderBatch>;

    fn dispatch_event(
        &mut self,
        component_id: u32,
        event_handler_id: u64,
        event_args: &Value,
    ) -> Result<(), RenderError>;

    fn dispose(&mut self) {}
}

/// Builds one renderer per circuit.
pub type RendererFactory = Arc<dyn Fn(u32) -> Box<dyn Renderer> + Send + Sync>;
