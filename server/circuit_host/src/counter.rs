use circuit_runtime::batch::{ComponentDiff, RenderBatch, RenderFrame, RenderTreeEdit};
use circuit_runtime::{CircuitContext, InvokeError, RenderError, Renderer, StartupError};
use serde_json::Value;

const ROOT_COMPONENT_ID: u32 = 0;
const INCREMENT_HANDLER_ID: u64 = 1;
const ROOT_SELECTOR: &str = "#app";

/// One button showing how often it was clicked.
pub struct CounterRenderer {
    renderer_id: u32,
    count: u64,
    mounted: bool,
    dirty: bool,
}

impl CounterRenderer {
    pub fn new(renderer_id: u32) -> Self {
        Self {
            renderer_id,
            count: 0,
            mounted: false,
            dirty: true,
        }
    }

    fn label(&self) -> RenderFrame {
        RenderFrame::Text {
            content: format!("Clicked {} time(s)", self.count),
        }
    }

    fn mount(&self) -> RenderBatch {
        let mut batch = RenderBatch::default();
        let button = batch.push_frame(RenderFrame::Element {
            name: "button".to_string(),
            subtree_length: 3,
        });
        let onclick = batch.push_frame(RenderFrame::Attribute {
            name: "onclick".to_string(),
            value: None,
            event_handler_id: INCREMENT_HANDLER_ID,
        });
        let label = batch.push_frame(self.label());

        batch.updated_components.push(ComponentDiff {
            component_id: ROOT_COMPONENT_ID,
            edits: vec![
                RenderTreeEdit::prepend_frame(0, button),
                RenderTreeEdit::step_in(0),
                RenderTreeEdit::set_attribute(0, onclick),
                RenderTreeEdit::prepend_frame(0, label),
                RenderTreeEdit::step_out(),
            ],
        });
        batch
    }

    fn relabel(&self) -> RenderBatch {
        let mut batch = RenderBatch::default();
        let label = batch.push_frame(self.label());
        batch.updated_components.push(ComponentDiff {
            component_id: ROOT_COMPONENT_ID,
            edits: vec![
                RenderTreeEdit::step_in(0),
                RenderTreeEdit::update_text(0, label),
                RenderTreeEdit::step_out(),
            ],
        });
        batch
    }
}

impl Renderer for CounterRenderer {
    fn compute_next_batch(&mut self) -> Option<RenderBatch> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;

        if self.mounted {
            Some(self.relabel())
        } else {
            self.mounted = true;
            Some(self.mount())
        }
    }

    fn dispatch_event(
        &mut self,
        component_id: u32,
        event_handler_id: u64,
        _event_args: &Value,
    ) -> Result<(), RenderError> {
        if component_id != ROOT_COMPONENT_ID {
            return Err(RenderError::UnknownComponent(component_id));
        }
        if event_handler_id != INCREMENT_HANDLER_ID {
            return Err(RenderError::UnknownEventHandler(event_handler_id));
        }

        self.count += 1;
        self.dirty = true;
        Ok(())
    }

    fn dispose(&mut self) {
        log::debug!(
            "counter renderer {} disposed at count={}",
            self.renderer_id,
            self.count
        );
    }
}

pub fn renderer(renderer_id: u32) -> Box<dyn Renderer> {
    Box::new(CounterRenderer::new(renderer_id))
}

pub fn startup(context: &mut CircuitContext) -> Result<(), StartupError> {
    context.attach_root_component(ROOT_SELECTOR, ROOT_COMPONENT_ID);
    Ok(())
}

pub fn current_location(context: &mut CircuitContext, _args_json: &str) -> Result<Value, InvokeError> {
    context
        .uri_helper()
        .absolute_uri()
        .map(Value::from)
        .map_err(|err| InvokeError::Failed(err.to_string()))
}

pub fn echo(_context: &mut CircuitContext, args_json: &str) -> Result<Value, InvokeError> {
    Ok(serde_json::from_str(args_json)?)
}
