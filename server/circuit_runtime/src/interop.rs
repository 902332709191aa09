use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::context::CircuitContext;
use crate::protocol::END_INVOKE_DOTNET;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("no method '{method}' registered for module '{module}'")]
    UnknownMethod { module: String, method: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl From<serde_json::Error> for InvokeError {
    fn from(err: serde_json::Error) -> Self {
        InvokeError::InvalidArguments(err.to_string())
    }
}

pub type InteropHandler =
    Arc<dyn Fn(&mut CircuitContext, &str) -> Result<Value, InvokeError> + Send + Sync>;

/// Inbound methods the circuit handles itself. Everything else goes to the
/// method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMethod {
    NotifyLocationChanged,
    DispatchEvent,
    Generic,
}

impl InboundMethod {
    pub fn resolve(method: &str) -> Self {
        match method {
            "NotifyLocationChanged" => InboundMethod::NotifyLocationChanged,
            "DispatchEvent" => InboundMethod::DispatchEvent,
            _ => InboundMethod::Generic,
        }
    }
}

/// `(module, method)` handlers registered at configuration time.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<(String, String), InteropHandler>,
}

impl MethodTable {
    pub fn register<F>(&mut self, module: impl Into<String>, method: impl Into<String>, handler: F)
    where
        F: Fn(&mut CircuitContext, &str) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.methods
            .insert((module.into(), method.into()), Arc::new(handler));
    }

    pub fn contains(&self, module: &str, method: &str) -> bool {
        self.methods
            .contains_key(&(module.to_string(), method.to_string()))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub(crate) fn invoke(
        &self,
        context: &mut CircuitContext,
        module: &str,
        method: &str,
        args_json: &str,
    ) -> Result<Value, InvokeError> {
        let handler = self
            .methods
            .get(&(module.to_string(), method.to_string()))
            .ok_or_else(|| InvokeError::UnknownMethod {
                module: module.to_string(),
                method: method.to_string(),
            })?;

        handler(context, args_json)
    }
}

/// Reports the outcome of a call back to the caller that is waiting on `call_id`.
pub(crate) fn end_invoke(
    context: &CircuitContext,
    call_id: &str,
    outcome: Result<&Value, String>,
) {
    let args = match outcome {
        Ok(result) => serde_json::json!([call_id, true, result]),
        Err(message) => serde_json::json!([call_id, false, message]),
    };
    context
        .channel()
        .begin_invoke_js(0, END_INVOKE_DOTNET, &args.to_string());
}

pub(crate) fn parse_location_args(args_json: &str) -> Result<String, InvokeError> {
    let args: Vec<String> = serde_json::from_str(args_json)?;
    args.into_iter()
        .next()
        .ok_or_else(|| InvokeError::InvalidArguments("expected [uri]".to_string()))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDescriptor {
    component_id: u32,
    event_handler_id: u64,
}

pub(crate) fn parse_event_args(args_json: &str) -> Result<(u32, u64, Value), InvokeError> {
    let (descriptor, event_args): (EventDescriptor, Value) = serde_json::from_str(args_json)?;
    Ok((
        descriptor.component_id,
        descriptor.event_handler_id,
        event_args,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_paths_resolve_by_exact_name() {
        assert_eq!(
            InboundMethod::resolve("NotifyLocationChanged"),
            InboundMethod::NotifyLocationChanged
        );
        assert_eq!(
            InboundMethod::resolve("DispatchEvent"),
            InboundMethod::DispatchEvent
        );
        assert_eq!(
            InboundMethod::resolve("notifyLocationChanged"),
            InboundMethod::Generic
        );
        assert_eq!(InboundMethod::resolve("Increment"), InboundMethod::Generic);
    }

    #[test]
    fn location_args_take_first_uri() {
        assert_eq!(
            parse_location_args(r#"["http://host/a"]"#).expect("parse"),
            "http://host/a"
        );
        assert!(matches!(
            parse_location_args("[]"),
            Err(InvokeError::InvalidArguments(_))
        ));
        assert!(matches!(
            parse_location_args("{}"),
            Err(InvokeError::InvalidArguments(_))
        ));
    }

    #[test]
    fn event_args_carry_descriptor_and_payload() {
        let (component_id, handler_id, payload) =
            parse_event_args(r#"[{"componentId":3,"eventHandlerId":9},{"type":"click"}]"#)
                .expect("parse");
        assert_eq!(component_id, 3);
        assert_eq!(handler_id, 9);
        assert_eq!(payload["type"], "click");
    }

    #[test]
    fn registered_methods_are_looked_up_by_module_and_name() {
        let mut table = MethodTable::default();
        table.register("app", "Ping", |_, _| Ok(Value::Null));

        assert!(table.contains("app", "Ping"));
        assert!(!table.contains("other", "Ping"));
        assert_eq!(table.len(), 1);
    }
}
