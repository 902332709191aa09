use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::circuit::{Circuit, StartupAction, StartupError};
use crate::context::CircuitContext;
use crate::dispatch::{ClientProxy, RemoteDispatchChannel};
use crate::interop::{InvokeError, MethodTable};
use crate::renderer::{Renderer, RendererFactory};
use crate::scope::{ScopedFactory, ServiceScope};

static NEXT_RENDERER_ID: AtomicU32 = AtomicU32::new(1);

pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no startup action registered for request path '{path}'")]
    NoStartupAction { path: String },

    #[error("no renderer factory configured")]
    NoRendererFactory,

    #[error("failed to start circuit worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A startup action and the path prefix it serves.
pub struct Registration {
    prefix: String,
    action: StartupAction,
}

impl Registration {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn action(&self) -> &StartupAction {
        &self.action
    }

    fn matches(&self, path: &str) -> bool {
        self.prefix.is_empty()
            || path == self.prefix
            || path
                .strip_prefix(self.prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// `/app/`, `app` and `/app` all register the same prefix. `/` matches
/// every path.
fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

pub struct CircuitFactoryBuilder {
    registrations: Vec<Registration>,
    renderer_factory: Option<RendererFactory>,
    scoped: Vec<ScopedFactory>,
    methods: MethodTable,
    invoke_timeout: Duration,
}

impl Default for CircuitFactoryBuilder {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            renderer_factory: None,
            scoped: Vec::new(),
            methods: MethodTable::default(),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

impl CircuitFactoryBuilder {
    /// Registers the action that starts circuits under `path_prefix`. A second
    /// registration for the same prefix replaces the first.
    pub fn startup<F>(mut self, path_prefix: &str, action: F) -> Self
    where
        F: Fn(&mut CircuitContext) -> Result<(), StartupError> + Send + Sync + 'static,
    {
        let prefix = normalize_path(path_prefix);
        let action: StartupAction = Arc::new(action);

        match self.registrations.iter_mut().find(|r| r.prefix == prefix) {
            Some(existing) => existing.action = action,
            None => self.registrations.push(Registration { prefix, action }),
        }
        self
    }

    pub fn renderer<F>(mut self, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn Renderer> + Send + Sync + 'static,
    {
        self.renderer_factory = Some(Arc::new(factory));
        self
    }

    pub fn scoped<F>(mut self, factory: F) -> Self
    where
        F: Fn(&mut ServiceScope) + Send + Sync + 'static,
    {
        self.scoped.push(Arc::new(factory));
        self
    }

    pub fn method<F>(mut self, module: &str, method: &str, handler: F) -> Self
    where
        F: Fn(&mut CircuitContext, &str) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.methods.register(module, method, handler);
        self
    }

    /// How long [`CircuitContext::invoke_js`] waits for a reply.
    pub fn invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<CircuitFactory, ConfigurationError> {
        let renderer_factory = self
            .renderer_factory
            .ok_or(ConfigurationError::NoRendererFactory)?;

        log::debug!(
            "circuit factory built: {} startup prefix(es), {} scoped factor(ies), {} method(s)",
            self.registrations.len(),
            self.scoped.len(),
            self.methods.len()
        );

        Ok(CircuitFactory {
            registrations: self.registrations,
            renderer_factory,
            scoped: self.scoped,
            methods: Arc::new(self.methods),
            invoke_timeout: self.invoke_timeout,
        })
    }
}

/// Frozen configuration shared by every circuit the process creates.
pub struct CircuitFactory {
    registrations: Vec<Registration>,
    renderer_factory: RendererFactory,
    scoped: Vec<ScopedFactory>,
    methods: Arc<MethodTable>,
    invoke_timeout: Duration,
}

impl CircuitFactory {
    pub fn builder() -> CircuitFactoryBuilder {
        CircuitFactoryBuilder::default()
    }

    /// Picks the registration with the longest prefix that matches
    /// `request_path` on a segment boundary.
    pub fn resolve(&self, request_path: &str) -> Result<&Registration, ConfigurationError> {
        let path = normalize_path(request_path);

        self.registrations
            .iter()
            .filter(|registration| registration.matches(&path))
            .max_by_key(|registration| registration.prefix.len())
            .ok_or(ConfigurationError::NoStartupAction {
                path: request_path.to_string(),
            })
    }

    pub fn create_circuit(
        &self,
        request_path: &str,
        client: Arc<dyn ClientProxy>,
    ) -> Result<Circuit, ConfigurationError> {
        let registration = self.resolve(request_path)?;
        let renderer_id = NEXT_RENDERER_ID.fetch_add(1, Ordering::Relaxed);

        let renderer = (self.renderer_factory)(renderer_id);
        let channel = Arc::new(RemoteDispatchChannel::new(client, renderer_id));
        let scope = ServiceScope::build(&self.scoped);

        let circuit = Circuit::new(
            renderer,
            channel,
            scope,
            registration.action.clone(),
            self.methods.clone(),
            self.invoke_timeout,
        )?;

        log::debug!(
            "created circuit {} renderer={renderer_id} path={request_path} prefix='{}'",
            circuit.id(),
            registration.prefix
        );
        Ok(circuit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::dispatch::InvokeJsError;
    use crate::protocol::{ClientEnvelope, END_INVOKE_DOTNET};
    use crate::testing::{RecordingClient, ScriptedRenderer};

    #[derive(Debug, PartialEq)]
    struct Counter(u32);

    fn factory() -> CircuitFactory {
        CircuitFactory::builder()
            .startup("/app", |_| Ok(()))
            .startup("/app/admin/", |_| Ok(()))
            .renderer(|_| Box::new(ScriptedRenderer::default()))
            .scoped(|scope| {
                scope.insert(Counter(0));
            })
            .method("app", "Increment", |context, _| {
                let counter = context
                    .scope_mut()
                    .get_mut::<Counter>()
                    .ok_or_else(|| InvokeError::Failed("no counter".to_string()))?;
                counter.0 += 1;
                Ok(Value::from(counter.0))
            })
            .build()
            .expect("build factory")
    }

    fn replies(client: &RecordingClient) -> Vec<Value> {
        client
            .sent()
            .into_iter()
            .filter_map(|envelope| match envelope {
                ClientEnvelope::BeginInvokeJs {
                    identifier,
                    args_json,
                    ..
                } if identifier == END_INVOKE_DOTNET => serde_json::from_str(&args_json).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn longest_prefix_wins_on_segment_boundary() {
        let factory = factory();

        let prefix = |path: &str| factory.resolve(path).map(|r| r.prefix().to_string()).ok();

        assert_eq!(prefix("/app"), Some("/app".to_string()));
        assert_eq!(prefix("/app/"), Some("/app".to_string()));
        assert_eq!(prefix("/app/counter"), Some("/app".to_string()));
        assert_eq!(prefix("/app/admin"), Some("/app/admin".to_string()));
        assert_eq!(prefix("/app/admin/x"), Some("/app/admin".to_string()));
        assert_eq!(prefix("/app/admin/users?page=2"), Some("/app/admin".to_string()));
        assert_eq!(prefix("/application"), None);
    }

    #[test]
    fn unmatched_path_is_a_configuration_error() {
        let factory = factory();
        let client = Arc::new(RecordingClient::default());

        assert!(matches!(
            factory.resolve("/other"),
            Err(ConfigurationError::NoStartupAction { path }) if path == "/other"
        ));
        assert!(matches!(
            factory.create_circuit("/other", client),
            Err(ConfigurationError::NoStartupAction { .. })
        ));
    }

    #[test]
    fn root_registration_is_the_fallback() {
        let factory = CircuitFactory::builder()
            .startup("/", |_| Ok(()))
            .startup("/docs", |_| Ok(()))
            .renderer(|_| Box::new(ScriptedRenderer::default()))
            .build()
            .expect("build factory");

        assert_eq!(factory.resolve("/anything").map(|r| r.prefix()).ok(), Some(""));
        assert_eq!(factory.resolve("/docs/intro").map(|r| r.prefix()).ok(), Some("/docs"));
    }

    #[test]
    fn unanswered_remote_call_times_out() {
        let factory = CircuitFactory::builder()
            .startup("/", |context| {
                match context.invoke_js("app.neverAnswers", "[]") {
                    Err(InvokeJsError::TimedOut) => Ok(()),
                    other => Err(StartupError::new(format!("unexpected outcome {other:?}"))),
                }
            })
            .renderer(|_| Box::new(ScriptedRenderer::default()))
            .invoke_timeout(Duration::from_millis(20))
            .build()
            .expect("build factory");

        let circuit = factory
            .create_circuit("/", Arc::new(RecordingClient::default()))
            .expect("circuit");
        circuit
            .initialize("http://host/", "http://host/")
            .expect("startup observes the timeout");
    }

    #[test]
    fn builder_requires_renderer_factory() {
        let result = CircuitFactory::builder().startup("/", |_| Ok(())).build();
        assert!(matches!(result, Err(ConfigurationError::NoRendererFactory)));
    }

    #[test]
    fn circuits_get_fresh_scope_and_renderer_id() {
        let factory = factory();
        let first_client = Arc::new(RecordingClient::default());
        let second_client = Arc::new(RecordingClient::default());

        let first = factory
            .create_circuit("/app", first_client.clone())
            .expect("first circuit");
        let second = factory
            .create_circuit("/app/admin", second_client.clone())
            .expect("second circuit");

        assert_ne!(first.renderer_id(), second.renderer_id());
        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), CircuitState::Created);

        first.initialize("http://host/app/", "http://host/app/").expect("init first");
        second.initialize("http://host/app/admin", "http://host/app/").expect("init second");

        for call_id in ["1", "2"] {
            first
                .dispatch_inbound_call(Some(call_id.to_string()), "app", "Increment", "[]")
                .expect("dispatch");
        }
        second
            .dispatch_inbound_call(Some("1".to_string()), "app", "Increment", "[]")
            .expect("dispatch");
        first.wait_for_idle().expect("idle");
        second.wait_for_idle().expect("idle");

        let first_replies = replies(&first_client);
        assert_eq!(first_replies.len(), 2);
        assert_eq!(first_replies[1], serde_json::json!(["2", true, 2]));
        assert_eq!(replies(&second_client), vec![serde_json::json!(["1", true, 1])]);
    }
}
