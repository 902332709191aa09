//! The per-connection session.
//!
//! A circuit moves `Created -> Initializing -> Active -> Disposed`. All work
//! for one circuit runs on its own [`SyncContext`], one job at a time, in the
//! order the calls arrived.

use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::context::CircuitContext;
use crate::dispatch::{DispatchError, RemoteDispatchChannel};
use crate::interop::{self, InboundMethod, InvokeError, MethodTable};
use crate::renderer::Renderer;
use crate::scope::ServiceScope;
use crate::sync_context::{ContextError, SyncContext, panic_message};
use crate::uri_helper::UriError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitId(Uuid);

impl CircuitId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Created,
    Initializing,
    Active,
    Disposed,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StartupError(pub String);

impl StartupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type StartupAction =
    Arc<dyn Fn(&mut CircuitContext) -> Result<(), StartupError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("calling into the circuit before initialization completes (state={0:?})")]
    NotInitialized(CircuitState),

    #[error("circuit already initialized (state={0:?})")]
    AlreadyInitialized(CircuitState),

    #[error("circuit is disposed")]
    Disposed,

    #[error("startup action failed: {0}")]
    Startup(#[from] StartupError),

    #[error("invalid start location: {0}")]
    Location(#[from] UriError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// A failure inside a dispatched call. The circuit keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitFault {
    pub call_id: Option<String>,
    pub module: String,
    pub method: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    UnhandledFault(CircuitFault),
    SendFailed(String),
    ProtocolViolation(String),
    Disposed,
}

type EventHandler = Arc<dyn Fn(&CircuitEvent) + Send + Sync>;

struct InboundCall {
    call_id: Option<String>,
    module: String,
    method: String,
    kind: InboundMethod,
    args_json: String,
}

struct Shared {
    id: CircuitId,
    renderer_id: u32,
    state: Mutex<CircuitState>,
    handlers: Mutex<Vec<EventHandler>>,
    startup: StartupAction,
    methods: Arc<MethodTable>,
    channel: Arc<RemoteDispatchChannel>,
    executor: SyncContext<CircuitContext>,
}

/// Cheap, cloneable handle to a circuit.
#[derive(Clone)]
pub struct Circuit {
    shared: Arc<Shared>,
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.shared.id)
            .field("renderer_id", &self.shared.renderer_id)
            .finish_non_exhaustive()
    }
}

impl Circuit {
    pub(crate) fn new(
        renderer: Box<dyn Renderer>,
        channel: Arc<RemoteDispatchChannel>,
        scope: ServiceScope,
        startup: StartupAction,
        methods: Arc<MethodTable>,
        invoke_timeout: Duration,
    ) -> std::io::Result<Self> {
        let id = CircuitId::generate();
        let context =
            CircuitContext::new(id.clone(), renderer, channel.clone(), scope, invoke_timeout);
        let executor = SyncContext::spawn(format!("circuit-{}", channel.renderer_id()), context)?;

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                renderer_id: channel.renderer_id(),
                state: Mutex::new(CircuitState::Created),
                handlers: Mutex::new(Vec::new()),
                startup,
                methods,
                channel,
                executor,
            }),
        })
    }

    pub fn id(&self) -> &CircuitId {
        &self.shared.id
    }

    pub fn renderer_id(&self) -> u32 {
        self.shared.renderer_id
    }

    pub fn state(&self) -> CircuitState {
        *self.shared.state.lock()
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&CircuitEvent) + Send + Sync + 'static,
    {
        self.shared.handlers.lock().push(Arc::new(handler));
    }

    /// Seeds the location state, runs the startup action on the circuit's
    /// context and ships the first render. Returns once the circuit is
    /// `Active`; on failure the circuit is disposed.
    pub fn initialize(&self, uri: &str, base_uri: &str) -> Result<(), CircuitError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                CircuitState::Created => *state = CircuitState::Initializing,
                CircuitState::Disposed => return Err(CircuitError::Disposed),
                other => return Err(CircuitError::AlreadyInitialized(other)),
            }
        }

        let shared = self.shared.clone();
        let startup = self.shared.startup.clone();
        let uri = uri.to_string();
        let base_uri = base_uri.to_string();

        let result = self
            .shared
            .executor
            .invoke(move |context| -> Result<(), CircuitError> {
                context.uri_helper_mut().initialize(&uri, &base_uri)?;
                startup(context)?;
                shared.render(context);
                Ok(())
            })
            .map_err(CircuitError::from)
            .and_then(|result| result);

        if let Err(err) = result {
            log::error!("circuit {} failed to start: {err}", self.shared.id);
            self.dispose();
            return Err(err);
        }

        let mut state = self.shared.state.lock();
        match *state {
            CircuitState::Initializing => {
                *state = CircuitState::Active;
                log::debug!("circuit {} active", self.shared.id);
                Ok(())
            }
            _ => Err(CircuitError::Disposed),
        }
    }

    /// Queues an inbound call onto the circuit's context. Faults inside the
    /// call are raised as [`CircuitEvent::UnhandledFault`].
    pub fn dispatch_inbound_call(
        &self,
        call_id: Option<String>,
        module: &str,
        method: &str,
        args_json: &str,
    ) -> Result<(), CircuitError> {
        self.post_inbound(InboundCall {
            call_id,
            module: module.to_string(),
            method: method.to_string(),
            kind: InboundMethod::resolve(method),
            args_json: args_json.to_string(),
        })
    }

    pub fn notify_location_changed(&self, uri: &str) -> Result<(), CircuitError> {
        self.post_inbound(InboundCall {
            call_id: None,
            module: String::new(),
            method: "NotifyLocationChanged".to_string(),
            kind: InboundMethod::NotifyLocationChanged,
            args_json: serde_json::json!([uri]).to_string(),
        })
    }

    /// Completes a pending remote call. Accepted while initializing so a
    /// startup action can wait on a reply.
    pub fn end_invoke_js(
        &self,
        handle: u64,
        succeeded: bool,
        result_json: String,
    ) -> Result<bool, CircuitError> {
        match self.state() {
            CircuitState::Initializing | CircuitState::Active => Ok(self
                .shared
                .channel
                .end_invoke_js(handle, succeeded, result_json)),
            CircuitState::Created => Err(CircuitError::NotInitialized(CircuitState::Created)),
            CircuitState::Disposed => Err(CircuitError::Disposed),
        }
    }

    /// Blocks until every call queued so far has run.
    pub fn wait_for_idle(&self) -> Result<(), CircuitError> {
        match self.shared.executor.invoke(|_| ()) {
            Ok(()) => Ok(()),
            Err(ContextError::Closed) => Err(CircuitError::Disposed),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.executor.is_finished()
    }

    /// Tears the circuit down. Calls already running finish; queued calls are
    /// skipped. Safe to call any number of times.
    pub fn dispose(&self) {
        self.shared.dispose();
    }

    fn post_inbound(&self, call: InboundCall) -> Result<(), CircuitError> {
        self.shared.ensure_active()?;

        let shared = self.shared.clone();
        self.shared
            .executor
            .post(move |context| shared.run_inbound(context, call))
            .map_err(|_| CircuitError::Disposed)
    }
}

impl Shared {
    fn ensure_active(&self) -> Result<(), CircuitError> {
        match *self.state.lock() {
            CircuitState::Active => Ok(()),
            CircuitState::Disposed => Err(CircuitError::Disposed),
            other => Err(CircuitError::NotInitialized(other)),
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            *self.state.lock(),
            CircuitState::Initializing | CircuitState::Active
        )
    }

    /// Handlers run without the registry lock held, so they may dispose the
    /// circuit or register further handlers.
    fn raise(&self, event: CircuitEvent) {
        let handlers = self.handlers.lock().clone();
        for handler in &handlers {
            handler(&event);
        }
    }

    fn run_inbound(&self, context: &mut CircuitContext, call: InboundCall) {
        if !self.is_live() {
            log::debug!(
                "circuit {} skipping {} queued before disposal",
                self.id,
                call.method
            );
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(context, &call)))
            .unwrap_or_else(|payload| Err(InvokeError::Failed(panic_message(payload.as_ref()))));

        match outcome {
            Ok(result) => {
                if let Some(call_id) = &call.call_id {
                    interop::end_invoke(context, call_id, Ok(&result));
                }
            }
            Err(err) => {
                let message = err.to_string();
                log::error!(
                    "circuit {} unhandled fault in {}.{}: {message}",
                    self.id,
                    call.module,
                    call.method
                );
                if let Some(call_id) = &call.call_id {
                    interop::end_invoke(context, call_id, Err(message.clone()));
                }
                self.raise(CircuitEvent::UnhandledFault(CircuitFault {
                    call_id: call.call_id.clone(),
                    module: call.module.clone(),
                    method: call.method.clone(),
                    message,
                }));
            }
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.render(context))) {
            self.raise(CircuitEvent::UnhandledFault(CircuitFault {
                call_id: call.call_id,
                module: call.module,
                method: call.method,
                message: format!("render panicked: {}", panic_message(payload.as_ref())),
            }));
        }
    }

    fn execute(
        &self,
        context: &mut CircuitContext,
        call: &InboundCall,
    ) -> Result<Value, InvokeError> {
        match call.kind {
            InboundMethod::NotifyLocationChanged => {
                let uri = interop::parse_location_args(&call.args_json)?;
                context
                    .uri_helper_mut()
                    .notify_location_changed(&uri)
                    .map_err(|err| InvokeError::Failed(err.to_string()))?;
                Ok(Value::Null)
            }
            InboundMethod::DispatchEvent => {
                let (component_id, event_handler_id, event_args) =
                    interop::parse_event_args(&call.args_json)?;
                context
                    .renderer_mut()
                    .dispatch_event(component_id, event_handler_id, &event_args)
                    .map_err(|err| InvokeError::Failed(err.to_string()))?;
                Ok(Value::Null)
            }
            InboundMethod::Generic => {
                self.methods
                    .invoke(context, &call.module, &call.method, &call.args_json)
            }
        }
    }

    /// Ships every batch the renderer has ready, one after another.
    fn render(&self, context: &mut CircuitContext) {
        while self.is_live() {
            let Some(batch) = context.renderer_mut().compute_next_batch() else {
                break;
            };

            if batch.is_empty() {
                continue;
            }

            match context.channel().send_render_batch(&batch) {
                Ok(_batch_id) => {}
                Err(DispatchError::Send(err)) => {
                    // The client never saw this batch; later diffs would apply to a
                    // tree it does not have.
                    log::warn!("circuit {} failed to send render batch: {err}", self.id);
                    self.raise(CircuitEvent::SendFailed(err.to_string()));
                    self.dispose();
                    break;
                }
                Err(DispatchError::Batch(err)) => {
                    log::error!("circuit {} produced a malformed batch: {err}", self.id);
                    self.raise(CircuitEvent::ProtocolViolation(err.to_string()));
                    self.dispose();
                    break;
                }
            }
        }
    }

    fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == CircuitState::Disposed {
                return;
            }
            *state = CircuitState::Disposed;
        }

        log::debug!("disposing circuit {}", self.id);
        self.channel.cancel_pending();
        self.executor.shutdown(CircuitContext::teardown);
        self.raise(CircuitEvent::Disposed);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.executor.shutdown(CircuitContext::teardown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ComponentDiff, RenderBatch, RenderTreeEdit};
    use crate::protocol::{ClientEnvelope, END_INVOKE_DOTNET};
    use crate::receiver::BatchReceiver;
    use crate::testing::{RecordingClient, ScriptedRenderer};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const URI: &str = "http://host/app/";

    struct Fixture {
        circuit: Circuit,
        client: Arc<RecordingClient>,
        renderer: ScriptedRenderer,
        events: Arc<Mutex<Vec<CircuitEvent>>>,
    }

    fn fixture_with(startup: StartupAction, methods: MethodTable) -> Fixture {
        let client = Arc::new(RecordingClient::default());
        let renderer = ScriptedRenderer::default();
        let channel = Arc::new(RemoteDispatchChannel::new(client.clone(), 7));
        let circuit = Circuit::new(
            Box::new(renderer.clone()),
            channel,
            ServiceScope::new(),
            startup,
            Arc::new(methods),
            Duration::from_secs(2),
        )
        .expect("spawn circuit");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        circuit.on_event(move |event| sink.lock().push(event.clone()));

        Fixture {
            circuit,
            client,
            renderer,
            events,
        }
    }

    fn noop_startup() -> StartupAction {
        Arc::new(|_: &mut CircuitContext| Ok(()))
    }

    fn active_fixture(methods: MethodTable) -> Fixture {
        let fixture = fixture_with(noop_startup(), methods);
        fixture.circuit.initialize(URI, URI).expect("initialize");
        fixture
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn faults(events: &Mutex<Vec<CircuitEvent>>) -> Vec<CircuitFault> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CircuitEvent::UnhandledFault(fault) => Some(fault.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn startup_runs_before_circuit_becomes_active() {
        let fixture = fixture_with(
            Arc::new(|context: &mut CircuitContext| {
                context.attach_root_component("app", 1);
                Ok(())
            }),
            MethodTable::default(),
        );
        fixture.renderer.queue_text("hello");

        assert_eq!(fixture.circuit.state(), CircuitState::Created);
        fixture.circuit.initialize(URI, URI).expect("initialize");
        assert_eq!(fixture.circuit.state(), CircuitState::Active);

        let identifiers = fixture.client.invoked_identifiers();
        assert!(identifiers.contains(&crate::protocol::ATTACH_ROOT_COMPONENT.to_string()));
        assert_eq!(fixture.client.batch_ids(), vec![1]);
    }

    #[test]
    fn calls_before_initialize_are_usage_errors() {
        let fixture = fixture_with(noop_startup(), MethodTable::default());

        let err = fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Ping", "[]")
            .expect_err("not initialized");
        assert!(matches!(
            err,
            CircuitError::NotInitialized(CircuitState::Created)
        ));
        assert!(matches!(
            fixture.circuit.notify_location_changed(URI),
            Err(CircuitError::NotInitialized(CircuitState::Created))
        ));
    }

    #[test]
    fn calls_during_initialization_are_usage_errors() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let startup: StartupAction = Arc::new(move |_: &mut CircuitContext| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
            Ok(())
        });
        let fixture = fixture_with(startup, MethodTable::default());

        let circuit = fixture.circuit.clone();
        let init = thread::spawn(move || circuit.initialize(URI, URI));
        entered_rx.recv().expect("startup entered");

        assert!(matches!(
            fixture
                .circuit
                .dispatch_inbound_call(None, "app", "Ping", "[]"),
            Err(CircuitError::NotInitialized(CircuitState::Initializing))
        ));

        release_tx.send(()).expect("release startup");
        init.join().expect("init thread").expect("initialize");
        assert_eq!(fixture.circuit.state(), CircuitState::Active);
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let fixture = active_fixture(MethodTable::default());
        assert!(matches!(
            fixture.circuit.initialize(URI, URI),
            Err(CircuitError::AlreadyInitialized(CircuitState::Active))
        ));
    }

    #[test]
    fn failing_startup_disposes_circuit() {
        let fixture = fixture_with(
            Arc::new(|_: &mut CircuitContext| Err(StartupError::new("no root component"))),
            MethodTable::default(),
        );

        let err = fixture.circuit.initialize(URI, URI).expect_err("startup fails");
        assert!(matches!(err, CircuitError::Startup(_)));
        assert_eq!(fixture.circuit.state(), CircuitState::Disposed);
        assert!(fixture.events.lock().contains(&CircuitEvent::Disposed));
    }

    #[test]
    fn inbound_calls_run_in_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut methods = MethodTable::default();
        methods.register("app", "Record", move |_, args| {
            let (n,): (u32,) = serde_json::from_str(args)?;
            sink.lock().push(n);
            Ok(Value::Null)
        });
        let fixture = active_fixture(methods);

        for n in 0..40 {
            fixture
                .circuit
                .dispatch_inbound_call(None, "app", "Record", &format!("[{n}]"))
                .expect("dispatch");
        }
        fixture.circuit.wait_for_idle().expect("idle");

        assert_eq!(*seen.lock(), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn location_change_never_reaches_method_table() {
        let generic_called = Arc::new(AtomicBool::new(false));
        let flag = generic_called.clone();
        let mut methods = MethodTable::default();
        methods.register("app", "NotifyLocationChanged", move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let startup: StartupAction = Arc::new(move |context: &mut CircuitContext| {
            let sink = sink.clone();
            context
                .uri_helper_mut()
                .on_location_changed(move |uri| sink.lock().push(uri.to_string()));
            Ok(())
        });

        let fixture = fixture_with(startup, methods);
        fixture.circuit.initialize(URI, URI).expect("initialize");

        fixture
            .circuit
            .dispatch_inbound_call(
                None,
                "app",
                "NotifyLocationChanged",
                r#"["http://host/app/counter"]"#,
            )
            .expect("dispatch");
        fixture
            .circuit
            .notify_location_changed("http://host/app/fetch")
            .expect("notify");
        fixture.circuit.wait_for_idle().expect("idle");

        assert!(!generic_called.load(Ordering::SeqCst));
        assert_eq!(
            *seen.lock(),
            vec![
                "http://host/app/counter".to_string(),
                "http://host/app/fetch".to_string()
            ]
        );
    }

    #[test]
    fn dispatch_event_reaches_renderer_and_renders() {
        let fixture = active_fixture(MethodTable::default());
        fixture.renderer.queue_text("clicked");
        fixture
            .circuit
            .dispatch_inbound_call(
                None,
                "",
                "DispatchEvent",
                r#"[{"componentId":1,"eventHandlerId":5},{"type":"click"}]"#,
            )
            .expect("dispatch");
        fixture.circuit.wait_for_idle().expect("idle");

        let events = fixture.renderer.events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[0].1, 5);
        assert_eq!(fixture.client.batch_ids(), vec![1]);
    }

    #[test]
    fn failing_call_raises_fault_and_circuit_stays_active() {
        let mut methods = MethodTable::default();
        methods.register("app", "Explode", |_, _| {
            Err(InvokeError::Failed("handler blew up".to_string()))
        });
        methods.register("app", "Ping", |_, _| Ok(Value::from("pong")));
        let fixture = active_fixture(methods);

        fixture
            .circuit
            .dispatch_inbound_call(Some("1".to_string()), "app", "Explode", "[]")
            .expect("dispatch");
        fixture.circuit.wait_for_idle().expect("idle");

        let reported = faults(&fixture.events);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].call_id.as_deref(), Some("1"));
        assert_eq!(reported[0].message, "handler blew up");
        assert_eq!(fixture.circuit.state(), CircuitState::Active);

        let reply = fixture.client.sent().into_iter().find_map(|envelope| match envelope {
            ClientEnvelope::BeginInvokeJs {
                identifier,
                args_json,
                ..
            } if identifier == END_INVOKE_DOTNET => Some(args_json),
            _ => None,
        });
        let reply: Value = serde_json::from_str(&reply.expect("failure reply")).expect("json");
        assert_eq!(reply[0], "1");
        assert_eq!(reply[1], false);

        fixture
            .circuit
            .dispatch_inbound_call(Some("2".to_string()), "app", "Ping", "[]")
            .expect("circuit still accepts calls");
        fixture.circuit.wait_for_idle().expect("idle");
        assert_eq!(faults(&fixture.events).len(), 1);
    }

    #[test]
    fn panicking_call_is_contained() {
        let mut methods = MethodTable::default();
        methods.register("app", "Panic", |_, _| panic!("unexpected state"));
        let fixture = active_fixture(methods);

        fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Panic", "[]")
            .expect("dispatch");
        fixture.circuit.wait_for_idle().expect("idle");

        let reported = faults(&fixture.events);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].message, "unexpected state");
        assert_eq!(fixture.circuit.state(), CircuitState::Active);
    }

    #[test]
    fn unknown_method_is_a_fault() {
        let fixture = active_fixture(MethodTable::default());
        fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Missing", "[]")
            .expect("dispatch");
        fixture.circuit.wait_for_idle().expect("idle");

        assert_eq!(faults(&fixture.events).len(), 1);
    }

    #[test]
    fn disconnect_mid_call_rejects_later_calls() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let queued_ran = Arc::new(AtomicBool::new(false));
        let queued_flag = queued_ran.clone();

        let mut methods = MethodTable::default();
        methods.register("app", "Slow", move |_, _| {
            let _ = entered_tx.send(());
            let _ = release_rx.lock().recv();
            Ok(Value::Null)
        });
        methods.register("app", "Queued", move |_, _| {
            queued_flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let fixture = active_fixture(methods);

        fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Slow", "[]")
            .expect("dispatch slow");
        entered_rx.recv().expect("slow call started");
        fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Queued", "[]")
            .expect("dispatch queued");

        fixture.circuit.dispose();

        assert!(matches!(
            fixture
                .circuit
                .dispatch_inbound_call(None, "app", "Queued", "[]"),
            Err(CircuitError::Disposed)
        ));

        release_tx.send(()).expect("release slow call");
        wait_until(|| fixture.circuit.is_torn_down());

        assert!(!queued_ran.load(Ordering::SeqCst));
        assert!(fixture.renderer.disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn dispose_is_idempotent() {
        let fixture = active_fixture(MethodTable::default());

        fixture.circuit.dispose();
        fixture.circuit.dispose();

        let disposed = fixture
            .events
            .lock()
            .iter()
            .filter(|event| **event == CircuitEvent::Disposed)
            .count();
        assert_eq!(disposed, 1);
        assert!(matches!(
            fixture.circuit.wait_for_idle(),
            Err(CircuitError::Disposed)
        ));
    }

    #[test]
    fn batches_are_sent_in_generation_order() {
        let fixture = active_fixture(MethodTable::default());
        for text in ["one", "two", "three"] {
            fixture.renderer.queue_text(text);
        }
        fixture.circuit.notify_location_changed(URI).expect("notify");
        fixture.circuit.wait_for_idle().expect("idle");

        assert_eq!(fixture.client.batch_ids(), vec![1, 2, 3]);
        assert!(fixture.renderer.queued.lock().is_empty());
    }

    #[test]
    fn send_failure_disposes_circuit_before_later_batches() {
        let fixture = active_fixture(MethodTable::default());
        fixture.renderer.queue_text("delivered");
        fixture.circuit.notify_location_changed(URI).expect("notify");
        fixture.circuit.wait_for_idle().expect("idle");

        fixture.client.refuse_next(1);
        fixture.renderer.queue_text("lost");
        fixture.renderer.queue_text("diff against lost tree");
        fixture.circuit.notify_location_changed(URI).expect("notify");
        wait_until(|| fixture.circuit.is_torn_down());

        let events = fixture.events.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CircuitEvent::SendFailed(_)));
        assert_eq!(events[1], CircuitEvent::Disposed);
        assert_eq!(fixture.circuit.state(), CircuitState::Disposed);
        assert_eq!(fixture.renderer.queued.lock().len(), 1);

        let mut receiver = BatchReceiver::new(fixture.circuit.renderer_id());
        for envelope in fixture.client.sent() {
            if matches!(envelope, ClientEnvelope::RenderBatch { .. }) {
                receiver
                    .receive(&envelope)
                    .expect("every delivered batch follows the previous one");
            }
        }
        assert_eq!(receiver.last_batch_id(), Some(1));
    }

    #[test]
    fn fault_handler_may_dispose_circuit() {
        let mut methods = MethodTable::default();
        methods.register("app", "Fail", |_, _| {
            Err(InvokeError::Failed("bad input".to_string()))
        });
        let fixture = active_fixture(methods);

        let slot = Arc::new(Mutex::new(Some(fixture.circuit.clone())));
        fixture.circuit.on_event(move |event| {
            if matches!(event, CircuitEvent::UnhandledFault(_)) {
                let circuit = slot.lock().take();
                if let Some(circuit) = circuit {
                    circuit.dispose();
                }
            }
        });

        fixture
            .circuit
            .dispatch_inbound_call(None, "app", "Fail", "[]")
            .expect("dispatch");
        wait_until(|| fixture.circuit.is_torn_down());

        assert_eq!(fixture.circuit.state(), CircuitState::Disposed);
        assert!(fixture.renderer.disposed.load(Ordering::SeqCst));
        assert!(fixture.events.lock().contains(&CircuitEvent::Disposed));
    }

    #[test]
    fn handler_may_register_another_handler() {
        let mut methods = MethodTable::default();
        methods.register("app", "Fail", |_, _| {
            Err(InvokeError::Failed("bad input".to_string()))
        });
        let fixture = active_fixture(methods);

        let late_events = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(Mutex::new(Some((fixture.circuit.clone(), late_events.clone()))));
        fixture.circuit.on_event(move |_| {
            let pending = slot.lock().take();
            if let Some((circuit, sink)) = pending {
                circuit.on_event(move |event| sink.lock().push(event.clone()));
            }
        });

        for _ in 0..2 {
            fixture
                .circuit
                .dispatch_inbound_call(None, "app", "Fail", "[]")
                .expect("dispatch");
        }
        fixture.circuit.wait_for_idle().expect("idle");

        assert_eq!(faults(&fixture.events).len(), 2);
        assert_eq!(faults(&late_events).len(), 1);
    }

    #[test]
    fn dropping_last_handle_tears_circuit_down() {
        let Fixture {
            circuit, renderer, ..
        } = active_fixture(MethodTable::default());
        renderer.queue_text("rendered before drop");
        circuit.notify_location_changed(URI).expect("notify");

        drop(circuit);
        wait_until(|| renderer.disposed.load(Ordering::SeqCst));
        assert!(renderer.queued.lock().is_empty());
    }

    #[test]
    fn malformed_batch_terminates_circuit() {
        let fixture = active_fixture(MethodTable::default());
        let mut bad = RenderBatch::default();
        bad.updated_components.push(ComponentDiff {
            component_id: 1,
            edits: vec![RenderTreeEdit::update_text(0, 9)],
        });
        fixture.renderer.queued.lock().push_back(bad);

        fixture.circuit.notify_location_changed(URI).expect("notify");
        wait_until(|| fixture.circuit.is_torn_down());

        assert_eq!(fixture.circuit.state(), CircuitState::Disposed);
        let events = fixture.events.lock().clone();
        assert!(matches!(events[0], CircuitEvent::ProtocolViolation(_)));
        assert_eq!(events[1], CircuitEvent::Disposed);
        assert!(fixture.client.batch_ids().is_empty());
    }

    #[test]
    fn startup_can_wait_on_remote_reply() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let startup: StartupAction = Arc::new(move |context: &mut CircuitContext| {
            let pending = context
                .channel()
                .invoke_js("app.readStorage", "[]")
                .map_err(|err| StartupError::new(err.to_string()))?;
            let _ = handle_tx.send(pending.handle());
            let value = pending
                .wait(Duration::from_secs(2))
                .map_err(|err| StartupError::new(err.to_string()))?;
            context.scope_mut().insert(value);
            Ok(())
        });
        let fixture = fixture_with(startup, MethodTable::default());

        let circuit = fixture.circuit.clone();
        let init = thread::spawn(move || circuit.initialize(URI, URI));

        let handle = handle_rx.recv().expect("startup began remote call");
        assert!(
            fixture
                .circuit
                .end_invoke_js(handle, true, "\"stored\"".to_string())
                .expect("reply accepted")
        );

        init.join().expect("init thread").expect("initialize");
        assert_eq!(fixture.circuit.state(), CircuitState::Active);
    }
}
