use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use calltrace_core::{
    to_storable, Trace, TraceContext, TraceStatus, TraceStore, META_FUNCTION_NAME, META_IS_ASYNC,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::agent::TracedAgent;
use crate::context::{self, ClearOnDrop, Slot};

/// Static configuration of an instrumented callable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceOptions {
    /// Logical name; when empty the callable's type name is used.
    pub name: String,
    pub metadata: Map<String, Value>,
}

impl TraceOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.metadata.insert(key.into(), capture_value(value));
        self
    }

    pub(crate) fn resolved_name<F: ?Sized>(&self) -> String {
        if self.name.is_empty() {
            short_type_name::<F>()
        } else {
            self.name.clone()
        }
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    // Closures and async blocks name themselves `{{closure}}` / `{async block@..}`.
    base.split("::")
        .filter(|segment| !segment.is_empty() && !segment.starts_with('{'))
        .last()
        .unwrap_or(base)
        .to_owned()
}

/// Arguments of one call, captured for the trace's `input`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInput {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl CallInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        self.args.push(capture_value(value));
        self
    }

    #[must_use]
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.kwargs.insert(name.into(), capture_value(value));
        self
    }

    /// No arguments: null. One positional: that value. Only named: the
    /// name→value map. Anything else: `{args, kwargs}`.
    #[must_use]
    pub fn capture(self) -> Value {
        match (self.args.len(), self.kwargs.is_empty()) {
            (0, true) => Value::Null,
            (1, true) => self.args.into_iter().next().unwrap_or(Value::Null),
            (0, false) => Value::Object(self.kwargs),
            _ => {
                let mut both = Map::with_capacity(2);
                both.insert("args".to_owned(), Value::Array(self.args));
                both.insert("kwargs".to_owned(), Value::Object(self.kwargs));
                Value::Object(both)
            }
        }
    }
}

/// How a wrapped callable's argument value maps onto positional and named
/// arguments. Tuples are positional; [`Named`] is named.
pub trait IntoCallInput {
    fn call_input(&self) -> CallInput;
}

impl IntoCallInput for () {
    fn call_input(&self) -> CallInput {
        CallInput::new()
    }
}

impl IntoCallInput for CallInput {
    fn call_input(&self) -> CallInput {
        self.clone()
    }
}

macro_rules! positional_input {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> IntoCallInput for ($($name,)+) {
            #[allow(non_snake_case)]
            fn call_input(&self) -> CallInput {
                let ($($name,)+) = self;
                CallInput::new()$(.arg($name))+
            }
        }
    };
}

positional_input!(A);
positional_input!(A, B);
positional_input!(A, B, C);
positional_input!(A, B, C, D);
positional_input!(A, B, C, D, E);
positional_input!(A, B, C, D, E, G);

/// Named arguments: a struct (or map) whose fields become the `kwargs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Named<T>(pub T);

impl<T: Serialize> IntoCallInput for Named<T> {
    fn call_input(&self) -> CallInput {
        match capture_value(&self.0) {
            Value::Object(kwargs) => CallInput {
                args: Vec::new(),
                kwargs,
            },
            other => CallInput::new().arg(&other),
        }
    }
}

/// A trace the caller assembles by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    input: Value,
    output: Value,
    context: Option<TraceContext>,
    metadata: Map<String, Value>,
    status: TraceStatus,
    error: Option<String>,
    duration_ms: Option<f64>,
}

impl LogEntry {
    #[must_use]
    pub fn new<I, O>(input: &I, output: &O) -> Self
    where
        I: Serialize + ?Sized,
        O: Serialize + ?Sized,
    {
        Self {
            input: capture_value(input),
            output: capture_value(output),
            context: None,
            metadata: Map::new(),
            status: TraceStatus::Success,
            error: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: TraceContext) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_metadata<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.metadata.insert(key.into(), capture_value(value));
        self
    }

    /// Marks the entry as failed with this description.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = TraceStatus::Error;
        self.error = Some(error.into());
        self
    }

    /// Switching to success drops any error text.
    #[must_use]
    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = status;
        if status == TraceStatus::Success {
            self.error = None;
        }
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    fn into_trace(self) -> Trace {
        let base = match self.status {
            TraceStatus::Success => Trace::success(self.input, self.output),
            TraceStatus::Error => Trace::failure(
                self.input,
                self.error
                    .unwrap_or_else(|| "unspecified error".to_owned()),
            )
            .with_output(self.output),
        };
        base.with_context(self.context)
            .with_duration_ms(self.duration_ms)
            .with_metadata(self.metadata)
    }
}

enum Outcome<T, E> {
    Returned(T),
    Failed(E),
    Panicked(Box<dyn Any + Send>),
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// [`to_storable`], extended to a `Serialize` impl that panics.
pub(crate) fn capture_value<T: Serialize + ?Sized>(value: &T) -> Value {
    panic::catch_unwind(AssertUnwindSafe(|| to_storable(value))).unwrap_or_else(|payload| {
        Value::String(format!(
            "<unserializable: panic: {}>",
            panic_message(payload.as_ref())
        ))
    })
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_nanos() as f64 / 1_000_000.0
}

/// Entry point for instrumentation. Cheap to clone; all clones share the
/// same store.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn TraceStore>,
}

impl Tracker {
    #[must_use]
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }

    /// A tracker over the process-wide default store.
    #[must_use]
    pub fn global() -> Self {
        Self::new(crate::default_store())
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Runs `f` once, persisting one trace for it.
    ///
    /// # Errors
    /// Returns exactly the error `f` returned.
    pub fn call<O, E, F>(&self, options: &TraceOptions, input: CallInput, f: F) -> Result<O, E>
    where
        F: FnOnce() -> Result<O, E>,
        O: Serialize,
        E: Display,
    {
        let metadata = function_metadata(options, options.resolved_name::<F>(), false);
        self.run_sync(input.capture(), metadata, f)
    }

    /// Awaits `fut` once, persisting one trace for it.
    ///
    /// # Errors
    /// Returns exactly the error `fut` resolved to.
    pub fn call_async<O, E, Fut>(
        &self,
        options: &TraceOptions,
        input: CallInput,
        fut: Fut,
    ) -> impl Future<Output = Result<O, E>>
    where
        Fut: Future<Output = Result<O, E>>,
        O: Serialize,
        E: Display,
    {
        let metadata = function_metadata(options, options.resolved_name::<Fut>(), true);
        self.run_async(input.capture(), metadata, fut)
    }

    #[must_use]
    pub fn wrap<F>(&self, options: TraceOptions, f: F) -> Monitored<F> {
        let name = options.resolved_name::<F>();
        Monitored {
            tracker: self.clone(),
            metadata: function_metadata(&options, name, false),
            f,
        }
    }

    #[must_use]
    pub fn wrap_async<F>(&self, options: TraceOptions, f: F) -> MonitoredAsync<F> {
        let name = options.resolved_name::<F>();
        MonitoredAsync {
            tracker: self.clone(),
            metadata: function_metadata(&options, name, true),
            f,
        }
    }

    #[must_use]
    pub fn wrap_agent<A>(&self, agent: A, options: TraceOptions) -> TracedAgent<A> {
        TracedAgent::new(self.clone(), agent, options)
    }

    /// Persists a hand-built trace and returns it.
    pub fn log(&self, entry: LogEntry) -> Trace {
        let trace = entry.into_trace();
        self.store.save(&trace);
        trace
    }

    pub(crate) fn persist(&self, trace: &Trace) {
        self.store.save(trace);
    }

    pub(crate) fn run_sync<T, E, F>(
        &self,
        input: Value,
        metadata: Map<String, Value>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        T: Serialize,
        E: Display,
    {
        let slot = context::active_slot();
        let _clear = ClearOnDrop::new(slot);
        let snapshot = context::get_context();
        let started = Instant::now();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Outcome::Returned(value),
            Ok(Err(err)) => Outcome::Failed(err),
            Err(payload) => Outcome::Panicked(payload),
        };
        let duration_ms = elapsed_ms(started);
        let context = context::take_in(slot).or(snapshot);

        self.settle(input, metadata, context, duration_ms, outcome)
    }

    /// The caller's context is taken when this is called, not when the
    /// future is first polled. Outside a scope it moves into a scope owned
    /// by the returned future, so no thread slot is touched after this
    /// returns, whichever threads end up polling.
    pub(crate) fn run_async<T, E, Fut>(
        &self,
        input: Value,
        metadata: Map<String, Value>,
        fut: Fut,
    ) -> impl Future<Output = Result<T, E>>
    where
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        let tracker = self.clone();
        let slot = context::active_slot();
        let snapshot = match slot {
            Slot::Task => context::get_context(),
            Slot::Thread => context::take_in(Slot::Thread),
        };

        async move {
            let _clear = (slot == Slot::Task).then(|| ClearOnDrop::new(Slot::Task));
            let started = Instant::now();

            let observed = async {
                let result = AssertUnwindSafe(fut).catch_unwind().await;
                (result, context::take_context())
            };
            let (result, during) = match slot {
                Slot::Task => observed.await,
                Slot::Thread => context::scope_with(snapshot.clone(), observed).await,
            };

            let outcome = match result {
                Ok(Ok(value)) => Outcome::Returned(value),
                Ok(Err(err)) => Outcome::Failed(err),
                Err(payload) => Outcome::Panicked(payload),
            };
            let duration_ms = elapsed_ms(started);
            let context = during.or(snapshot);

            tracker.settle(input, metadata, context, duration_ms, outcome)
        }
    }

    fn settle<T, E>(
        &self,
        input: Value,
        metadata: Map<String, Value>,
        context: Option<TraceContext>,
        duration_ms: f64,
        outcome: Outcome<T, E>,
    ) -> Result<T, E>
    where
        T: Serialize,
        E: Display,
    {
        let build = |trace: Trace| {
            trace
                .with_context(context)
                .with_duration_ms(Some(duration_ms))
                .with_metadata(metadata)
        };

        match outcome {
            Outcome::Returned(value) => {
                self.persist(&build(Trace::success(input, capture_value(&value))));
                Ok(value)
            }
            Outcome::Failed(err) => {
                self.persist(&build(Trace::failure(input, err.to_string())));
                Err(err)
            }
            Outcome::Panicked(payload) => {
                let message = format!("panic: {}", panic_message(payload.as_ref()));
                self.persist(&build(Trace::failure(input, message)));
                panic::resume_unwind(payload)
            }
        }
    }
}

fn function_metadata(options: &TraceOptions, name: String, is_async: bool) -> Map<String, Value> {
    let mut metadata = options.metadata.clone();
    metadata.insert(META_FUNCTION_NAME.to_owned(), Value::String(name));
    metadata.insert(META_IS_ASYNC.to_owned(), Value::Bool(is_async));
    metadata
}

/// A synchronous callable that records a trace on every call.
pub struct Monitored<F> {
    tracker: Tracker,
    metadata: Map<String, Value>,
    f: F,
}

impl<F> Monitored<F> {
    /// # Errors
    /// Returns exactly the error the wrapped callable returned.
    pub fn call<Args, O, E>(&self, args: Args) -> Result<O, E>
    where
        F: Fn(Args) -> Result<O, E>,
        Args: IntoCallInput,
        O: Serialize,
        E: Display,
    {
        let input = args.call_input().capture();
        self.tracker
            .run_sync(input, self.metadata.clone(), || (self.f)(args))
    }

    pub fn inner(&self) -> &F {
        &self.f
    }
}

/// An asynchronous callable that records a trace on every call.
pub struct MonitoredAsync<F> {
    tracker: Tracker,
    metadata: Map<String, Value>,
    f: F,
}

impl<F> MonitoredAsync<F> {
    /// # Errors
    /// Returns exactly the error the wrapped future resolved to.
    pub fn call<Args, Fut, O, E>(&self, args: Args) -> impl Future<Output = Result<O, E>>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<O, E>>,
        Args: IntoCallInput,
        O: Serialize,
        E: Display,
    {
        let input = args.call_input().capture();
        let fut = (self.f)(args);
        self.tracker.run_async(input, self.metadata.clone(), fut)
    }

    pub fn inner(&self) -> &F {
        &self.f
    }
}
