//! Tracing for agent-shaped objects: things with an `invoke`, a `stream`,
//! or an async `ainvoke` entry point.

use std::fmt::Display;
use std::future::Future;
use std::iter::FusedIterator;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use async_trait::async_trait;
use calltrace_core::{Trace, TraceContext, META_AGENT_NAME, META_METHOD, PARTIAL_CHUNKS_KEY};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::context;
use crate::tracker::{capture_value, elapsed_ms, panic_message, TraceOptions, Tracker};

pub trait Agent {
    type Input: Serialize;
    type Output: Serialize;
    type Error: Display;

    /// # Errors
    /// Agent-defined.
    fn invoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

pub trait StreamingAgent {
    type Input: Serialize;
    type Chunk: Serialize;
    type Error: Display;
    type Stream: Iterator<Item = Result<Self::Chunk, Self::Error>>;

    fn stream(&self, input: Self::Input) -> Self::Stream;
}

#[async_trait]
pub trait AsyncAgent: Send + Sync {
    type Input: Serialize + Send;
    type Output: Serialize + Send;
    type Error: Display + Send;

    /// # Errors
    /// Agent-defined.
    async fn ainvoke(&self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// Rebuilds one output value from streamed chunks.
///
/// When every chunk is a JSON object the objects are merged key by key:
/// arrays under the same key are concatenated, any other value is replaced
/// by the later one. Otherwise the last chunk is the output. No chunks
/// yields null.
#[must_use]
pub fn merge_chunks(chunks: &[Value]) -> Value {
    let Some(last) = chunks.last() else {
        return Value::Null;
    };
    if !chunks.iter().all(Value::is_object) {
        return last.clone();
    }

    let mut merged = Map::new();
    for chunk in chunks {
        let Value::Object(fields) = chunk else {
            continue;
        };
        for (key, value) in fields {
            if let (Some(Value::Array(existing)), Value::Array(more)) = (merged.get_mut(key), value)
            {
                existing.extend(more.iter().cloned());
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// An agent whose entry points each persist one trace per call.
pub struct TracedAgent<A> {
    agent: A,
    tracker: Tracker,
    options: TraceOptions,
}

impl<A> TracedAgent<A> {
    pub(crate) fn new(tracker: Tracker, agent: A, options: TraceOptions) -> Self {
        Self {
            agent,
            tracker,
            options,
        }
    }

    /// The wrapped agent, for anything other than the traced entry points.
    pub fn inner(&self) -> &A {
        &self.agent
    }

    pub fn into_inner(self) -> A {
        self.agent
    }

    pub fn name(&self) -> String {
        self.options.resolved_name::<A>()
    }

    fn metadata(&self, method: &str) -> Map<String, Value> {
        let mut metadata = self.options.metadata.clone();
        metadata.insert(META_AGENT_NAME.to_owned(), Value::String(self.name()));
        metadata.insert(META_METHOD.to_owned(), Value::String(method.to_owned()));
        metadata
    }
}

impl<A: Agent> TracedAgent<A> {
    /// # Errors
    /// Returns exactly the error the agent returned.
    pub fn invoke(&self, input: A::Input) -> Result<A::Output, A::Error> {
        let captured = capture_value(&input);
        self.tracker
            .run_sync(captured, self.metadata("invoke"), || self.agent.invoke(input))
    }
}

impl<A: AsyncAgent> TracedAgent<A> {
    /// # Errors
    /// Returns exactly the error the agent resolved to.
    pub fn ainvoke(
        &self,
        input: A::Input,
    ) -> impl Future<Output = Result<A::Output, A::Error>> + '_ {
        let captured = capture_value(&input);
        let fut = self.agent.ainvoke(input);
        self.tracker.run_async(captured, self.metadata("ainvoke"), fut)
    }
}

impl<A: StreamingAgent> TracedAgent<A> {
    /// Chunks pass through unchanged. The trace is written once the stream
    /// is exhausted or yields an error; a stream dropped before either
    /// writes nothing.
    ///
    /// The caller's context moves into the stream here, so consuming it
    /// later, on this thread or another, never touches a context slot.
    pub fn stream(&self, input: A::Input) -> TracedStream<A::Stream> {
        let captured = capture_value(&input);
        let started = Instant::now();
        let snapshot = context::take_context();
        let inner = self.agent.stream(input);
        let context = context::take_context().or(snapshot);
        TracedStream {
            inner,
            tracker: self.tracker.clone(),
            input: captured,
            metadata: self.metadata("stream"),
            context,
            started,
            chunks: Vec::new(),
            finished: false,
        }
    }
}

/// Iterator returned by [`TracedAgent::stream`].
pub struct TracedStream<S> {
    inner: S,
    tracker: Tracker,
    input: Value,
    metadata: Map<String, Value>,
    context: Option<TraceContext>,
    started: Instant,
    chunks: Vec<Value>,
    finished: bool,
}

impl<S> TracedStream<S> {
    /// Chunks captured so far.
    pub fn chunks(&self) -> &[Value] {
        &self.chunks
    }

    fn finish(&mut self, trace: Trace) {
        self.finished = true;
        let context = self.context.take();
        let duration_ms = elapsed_ms(self.started);
        let trace = trace
            .with_context(context)
            .with_duration_ms(Some(duration_ms))
            .with_metadata(std::mem::take(&mut self.metadata));
        self.tracker.persist(&trace);
    }

    fn input(&mut self) -> Value {
        std::mem::take(&mut self.input)
    }

    fn partial_output(&mut self) -> Value {
        if self.chunks.is_empty() {
            return Value::Null;
        }
        let mut output = Map::with_capacity(1);
        output.insert(
            PARTIAL_CHUNKS_KEY.to_owned(),
            Value::Array(std::mem::take(&mut self.chunks)),
        );
        Value::Object(output)
    }
}

impl<S, C, E> Iterator for TracedStream<S>
where
    S: Iterator<Item = Result<C, E>>,
    C: Serialize,
    E: Display,
{
    type Item = Result<C, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.inner.next())) {
            Ok(Some(Ok(chunk))) => {
                self.chunks.push(capture_value(&chunk));
                Some(Ok(chunk))
            }
            Ok(Some(Err(err))) => {
                let output = self.partial_output();
                let input = self.input();
                self.finish(Trace::failure(input, err.to_string()).with_output(output));
                Some(Err(err))
            }
            Ok(None) => {
                let output = merge_chunks(&self.chunks);
                let input = self.input();
                self.finish(Trace::success(input, output));
                None
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let output = self.partial_output();
                let input = self.input();
                self.finish(Trace::failure(input, format!("panic: {message}")).with_output(output));
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<S, C, E> FusedIterator for TracedStream<S>
where
    S: Iterator<Item = Result<C, E>>,
    C: Serialize,
    E: Display,
{
}
