use std::sync::Arc;

use async_trait::async_trait;
use calltrace_core::{ListQuery, Trace, TraceContext, TraceStatus, TraceStore};
use calltrace_store_sqlite::SqliteTraceStore;
use calltrace_tracker::{
    get_context, set_context, Agent, AsyncAgent, StreamingAgent, TraceOptions, Tracker,
};
use serde_json::{json, Value};

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fn fresh() -> (Tracker, Arc<SqliteTraceStore>) {
    let store = Arc::new(must(SqliteTraceStore::in_memory()));
    (Tracker::new(store.clone()), store)
}

fn only(store: &SqliteTraceStore) -> Trace {
    let mut traces = store.list(&ListQuery::default());
    assert_eq!(traces.len(), 1, "expected exactly one trace");
    traces.remove(0)
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct AgentError(String);

/// Replies to a message list; errors when the list is empty.
struct EchoAgent;

impl Agent for EchoAgent {
    type Input = Value;
    type Output = Value;
    type Error = AgentError;

    fn invoke(&self, input: Value) -> Result<Value, AgentError> {
        match input["messages"].as_array() {
            Some(messages) if !messages.is_empty() => {
                Ok(json!({"messages": [{"role": "assistant", "content": "ok"}]}))
            }
            _ => Err(AgentError("no messages".to_owned())),
        }
    }
}

/// Emits `steps` chunks, failing at `fail_at` when set.
struct StepAgent {
    steps: usize,
    fail_at: Option<usize>,
}

impl StreamingAgent for StepAgent {
    type Input = String;
    type Chunk = Value;
    type Error = AgentError;
    type Stream = std::vec::IntoIter<Result<Value, AgentError>>;

    fn stream(&self, input: String) -> Self::Stream {
        let mut items = Vec::new();
        for step in 0..self.steps {
            if self.fail_at == Some(step) {
                items.push(Err(AgentError(format!("step {step} failed"))));
                break;
            }
            items.push(Ok(json!({"messages": [format!("{input}-{step}")], "step": step})));
        }
        items.into_iter()
    }
}

struct SlowAgent;

#[async_trait]
impl AsyncAgent for SlowAgent {
    type Input = u64;
    type Output = u64;
    type Error = AgentError;

    async fn ainvoke(&self, input: u64) -> Result<u64, AgentError> {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        if input == 0 {
            Err(AgentError("zero".to_owned()))
        } else {
            Ok(input * 2)
        }
    }
}

#[test]
fn invoke_records_agent_name_and_method() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(EchoAgent, TraceOptions::new("react_agent"));
    let input = json!({"messages": [{"role": "user", "content": "hi"}]});

    let output = must(agent.invoke(input.clone()));

    let trace = only(&store);
    assert_eq!(trace.input, input);
    assert_eq!(trace.output, output);
    assert_eq!(trace.metadata.get("agent_name"), Some(&json!("react_agent")));
    assert_eq!(trace.metadata.get("method"), Some(&json!("invoke")));
}

#[test]
fn agent_name_defaults_to_its_type() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(EchoAgent, TraceOptions::default());

    assert!(agent.invoke(json!({"messages": []})).is_err());

    let trace = only(&store);
    assert_eq!(trace.metadata.get("agent_name"), Some(&json!("EchoAgent")));
    assert_eq!(trace.status, TraceStatus::Error);
    assert_eq!(trace.error.as_deref(), Some("no messages"));
    assert_eq!(trace.output, Value::Null);
}

#[test]
fn full_stream_merges_chunks_into_one_success() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 3,
            fail_at: None,
        },
        TraceOptions::new("stepper"),
    );

    set_context(TraceContext::new().with("session", "s-1"));
    let chunks: Vec<Value> = agent.stream("go".to_owned()).map(must).collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(get_context(), None);

    let trace = only(&store);
    assert_eq!(trace.status, TraceStatus::Success);
    assert_eq!(trace.input, json!("go"));
    assert_eq!(
        trace.output,
        json!({"messages": ["go-0", "go-1", "go-2"], "step": 2})
    );
    assert_eq!(trace.metadata.get("method"), Some(&json!("stream")));
    assert!(trace.context.is_some());
}

#[test]
fn failing_stream_keeps_partial_chunks() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 5,
            fail_at: Some(2),
        },
        TraceOptions::new("stepper"),
    );

    let mut stream = agent.stream("x".to_owned());
    assert!(matches!(stream.next(), Some(Ok(_))));
    assert!(matches!(stream.next(), Some(Ok(_))));
    match stream.next() {
        Some(Err(err)) => assert_eq!(err.to_string(), "step 2 failed"),
        _ => panic!("third item should be the failure"),
    }
    assert!(stream.next().is_none());
    drop(stream);

    let trace = only(&store);
    assert_eq!(trace.status, TraceStatus::Error);
    assert_eq!(trace.error.as_deref(), Some("step 2 failed"));
    assert_eq!(
        trace.output["partial_chunks"].as_array().map(Vec::len),
        Some(2)
    );
}

#[test]
fn stream_failing_immediately_has_null_output() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 1,
            fail_at: Some(0),
        },
        TraceOptions::default(),
    );

    let items: Vec<_> = agent.stream("y".to_owned()).collect();
    assert_eq!(items.len(), 1);

    let trace = only(&store);
    assert_eq!(trace.output, Value::Null);
}

#[test]
fn empty_stream_succeeds_with_null_output() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 0,
            fail_at: None,
        },
        TraceOptions::default(),
    );

    assert_eq!(agent.stream("z".to_owned()).count(), 0);

    let trace = only(&store);
    assert_eq!(trace.status, TraceStatus::Success);
    assert_eq!(trace.output, Value::Null);
}

#[test]
fn abandoned_stream_writes_nothing_and_clears_context() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 4,
            fail_at: None,
        },
        TraceOptions::default(),
    );

    set_context(TraceContext::new().with("k", &1));
    let mut stream = agent.stream("w".to_owned());
    assert!(matches!(stream.next(), Some(Ok(_))));
    drop(stream);

    assert_eq!(store.count(None), 0);
    assert_eq!(get_context(), None);
}

#[test]
fn stream_consumed_on_another_thread_keeps_the_callers_context() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 2,
            fail_at: None,
        },
        TraceOptions::new("stepper"),
    );

    set_context(TraceContext::new().with("session", "s-1"));
    let stream = agent.stream("go".to_owned());
    assert_eq!(get_context(), None);

    let consumer = std::thread::spawn(move || {
        set_context(TraceContext::new().with("session", "s-2"));
        let consumed = stream.map(must).count();
        (consumed, get_context())
    });
    let (consumed, left_behind) = match consumer.join() {
        Ok(outcome) => outcome,
        Err(_) => panic!("consuming thread panicked"),
    };

    assert_eq!(consumed, 2);
    assert_eq!(
        left_behind.and_then(|c| c.data.get("session").cloned()),
        Some(json!("s-2"))
    );
    let trace = only(&store);
    assert_eq!(
        trace.context.and_then(|c| c.data.get("session").cloned()),
        Some(json!("s-1"))
    );
}

#[tokio::test]
async fn ainvoke_records_success_and_failure() {
    let (tracker, store) = fresh();
    let agent = tracker.wrap_agent(SlowAgent, TraceOptions::new("doubler"));

    assert_eq!(must(agent.ainvoke(21).await), 42);
    assert!(agent.ainvoke(0).await.is_err());

    let traces = store.list(&ListQuery::default());
    assert_eq!(traces.len(), 2);
    for trace in &traces {
        assert_eq!(trace.metadata.get("method"), Some(&json!("ainvoke")));
        assert_eq!(trace.metadata.get("agent_name"), Some(&json!("doubler")));
    }
    assert_eq!(store.count(Some(TraceStatus::Error)), 1);
    assert!(traces
        .iter()
        .any(|t| t.input == json!(21) && t.output == json!(42)));
}

#[test]
fn inner_agent_stays_reachable() {
    let (tracker, _store) = fresh();
    let agent = tracker.wrap_agent(
        StepAgent {
            steps: 7,
            fail_at: None,
        },
        TraceOptions::default(),
    );

    assert_eq!(agent.inner().steps, 7);
    assert_eq!(agent.into_inner().steps, 7);
}
