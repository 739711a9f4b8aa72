use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use calltrace_core::{ListQuery, TraceContext, TraceStatus, TraceStore};
use calltrace_store_sqlite::SqliteTraceStore;
use calltrace_tracker::{
    get_context, scope, set_context, CallInput, LogEntry, Named, TraceOptions, Tracker,
};
use serde::Serialize;
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

fn all(store: &SqliteTraceStore) -> Vec<calltrace_core::Trace> {
    store.list(&ListQuery::new(1_000))
}

fn add((a, b): (i64, i64)) -> Result<i64, String> {
    Ok(a + b)
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("{0}")]
struct AgentError(String);

/// Pending on the first poll, ready on the second.
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

fn user_of(context: Option<&TraceContext>) -> Option<Value> {
    context.and_then(|c| c.data.get("user").cloned())
}

#[test]
fn sync_success_records_positional_input_and_output() {
    let (tracker, store) = fresh();
    let monitored = tracker.wrap(TraceOptions::default(), add);

    assert_eq!(monitored.call((2, 3)), Ok(5));

    let traces = all(&store);
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.input, json!({"args": [2, 3], "kwargs": {}}));
    assert_eq!(trace.output, json!(5));
    assert_eq!(trace.status, TraceStatus::Success);
    assert!(trace.error.is_none());
    assert!(trace.duration_ms.is_some_and(|ms| ms >= 0.0));
    assert_eq!(trace.metadata.get("function_name"), Some(&json!("add")));
    assert_eq!(trace.metadata.get("is_async"), Some(&json!(false)));
}

#[test]
fn single_argument_is_stored_bare() {
    let (tracker, store) = fresh();
    let greet = tracker.wrap(TraceOptions::new("greeter"), |(name,): (&str,)| {
        Ok::<_, String>(format!("Hello, {name}!"))
    });

    assert_eq!(must(greet.call(("World",))), "Hello, World!");

    let traces = all(&store);
    assert_eq!(traces[0].input, json!("World"));
    assert_eq!(traces[0].output, json!("Hello, World!"));
    assert_eq!(traces[0].metadata.get("function_name"), Some(&json!("greeter")));
}

#[test]
fn named_arguments_become_the_input_map() {
    #[derive(Serialize)]
    struct Search {
        query: String,
        top_k: u32,
    }

    let (tracker, store) = fresh();
    let search = tracker.wrap(TraceOptions::new("search"), |Named(req): Named<Search>| {
        Ok::<_, String>(vec![req.query; req.top_k as usize])
    });

    let hits = must(search.call(Named(Search {
        query: "shoes".to_owned(),
        top_k: 2,
    })));
    assert_eq!(hits.len(), 2);
    assert_eq!(all(&store)[0].input, json!({"query": "shoes", "top_k": 2}));
}

#[test]
fn mixed_arguments_through_call_input() {
    let (tracker, store) = fresh();
    let input = CallInput::new().arg(&5).kwarg("b", &20);

    let result = tracker.call(&TraceOptions::new("power"), input, || Ok::<_, String>(25));

    assert_eq!(result, Ok(25));
    assert_eq!(all(&store)[0].input, json!({"args": [5], "kwargs": {"b": 20}}));
}

#[test]
fn failures_are_recorded_and_returned_unchanged() {
    let (tracker, store) = fresh();
    let failing = tracker.wrap(TraceOptions::new("validator"), |(_input,): (&str,)| {
        Err::<i64, _>(AgentError("bad input".to_owned()))
    });

    assert_eq!(
        failing.call(("payload",)),
        Err(AgentError("bad input".to_owned()))
    );

    let traces = all(&store);
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Error);
    assert_eq!(traces[0].error.as_deref(), Some("bad input"));
    assert_eq!(traces[0].output, Value::Null);
    assert_eq!(traces[0].input, json!("payload"));
}

#[test]
fn static_metadata_is_attached_but_reserved_keys_win() {
    let (tracker, store) = fresh();
    let options = TraceOptions::new("versioned")
        .with_metadata("version", "1.0")
        .with_metadata("env", "test")
        .with_metadata("function_name", "shadowed");
    let monitored = tracker.wrap(options, add);

    must(monitored.call((1, 1)));

    let metadata = &all(&store)[0].metadata;
    assert_eq!(metadata.get("version"), Some(&json!("1.0")));
    assert_eq!(metadata.get("env"), Some(&json!("test")));
    assert_eq!(metadata.get("function_name"), Some(&json!("versioned")));
}

#[test]
fn context_applies_to_exactly_one_call() {
    let (tracker, store) = fresh();
    let monitored = tracker.wrap(TraceOptions::new("balance"), add);

    set_context(TraceContext::new().with("api_balance", &1000).with_source("billing"));
    must(monitored.call((1, 2)));
    assert_eq!(get_context(), None);
    must(monitored.call((3, 4)));

    let traces = all(&store);
    assert_eq!(traces.len(), 2);
    let with_context = traces
        .iter()
        .find(|t| t.input == json!({"args": [1, 2], "kwargs": {}}))
        .and_then(|t| t.context.clone());
    let context = with_context.unwrap_or_else(|| panic!("first call lost its context"));
    assert_eq!(context.data.get("api_balance"), Some(&json!(1000)));
    assert_eq!(context.source.as_deref(), Some("billing"));

    let second = traces
        .iter()
        .find(|t| t.input == json!({"args": [3, 4], "kwargs": {}}));
    assert!(second.is_some_and(|t| t.context.is_none()));
}

#[test]
fn context_set_during_the_call_is_captured() {
    let (tracker, store) = fresh();
    let monitored = tracker.wrap(TraceOptions::new("inner_ctx"), |(n,): (i64,)| {
        set_context(TraceContext::new().with("seen", &n));
        Ok::<_, String>(n)
    });

    must(monitored.call((9,)));

    let context = all(&store)[0].context.clone();
    assert_eq!(
        context.and_then(|c| c.data.get("seen").cloned()),
        Some(json!(9))
    );
    assert_eq!(get_context(), None);
}

#[test]
fn unserializable_output_is_replaced_not_fatal() {
    struct Weird;
    impl Serialize for Weird {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no representation"))
        }
    }

    let (tracker, store) = fresh();
    let result = tracker.call(&TraceOptions::new("weird"), CallInput::new(), || {
        Ok::<_, String>(Weird)
    });

    assert!(result.is_ok());
    let trace = &all(&store)[0];
    assert_eq!(trace.status, TraceStatus::Success);
    assert!(trace
        .output
        .as_str()
        .is_some_and(|text| text.starts_with("<unserializable")));
}

#[test]
fn panicking_serialize_impl_is_replaced_not_fatal() {
    struct Volatile;
    impl Serialize for Volatile {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            panic!("serializer exploded")
        }
    }

    let (tracker, store) = fresh();
    let result = tracker.call(
        &TraceOptions::new("volatile"),
        CallInput::new().arg(&Volatile),
        || Ok::<_, String>(Volatile),
    );

    assert!(result.is_ok());
    let traces = all(&store);
    assert_eq!(traces.len(), 1);
    let placeholder = json!("<unserializable: panic: serializer exploded>");
    assert_eq!(traces[0].status, TraceStatus::Success);
    assert_eq!(traces[0].input, placeholder);
    assert_eq!(traces[0].output, placeholder);
}

#[test]
fn panics_are_recorded_then_resumed() {
    let (tracker, store) = fresh();
    let exploding = tracker.wrap(TraceOptions::new("exploding"), |(): ()| -> Result<i64, String> {
        panic!("kaboom")
    });

    set_context(TraceContext::new().with("before", &true));
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| exploding.call(())));

    assert!(caught.is_err());
    assert_eq!(get_context(), None);
    let traces = all(&store);
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Error);
    assert_eq!(traces[0].error.as_deref(), Some("panic: kaboom"));
    assert!(traces[0].context.is_some());
}

#[test]
fn storage_faults_never_reach_the_caller() {
    let dir = std::env::temp_dir().join(format!("calltrace-missing-{}", ulid::Ulid::new()));
    let store = Arc::new(SqliteTraceStore::new(dir.join("nested").join("traces.db")));
    let tracker = Tracker::new(store);
    let monitored = tracker.wrap(TraceOptions::new("fault"), add);

    assert_eq!(monitored.call((20, 22)), Ok(42));
    assert_eq!(tracker.store().count(None), 0);
}

#[test]
fn manual_log_persists_and_returns_the_trace() {
    let (tracker, store) = fresh();

    let trace = tracker.log(
        LogEntry::new("question", "answer")
            .with_context(TraceContext::new().with("key", "value"))
            .with_metadata("user", "123")
            .with_duration_ms(50.5),
    );

    let loaded = store.load(trace.id);
    assert_eq!(loaded.as_ref(), Some(&trace));
    assert_eq!(trace.input, json!("question"));
    assert_eq!(trace.output, json!("answer"));
    assert_eq!(trace.duration_ms, Some(50.5));
    assert_eq!(trace.metadata.get("user"), Some(&json!("123")));
    assert_eq!(
        trace.context.and_then(|c| c.data.get("key").cloned()),
        Some(json!("value"))
    );
}

#[test]
fn manual_error_log_keeps_output() {
    let (tracker, store) = fresh();

    let trace = tracker.log(LogEntry::new("q", &Value::Null).with_error("Failed to process"));

    assert_eq!(trace.status, TraceStatus::Error);
    assert_eq!(trace.error.as_deref(), Some("Failed to process"));
    assert_eq!(store.count(Some(TraceStatus::Error)), 1);
}

#[tokio::test]
async fn async_success_and_failure() {
    let (tracker, store) = fresh();
    let fetch = tracker.wrap_async(TraceOptions::new("fetch"), |(id,): (u32,)| async move {
        tokio::task::yield_now().await;
        if id == 0 {
            Err(AgentError("missing id".to_owned()))
        } else {
            Ok(json!({"id": id, "name": "widget"}))
        }
    });

    let found = must(fetch.call((7,)).await);
    assert_eq!(found["id"], json!(7));
    assert_eq!(
        fetch.call((0,)).await,
        Err(AgentError("missing id".to_owned()))
    );

    assert_eq!(store.count(Some(TraceStatus::Success)), 1);
    assert_eq!(store.count(Some(TraceStatus::Error)), 1);
    for trace in all(&store) {
        assert_eq!(trace.metadata.get("is_async"), Some(&json!(true)));
        assert_eq!(trace.metadata.get("function_name"), Some(&json!("fetch")));
    }
}

#[tokio::test]
async fn async_context_outside_any_scope_applies_once() {
    let (tracker, store) = fresh();
    let echo = tracker.wrap_async(TraceOptions::new("echo"), |(n,): (i64,)| async move {
        Ok::<_, String>(n)
    });

    set_context(TraceContext::new().with("user", "u-1"));
    must(echo.call((1,)).await);
    assert_eq!(get_context(), None);
    must(echo.call((2,)).await);

    let traces = all(&store);
    let first = traces.iter().find(|t| t.input == json!(1));
    let second = traces.iter().find(|t| t.input == json!(2));
    assert!(first.is_some_and(|t| t.context.is_some()));
    assert!(second.is_some_and(|t| t.context.is_none()));
}

#[test]
fn async_call_resumed_on_another_thread_leaves_both_threads_clean() {
    let (tracker, store) = fresh();
    let echo = tracker.wrap_async(TraceOptions::new("echo"), |(n,): (i64,)| async move {
        YieldOnce(false).await;
        Ok::<_, String>(n)
    });

    set_context(TraceContext::new().with("user", "u-1"));
    let mut pending = Box::pin(echo.call((1,)));
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    assert!(pending.as_mut().poll(&mut cx).is_pending());
    assert_eq!(get_context(), None);

    let resumed = std::thread::spawn(move || {
        set_context(TraceContext::new().with("user", "u-2"));
        let result = futures::executor::block_on(pending);
        (result, get_context())
    });
    let (result, left_behind) = match resumed.join() {
        Ok(outcome) => outcome,
        Err(_) => panic!("resuming thread panicked"),
    };
    assert_eq!(result, Ok(1));
    assert_eq!(user_of(left_behind.as_ref()), Some(json!("u-2")));

    assert_eq!(get_context(), None);
    let monitored = tracker.wrap(TraceOptions::new("add"), add);
    must(monitored.call((2, 3)));

    let traces = all(&store);
    assert_eq!(traces.len(), 2);
    let echoed = traces.iter().find(|t| t.input == json!(1));
    assert_eq!(
        echoed.and_then(|t| user_of(t.context.as_ref())),
        Some(json!("u-1"))
    );
    let added = traces
        .iter()
        .find(|t| t.input == json!({"args": [2, 3], "kwargs": {}}));
    assert!(added.is_some_and(|t| t.context.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_keep_their_own_context() {
    let (tracker, store) = fresh();
    let tracker = Arc::new(tracker);

    let handles: Vec<_> = (0..24_i64)
        .map(|n| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(scope(async move {
                set_context(TraceContext::new().with("request", &n));
                let slow = tracker.wrap_async(TraceOptions::new("slow"), |(n,): (i64,)| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(3)).await;
                    Ok::<_, String>(n * 10)
                });
                slow.call((n,)).await
            }))
        })
        .collect();

    for handle in handles {
        assert!(matches!(handle.await, Ok(Ok(_))));
    }

    let traces = all(&store);
    assert_eq!(traces.len(), 24);
    for trace in traces {
        let request = trace
            .context
            .as_ref()
            .and_then(|c| c.data.get("request").cloned());
        assert_eq!(request, Some(trace.input.clone()));
        assert_eq!(trace.output, json!(trace.input.as_i64().unwrap_or(-1) * 10));
    }
}
