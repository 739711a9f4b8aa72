//! Call instrumentation: wraps sync and async callables (and agent objects)
//! so that every invocation produces exactly one persisted [`Trace`], while
//! the caller sees the same result or failure it would have seen unwrapped.
//!
//! [`Trace`]: calltrace_core::Trace

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use calltrace_core::TraceStore;
use calltrace_store_sqlite::SqliteTraceStore;

mod agent;
pub mod context;
mod tracker;

pub use agent::{merge_chunks, Agent, AsyncAgent, StreamingAgent, TracedAgent, TracedStream};
pub use context::{clear_context, get_context, scope, set_context, sync_scope, take_context};
pub use tracker::{
    CallInput, IntoCallInput, LogEntry, Monitored, MonitoredAsync, Named, TraceOptions, Tracker,
};

pub const DB_PATH_ENV: &str = "CALLTRACE_DB";
pub const DEFAULT_DB_FILE: &str = "calltrace.db";

static DEFAULT_STORE: OnceLock<Arc<dyn TraceStore>> = OnceLock::new();

/// `CALLTRACE_DB` when set and non-empty, else `./calltrace.db`.
#[must_use]
pub fn default_db_path() -> PathBuf {
    std::env::var_os(DB_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_DB_FILE), PathBuf::from)
}

/// Installs the process-wide store. Only the first installation (explicit
/// or lazy) takes effect; returns whether this one did.
pub fn set_default_store(store: Arc<dyn TraceStore>) -> bool {
    DEFAULT_STORE.set(store).is_ok()
}

/// The process-wide store, created lazily at [`default_db_path`] on first use.
pub fn default_store() -> Arc<dyn TraceStore> {
    Arc::clone(DEFAULT_STORE.get_or_init(|| {
        let path = default_db_path();
        tracing::debug!(db = %path.display(), "initialising default trace store");
        Arc::new(SqliteTraceStore::new(path))
    }))
}
