use crate::{Trace, TraceId, TraceStatus};

pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
    pub status: Option<TraceStatus>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            status: None,
        }
    }
}

impl ListQuery {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Option<TraceStatus>) -> Self {
        self.status = status;
        self
    }
}

/// Durable home for trace records.
///
/// Everything on the hot path is fail-safe: a storage fault is logged and
/// turned into a neutral result (`save` does nothing, `load` yields `None`,
/// `list` and `iter` yield nothing, `count` yields 0) so that tracing never
/// breaks the instrumented program. Only [`TraceStore::clear`] reports
/// faults to its caller.
pub trait TraceStore: Send + Sync {
    /// Inserts the trace, replacing any stored trace with the same id.
    fn save(&self, trace: &Trace);

    fn load(&self, id: TraceId) -> Option<Trace>;

    /// Newest first, ties broken by id descending.
    fn list(&self, query: &ListQuery) -> Vec<Trace>;

    fn count(&self, status: Option<TraceStatus>) -> u64;

    /// Lazily walks every stored trace, newest first. Stops at the first fault.
    fn iter(&self) -> Box<dyn Iterator<Item = Trace> + Send + '_>;

    /// Removes every trace.
    ///
    /// # Errors
    /// Propagates storage faults.
    fn clear(&self) -> anyhow::Result<()>;
}
