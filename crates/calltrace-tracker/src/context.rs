//! The "current context" slot read by instrumented calls.
//!
//! Inside [`scope`] / [`sync_scope`] the slot belongs to that logical call
//! chain (a tokio task-local), so concurrent tasks never see each other's
//! context even when they share a worker thread. Outside any scope the slot
//! falls back to a per-thread value.

use std::cell::RefCell;
use std::future::Future;

use calltrace_core::TraceContext;

tokio::task_local! {
    static TASK_CONTEXT: RefCell<Option<TraceContext>>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Task,
    Thread,
}

pub(crate) fn active_slot() -> Slot {
    if TASK_CONTEXT.try_with(|_| ()).is_ok() {
        Slot::Task
    } else {
        Slot::Thread
    }
}

fn with_slot<R>(slot: Slot, f: impl FnOnce(&RefCell<Option<TraceContext>>) -> R) -> Option<R> {
    match slot {
        Slot::Task => TASK_CONTEXT.try_with(f).ok(),
        Slot::Thread => THREAD_CONTEXT.try_with(f).ok(),
    }
}

pub(crate) fn take_in(slot: Slot) -> Option<TraceContext> {
    with_slot(slot, |cell| cell.borrow_mut().take()).flatten()
}

/// Clears a slot when dropped, whatever way the owning call exits.
pub(crate) struct ClearOnDrop {
    slot: Slot,
}

impl ClearOnDrop {
    pub(crate) fn new(slot: Slot) -> Self {
        Self { slot }
    }
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        let _ = take_in(self.slot);
    }
}

/// Replaces the current context of the calling call chain.
pub fn set_context(context: TraceContext) {
    let _ = with_slot(active_slot(), |cell| *cell.borrow_mut() = Some(context));
}

#[must_use]
pub fn get_context() -> Option<TraceContext> {
    with_slot(active_slot(), |cell| cell.borrow().clone()).flatten()
}

pub fn clear_context() {
    let _ = take_in(active_slot());
}

/// Removes and returns the current context.
pub fn take_context() -> Option<TraceContext> {
    take_in(active_slot())
}

/// Runs `fut` with its own context slot, initially empty.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    scope_with(None, fut).await
}

pub(crate) async fn scope_with<F: Future>(initial: Option<TraceContext>, fut: F) -> F::Output {
    TASK_CONTEXT.scope(RefCell::new(initial), fut).await
}

/// Runs `f` with its own context slot, initially empty.
pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
    TASK_CONTEXT.sync_scope(RefCell::new(None), f)
}
