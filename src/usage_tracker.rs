//! Cross-call usage aggregation for opaque third-party callers
//!
//! Some blocks call libraries that make provider calls internally without
//! returning token usage. The provider gateway fires a success hook after
//! each call; the hook resolves a trace id from the call's metadata or the
//! worker-local fallback set by the block, and accumulates counters here.
//! The block retrieves and clears its entry at end of execute.

use crate::pipeline::TokenCounts;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::OnceLock;

thread_local! {
    /// Fallback trace id for calls that carry no metadata. Each job worker
    /// runs its executions on a dedicated thread, so the binding holds for
    /// the whole pipeline run.
    static CURRENT_TRACE_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Bind the current trace id before calling into an opaque library
pub fn set_current_trace_id(trace_id: Option<String>) {
    CURRENT_TRACE_ID.with(|cell| *cell.borrow_mut() = trace_id);
}

/// The trace id bound to this worker, if any
pub fn current_trace_id() -> Option<String> {
    CURRENT_TRACE_ID.with(|cell| cell.borrow().clone())
}

/// Mutex-guarded accumulator of token counters per trace id
#[derive(Default)]
pub struct UsageTracker {
    usage: Mutex<HashMap<String, TokenCounts>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-global tracker instance, shared by the provider gateway
    pub fn global() -> &'static UsageTracker {
        static TRACKER: OnceLock<UsageTracker> = OnceLock::new();
        TRACKER.get_or_init(UsageTracker::new)
    }

    /// Success hook fired by the provider gateway. Resolves the trace id
    /// from call metadata first, then the worker-local binding; calls with
    /// no resolvable trace id are ignored.
    pub fn on_provider_success(&self, metadata_trace_id: Option<&str>, counts: &TokenCounts) {
        let trace_id = metadata_trace_id
            .map(str::to_string)
            .or_else(current_trace_id);
        let Some(trace_id) = trace_id else {
            return;
        };
        self.record(&trace_id, counts);
    }

    /// Accumulate counters for an execution
    pub fn record(&self, trace_id: &str, counts: &TokenCounts) {
        let mut usage = self.usage.lock();
        usage.entry(trace_id.to_string()).or_default().add(counts);
    }

    /// Take the accumulated counters for an execution, clearing the entry
    pub fn get_and_clear(&self, trace_id: &str) -> TokenCounts {
        self.usage.lock().remove(trace_id).unwrap_or_default()
    }

    /// Drop all tracked usage
    pub fn clear_all(&self) {
        self.usage.lock().clear();
    }
}
