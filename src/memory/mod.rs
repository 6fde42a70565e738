//! Process-wide memory budget with per-task reservations.
//!
//! The tracker is advisory: it never aborts work. Components ask for a
//! reservation before materializing, and decide themselves what to do with a
//! denial (typically: surface a [`MemoryError`] in the result envelope).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{MemoryError, MEMORY_LIMIT_EXCEEDED};

/// Default process-wide budget: 1 GiB.
pub const DEFAULT_MEMORY_LIMIT: usize = 1024 * 1024 * 1024;

/// Fraction of the budget above which subsystems are warned to degrade.
pub const SOFT_LIMIT_RATIO: f64 = 0.78;

/// Identifies one reservation-holding task (typically one running query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Default, Clone, Copy)]
struct TaskAlloc {
    allocated_bytes: usize,
    used_bytes: usize,
}

#[derive(Debug)]
struct TrackerState {
    global_limit_bytes: usize,
    allow_partial: bool,
    tasks: HashMap<TaskId, TaskAlloc>,
    next_task: u64,
    soft_warned: bool,
}

/// The outcome of [`MemoryTracker::request_allocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub success: bool,
    /// Bytes actually reserved. May be less than requested under partial fills.
    pub allocated_bytes: usize,
    pub error: Option<MemoryError>,
}

/// Process-wide byte budget with per-task reservations.
#[derive(Debug)]
pub struct MemoryTracker {
    state: Mutex<TrackerState>,
}

impl MemoryTracker {
    /// A tracker with the given budget and full-or-nothing allocations.
    pub fn new(global_limit_bytes: usize) -> Self {
        Self::with_partial_fills(global_limit_bytes, false)
    }

    /// A tracker that may grant part of a request instead of denying it.
    pub fn with_partial_fills(global_limit_bytes: usize, allow_partial: bool) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                global_limit_bytes,
                allow_partial,
                tasks: HashMap::new(),
                next_task: 0,
                soft_warned: false,
            }),
        }
    }

    /// The conventional process-wide instance, with [`DEFAULT_MEMORY_LIMIT`].
    pub fn global() -> Arc<MemoryTracker> {
        static GLOBAL: OnceLock<Arc<MemoryTracker>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(MemoryTracker::new(DEFAULT_MEMORY_LIMIT)))
            .clone()
    }

    /// Registers a new task and returns its id.
    pub fn new_task(&self) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = TaskId(state.next_task);
        state.next_task += 1;
        state.tasks.insert(id, TaskAlloc::default());
        id
    }

    /// Reserves `requested_bytes` for `task`.
    ///
    /// Succeeds fully when the sum of reservations stays within the budget.
    /// Otherwise, with partial fills enabled and some budget left, grants the
    /// remainder; with nothing left (or partial fills disabled) denies with a
    /// [`MemoryError`] describing the shortfall. Denial is a returned value,
    /// not an error: the caller decides whether to proceed degraded.
    pub fn request_allocation(&self, task: TaskId, requested_bytes: usize) -> AllocationOutcome {
        let mut state = self.state.lock().unwrap();
        let allocated: usize = state.tasks.values().map(|t| t.allocated_bytes).sum();
        let available = state.global_limit_bytes.saturating_sub(allocated);

        let granted = if requested_bytes <= available {
            requested_bytes
        } else if state.allow_partial && available > 0 {
            available
        } else {
            let error = MemoryError {
                code: MEMORY_LIMIT_EXCEEDED,
                requested_bytes,
                available_bytes: available,
                global_limit_bytes: state.global_limit_bytes,
                active_task_count: state.tasks.len(),
            };
            return AllocationOutcome {
                success: false,
                allocated_bytes: 0,
                error: Some(error),
            };
        };

        state.tasks.entry(task).or_default().allocated_bytes += granted;
        self.maybe_warn(&mut state);
        AllocationOutcome {
            success: granted == requested_bytes,
            allocated_bytes: granted,
            error: None,
        }
    }

    /// Records the task's current live bytes.
    pub fn update_usage(&self, task: TaskId, used_bytes: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(alloc) = state.tasks.get_mut(&task) {
            alloc.used_bytes = used_bytes;
        }
    }

    /// The task's last reported live bytes, if it is registered.
    pub fn used_bytes(&self, task: TaskId) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state.tasks.get(&task).map(|alloc| alloc.used_bytes)
    }

    /// Drops the task's reservation. Releasing an unknown task is a no-op.
    pub fn release_allocation(&self, task: TaskId) {
        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&task);
        state.soft_warned = false;
    }

    /// Drops every reservation.
    pub fn clear_all_allocations(&self) {
        let mut state = self.state.lock().unwrap();
        state.tasks.clear();
        state.soft_warned = false;
    }

    /// Sum of all reserved bytes.
    pub fn allocated_bytes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.tasks.values().map(|t| t.allocated_bytes).sum()
    }

    /// Bytes still unreserved.
    pub fn available_bytes(&self) -> usize {
        let state = self.state.lock().unwrap();
        let allocated: usize = state.tasks.values().map(|t| t.allocated_bytes).sum();
        state.global_limit_bytes.saturating_sub(allocated)
    }

    pub fn global_limit_bytes(&self) -> usize {
        self.state.lock().unwrap().global_limit_bytes
    }

    pub fn active_task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    /// Whether reservations exceed [`SOFT_LIMIT_RATIO`] of the budget.
    ///
    /// Subsystems consult this to degrade voluntarily (smaller caches,
    /// earlier spills). Crossing the threshold never denies anything.
    pub fn is_above_soft_limit(&self) -> bool {
        let state = self.state.lock().unwrap();
        let allocated: usize = state.tasks.values().map(|t| t.allocated_bytes).sum();
        (allocated as f64) > (state.global_limit_bytes as f64) * SOFT_LIMIT_RATIO
    }

    fn maybe_warn(&self, state: &mut TrackerState) {
        let allocated: usize = state.tasks.values().map(|t| t.allocated_bytes).sum();
        let above = (allocated as f64) > (state.global_limit_bytes as f64) * SOFT_LIMIT_RATIO;
        if above && !state.soft_warned {
            state.soft_warned = true;
            tracing::warn!(
                allocated_bytes = allocated,
                global_limit_bytes = state.global_limit_bytes,
                "memory reservations crossed the soft limit"
            );
        }
    }
}
