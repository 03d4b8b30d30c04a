//! Delegated-task executor facade.
//!
//! TLS engines may hand back CPU-bound work (key agreement, signature
//! checks) that must run off the dataplane worker.  The module submits
//! each task here and parks the connection; when the work finishes, the
//! host posts a SIGNAL message carrying `signal_id` onto `stream_id`,
//! which resumes the handshake.  The module never blocks on a task and
//! never calls into the engine while any task is outstanding.

pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// Cancel handle retained per scheduled task.
pub trait TaskHandle {
    /// Best-effort cancellation; a task that already ran is unaffected.
    fn cancel(&self);
}

pub trait Executor {
    /// Schedule `task`; on completion the host must deliver
    /// `SIGNAL{stream_id, signal_id}` to this module.
    fn execute(
        &mut self,
        task: DelegatedTask,
        route_id: u64,
        stream_id: u64,
        signal_id: u64,
    ) -> Box<dyn TaskHandle>;
}

use std::cell::Cell;
use std::rc::Rc;

/// Executor for hosts that drain and run tasks on the worker thread
/// themselves (and for tests).  `drain()` hands back the scheduled tasks;
/// the caller runs each and posts the matching SIGNAL message.
#[derive(Default)]
pub struct DeferredExecutor {
    pending: Vec<DeferredTask>,
}

pub struct DeferredTask {
    task: DelegatedTask,
    pub route_id: u64,
    pub stream_id: u64,
    pub signal_id: u64,
    cancelled: Rc<Cell<bool>>,
}

impl DeferredTask {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Run the work.  Returns `false` (without running) when cancelled.
    pub fn run(self) -> bool {
        if self.cancelled.get() {
            return false;
        }
        (self.task)();
        true
    }
}

struct DeferredHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle for DeferredHandle {
    fn cancel(&self) {
        self.cancelled.set(true);
    }
}

impl DeferredExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<DeferredTask> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Executor for DeferredExecutor {
    fn execute(
        &mut self,
        task: DelegatedTask,
        route_id: u64,
        stream_id: u64,
        signal_id: u64,
    ) -> Box<dyn TaskHandle> {
        let cancelled = Rc::new(Cell::new(false));
        self.pending.push(DeferredTask {
            task,
            route_id,
            stream_id,
            signal_id,
            cancelled: Rc::clone(&cancelled),
        });
        Box::new(DeferredHandle { cancelled })
    }
}
