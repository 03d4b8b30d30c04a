//! Named accumulators shared with the host dataplane.
//!
//! The host exposes counters as shared-memory cells looked up by name; in
//! this module they are `Rc<Cell<u64>>` handles handed out by a registry.
//! Everything runs on one dataplane worker thread, so plain cells suffice.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

/// Handle to one named accumulator.
pub type Counter = Rc<Cell<u64>>;

pub(crate) fn add(counter: &Counter, n: u64) {
    counter.set(counter.get() + n);
}

/// Registry of named accumulators.
#[derive(Default)]
pub struct Counters {
    cells: HashMap<String, Counter>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `name`, created at zero on first use.
    pub fn accumulator(&mut self, name: &str) -> Counter {
        match self.cells.get(name) {
            Some(c) => Rc::clone(c),
            None => {
                let c: Counter = Rc::new(Cell::new(0));
                self.cells.insert(name.to_string(), Rc::clone(&c));
                c
            }
        }
    }

    /// Current value of `name`, zero if never touched.
    pub fn value(&self, name: &str) -> u64 {
        self.cells.get(name).map(|c| c.get()).unwrap_or(0)
    }
}

/// Per-route read/write accumulators
/// (`{route_id}.bytes.read` and friends).
#[derive(Clone)]
pub(crate) struct RouteCounters {
    pub frames_read: Counter,
    pub bytes_read: Counter,
    pub frames_written: Counter,
    pub bytes_written: Counter,
}

impl RouteCounters {
    pub fn supply(counters: &mut Counters, route_id: u64) -> Self {
        Self {
            frames_read: counters.accumulator(&format!("{route_id}.frames.read")),
            bytes_read: counters.accumulator(&format!("{route_id}.bytes.read")),
            frames_written: counters.accumulator(&format!("{route_id}.frames.written")),
            bytes_written: counters.accumulator(&format!("{route_id}.bytes.written")),
        }
    }
}
