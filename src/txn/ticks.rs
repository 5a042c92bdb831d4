// Copyright 2025 Quarry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred task queue
//!
//! The engine is single-threaded and cooperative; deferred work (the
//! transaction auto-complete) runs on this thread-local queue. One `tick`
//! runs the tasks queued before it started - tasks a tick queues run on
//! the next tick. `pump` ticks until the queue drains; the api layer
//! pumps after materialising a query so idle transactions commit.

use std::cell::RefCell;
use std::collections::VecDeque;

thread_local! {
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

/// Queue a task for the next tick
pub fn defer(task: impl FnOnce() + 'static) {
    QUEUE.with(|queue| queue.borrow_mut().push_back(Box::new(task)));
}

/// Run everything queued up to now; returns whether anything ran
pub fn tick() -> bool {
    let batch: Vec<Box<dyn FnOnce()>> = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        queue.drain(..).collect()
    });
    let ran = !batch.is_empty();
    for task in batch {
        task();
    }
    ran
}

/// Tick until the queue is idle
pub fn pump() {
    while tick() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_nested_defer_lands_on_next_tick() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        defer(move || {
            o.borrow_mut().push(1);
            let o = o.clone();
            defer(move || o.borrow_mut().push(2));
        });
        tick();
        assert_eq!(*order.borrow(), vec![1]);
        tick();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_pump_drains_chains() {
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        defer(move || {
            let h = h.clone();
            defer(move || h.set(true));
        });
        pump();
        assert!(hit.get());
    }
}
