// Copyright 2022 Ryan Seipp
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

//! Per-worker bounded task queue.
//!
//! A circular buffer of accepted sockets, guarded by a mutex with a condvar for non-empty
//! signaling. One producer (the worker's IPC loop, see [`crate::worker`]) and `threads_per_worker`
//! consumers (handler threads, see [`crate::pool`]) share it.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Result, ServerError};

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    shutting_down: bool,
}

/// Bounded FIFO of pending work, shared between one producer and N consumers.
pub struct TaskQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

impl<T> TaskQueue<T> {
    /// Creates an empty queue with room for `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                capacity,
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Non-blocking enqueue. Rejects with [`ServerError::QueueFull`] or
    /// [`ServerError::QueueShutdown`] rather than ever blocking the producer.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return Err(ServerError::QueueShutdown);
        }
        if state.items.len() >= state.capacity {
            return Err(ServerError::QueueFull);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Like [`enqueue`](Self::enqueue), but hands the item back on failure instead of dropping
    /// it. Needed wherever the caller must still do something with a rejected item — e.g. a
    /// worker writing a 503 response to a socket it could not queue rather than silently closing
    /// it.
    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), (ServerError, T)> {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return Err((ServerError::QueueShutdown, item));
        }
        if state.items.len() >= state.capacity {
            return Err((ServerError::QueueFull, item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available, or `None` once shutdown has been signaled and the
    /// queue has drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.shutting_down {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Signals shutdown and wakes every waiting consumer. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutting_down = true;
        drop(state);
        self.not_empty.notify_all();
    }

    /// Current occupancy. Exposed for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn enqueue_dequeue_round_trips() {
        let q = TaskQueue::new(4);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let q = TaskQueue::new(2);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert!(matches!(q.enqueue(3), Err(ServerError::QueueFull)));

        // Draining one slot re-enables enqueue.
        assert_eq!(q.dequeue(), Some(1));
        assert!(q.enqueue(3).is_ok());
    }

    #[test]
    fn shutdown_wakes_blocked_consumers() {
        let q = Arc::new(TaskQueue::<i32>::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.dequeue())
        };

        thread::sleep(Duration::from_millis(50));
        q.shutdown();

        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn shutdown_drains_before_reporting_empty() {
        let q = TaskQueue::new(4);
        q.enqueue(7).unwrap();
        q.shutdown();

        // Pending item must still be delivered once, then the queue reports shutdown.
        assert_eq!(q.dequeue(), Some(7));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let q = TaskQueue::new(4);
        q.shutdown();
        assert!(matches!(q.enqueue(1), Err(ServerError::QueueShutdown)));
    }

    #[test]
    fn try_enqueue_hands_the_item_back_on_rejection() {
        let q = TaskQueue::new(1);
        q.enqueue(1).unwrap();
        match q.try_enqueue(2) {
            Err((ServerError::QueueFull, item)) => assert_eq!(item, 2),
            other => panic!("expected QueueFull with item returned, got {other:?}"),
        }
    }

    #[test]
    fn count_is_always_within_capacity() {
        let q = TaskQueue::new(3);
        for i in 0..3 {
            q.enqueue(i).unwrap();
            assert!(q.len() <= q.capacity());
        }
        assert!(q.enqueue(99).is_err());
        assert_eq!(q.len(), 3);
    }
}
