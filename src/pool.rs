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

//! Fixed-size handler thread pool with liveness supervision.
//!
//! Each slot runs the closure passed to [`WorkerPool::spawn`] — typically a loop dequeuing from
//! [`crate::queue::TaskQueue`] and invoking the request handler. A supervisor thread notices a
//! slot going idle (its thread exited, whether cleanly on shutdown or via panic) and respawns it
//! in place. A plain [`JoinHandle`] offers no non-blocking "is it done yet" query, so each slot
//! also carries an `Arc<AtomicBool>` that a drop guard inside the worker closure flips on the way
//! out; that flag, not the handle, is what the supervisor actually polls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(100);

struct Slot {
    alive: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct ClearOnExit(Arc<AtomicBool>);

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn spawn_slot<F>(make_worker: &Arc<F>) -> Slot
where
    F: Fn() + Send + Sync + 'static,
{
    let alive = Arc::new(AtomicBool::new(true));
    let guard_flag = alive.clone();
    let worker = make_worker.clone();
    let handle = thread::spawn(move || {
        let _guard = ClearOnExit(guard_flag);
        (worker)();
    });
    Slot {
        alive,
        handle: Some(handle),
    }
}

/// A pool of `size` handler threads, kept alive by a supervisor thread.
///
/// Always held behind an `Arc`: the supervisor thread needs to re-lock `slots` on every tick for
/// the lifetime of the pool, which is the lifetime of the owning worker process.
pub struct WorkerPool {
    slots: Mutex<Vec<Slot>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    supervisor_stop: Arc<AtomicBool>,
    respawns: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `size` handler threads running `make_worker`, plus a supervisor thread that
    /// respawns any slot whose thread exits before shutdown.
    ///
    /// `make_worker` must be an `Fn` (not `FnOnce`): a respawned slot invokes it again.
    pub fn spawn<F>(size: usize, make_worker: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let make_worker = Arc::new(make_worker);
        let slots = (0..size).map(|_| spawn_slot(&make_worker)).collect();

        let pool = Arc::new(Self {
            slots: Mutex::new(slots),
            supervisor: Mutex::new(None),
            supervisor_stop: Arc::new(AtomicBool::new(false)),
            respawns: AtomicUsize::new(0),
        });

        let supervisor_pool = pool.clone();
        let stop = pool.supervisor_stop.clone();
        let supervisor = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(SUPERVISOR_INTERVAL);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let mut slots = supervisor_pool.slots.lock().unwrap();
                for (idx, slot) in slots.iter_mut().enumerate() {
                    if slot.alive.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(handle) = slot.handle.take() {
                        let _ = handle.join();
                    }
                    warn!("handler thread in slot {idx} exited unexpectedly, respawning");
                    *slot = spawn_slot(&make_worker);
                    supervisor_pool.respawns.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        *pool.supervisor.lock().unwrap() = Some(supervisor);

        pool
    }

    /// Total number of dead-slot respawns observed so far. Exposed for tests and diagnostics.
    pub fn respawn_count(&self) -> usize {
        self.respawns.load(Ordering::SeqCst)
    }

    /// Stops the supervisor and joins every slot thread.
    ///
    /// The caller is responsible for having already arranged for slot threads to actually return
    /// (e.g. by shutting down the queue they dequeue from); this only waits for them.
    pub fn join(&self) {
        self.supervisor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use std::time::Duration as StdDuration;

    #[test]
    fn pool_drains_tasks_across_all_threads() {
        let queue = Arc::new(TaskQueue::<i32>::new(64));
        let processed = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            queue.enqueue(i).unwrap();
        }

        let q = queue.clone();
        let p = processed.clone();
        let pool = WorkerPool::spawn(4, move || {
            while q.dequeue().is_some() {
                p.fetch_add(1, Ordering::SeqCst);
            }
        });

        thread::sleep(StdDuration::from_millis(200));
        queue.shutdown();
        pool.join();

        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn panicking_slot_is_respawned() {
        let queue = Arc::new(TaskQueue::<i32>::new(64));
        let attempt = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let a = attempt.clone();
        let pool = WorkerPool::spawn(1, move || {
            let n = a.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First incarnation of the slot dies immediately; the supervisor must notice
                // and respawn it to actually drain the queue.
                panic!("simulated handler crash");
            }
            while q.dequeue().is_some() {}
        });

        thread::sleep(StdDuration::from_millis(400));
        queue.shutdown();
        pool.join();

        assert!(pool.respawn_count() >= 1);
        assert!(attempt.load(Ordering::SeqCst) >= 2);
    }
}
