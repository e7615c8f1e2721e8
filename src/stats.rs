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

//! Cross-process statistics region.
//!
//! The master creates one anonymous `MAP_SHARED` mapping before forking any worker; every worker
//! inherits the same mapping across `fork(2)` and updates it in place. The mutex embedded in the
//! mapping is constructed with `PTHREAD_PROCESS_SHARED` so lock/unlock is meaningful across
//! process boundaries — a plain [`std::sync::Mutex`] would not be, since its internal futex/word
//! state is only ever shared within one address space.

use std::mem::MaybeUninit;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;
use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
use serde::Serialize;

use crate::error::{Result, ServerError};

#[repr(C)]
struct Inner {
    mutex: libc::pthread_mutex_t,
    total_requests: u64,
    bytes_transferred: u64,
    status_2xx: u64,
    status_4xx: u64,
    status_5xx: u64,
    active_connections: i64,
    elapsed_ms_sum: u64,
}

/// A handle onto the shared statistics region.
///
/// Cheap to clone (it is a raw pointer plus the mapping length); every clone refers to the same
/// underlying mapping, which is exactly what's wanted once this value has been inherited across
/// `fork`.
#[derive(Clone, Copy)]
pub struct SharedStats {
    inner: NonNull<Inner>,
}

// SAFETY: all access to `inner` goes through the embedded PTHREAD_PROCESS_SHARED mutex.
unsafe impl Send for SharedStats {}
unsafe impl Sync for SharedStats {}

/// Status class recorded by [`SharedStats::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx success.
    Success,
    /// 4xx client error.
    ClientError,
    /// 5xx server error.
    ServerError,
    /// Anything else (e.g. an aborted connection never getting as far as a status line).
    Other,
}

impl StatusClass {
    /// Classifies a numeric HTTP status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            200..=299 => StatusClass::Success,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }
}

/// A consistent point-in-time copy of the counters, captured under a single lock acquisition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    /// Current number of open connections across all of this worker's threads.
    pub active_connections: i64,
    /// Total completed requests.
    pub total_requests: u64,
    /// Total response bytes written.
    pub bytes_transferred: u64,
    /// Count of 2xx responses.
    pub status_200: u64,
    /// Count of 4xx responses. Named `status_404` for parity with the wire JSON field, though it
    /// aggregates the whole 4xx class.
    pub status_404: u64,
    /// Count of 5xx responses, aggregated under the `status_500` field name.
    pub status_500: u64,
    /// `elapsed_ms_sum / total_requests`, or 0 if no requests have completed.
    pub avg_response_time_ms: f64,
}

impl SharedStats {
    /// Allocates and initializes a new shared region. Must be called exactly once, before any
    /// `fork`, by the master.
    pub fn new() -> Result<Self> {
        let len = NonZeroUsize::new(std::mem::size_of::<Inner>()).expect("Inner is non-zero size");

        // SAFETY: a fresh anonymous mapping, immediately initialized below before any other
        // thread or process can observe it.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(ServerError::SharedMemory)?;

        let inner: NonNull<Inner> = ptr.cast();

        // SAFETY: `inner` points at `size_of::<Inner>()` freshly mapped, writable bytes.
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
                return Err(ServerError::SharedMemory(nix::Error::EINVAL));
            }
            if libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ) != 0
            {
                return Err(ServerError::SharedMemory(nix::Error::EINVAL));
            }

            let mutex_ptr = std::ptr::addr_of_mut!((*inner.as_ptr()).mutex);
            if libc::pthread_mutex_init(mutex_ptr, attr.as_ptr()) != 0 {
                return Err(ServerError::SharedMemory(nix::Error::EINVAL));
            }
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());

            (*inner.as_ptr()).total_requests = 0;
            (*inner.as_ptr()).bytes_transferred = 0;
            (*inner.as_ptr()).status_2xx = 0;
            (*inner.as_ptr()).status_4xx = 0;
            (*inner.as_ptr()).status_5xx = 0;
            (*inner.as_ptr()).active_connections = 0;
            (*inner.as_ptr()).elapsed_ms_sum = 0;
        }

        Ok(Self { inner })
    }

    fn with_locked<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        // SAFETY: the mutex is PTHREAD_PROCESS_SHARED; lock/unlock is valid from any process
        // sharing this mapping, which is every process that has this `SharedStats` value.
        unsafe {
            let mutex_ptr = std::ptr::addr_of_mut!((*self.inner.as_ptr()).mutex);
            libc::pthread_mutex_lock(mutex_ptr);
            let result = f(&mut *self.inner.as_ptr());
            libc::pthread_mutex_unlock(mutex_ptr);
            result
        }
    }

    /// Increments "active connections" by one. Called once per accepted socket.
    pub fn connection_opened(&self) {
        self.with_locked(|s| s.active_connections += 1);
    }

    /// Decrements "active connections" by one. Called once per socket teardown.
    pub fn connection_closed(&self) {
        self.with_locked(|s| s.active_connections -= 1);
    }

    /// Records one completed request: `status` classifies it, `bytes` is the response body size,
    /// `elapsed_ms` the wall-clock time taken to serve it.
    pub fn update(&self, status: StatusClass, bytes: u64, elapsed_ms: u64) {
        self.with_locked(|s| {
            s.total_requests += 1;
            s.bytes_transferred += bytes;
            s.elapsed_ms_sum += elapsed_ms;
            match status {
                StatusClass::Success => s.status_2xx += 1,
                StatusClass::ClientError => s.status_4xx += 1,
                StatusClass::ServerError => s.status_5xx += 1,
                StatusClass::Other => {}
            }
        });
    }

    /// Captures a consistent snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.with_locked(|s| StatsSnapshot {
            active_connections: s.active_connections,
            total_requests: s.total_requests,
            bytes_transferred: s.bytes_transferred,
            status_200: s.status_2xx,
            status_404: s.status_4xx,
            status_500: s.status_5xx,
            avg_response_time_ms: if s.total_requests > 0 {
                s.elapsed_ms_sum as f64 / s.total_requests as f64
            } else {
                0.0
            },
        })
    }
}

/// Periodically logs a [`StatsSnapshot`] at `info` level until stopped.
///
/// Sleeps via a shutdown flag plus condvar (`wait_timeout`) rather than being cancelled outright,
/// so a shutdown request wakes it immediately instead of waiting out the rest of the interval.
pub struct StatsMonitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl StatsMonitor {
    /// Spawns the monitor thread, logging `stats.snapshot()` every `interval`.
    pub fn spawn(stats: SharedStats, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || {
            let (lock, cvar) = &*thread_stop;
            let mut guard = lock.lock().unwrap();
            loop {
                let (next_guard, timed_out) =
                    cvar.wait_timeout(guard, interval).unwrap();
                guard = next_guard;
                if *guard {
                    break;
                }
                if timed_out.timed_out() {
                    let snap = stats.snapshot();
                    info!(
                        "stats: {} requests, {} bytes, {} active, {:.2}ms avg",
                        snap.total_requests,
                        snap.bytes_transferred,
                        snap.active_connections,
                        snap.avg_response_time_ms
                    );
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the monitor to stop and joins its thread.
    pub fn join(mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn update_accumulates_into_snapshot() {
        let stats = SharedStats::new().unwrap();
        stats.update(StatusClass::Success, 100, 5);
        stats.update(StatusClass::ClientError, 0, 2);
        stats.update(StatusClass::ServerError, 0, 10);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.bytes_transferred, 100);
        assert_eq!(snap.status_200, 1);
        assert_eq!(snap.status_404, 1);
        assert_eq!(snap.status_500, 1);
        assert!((snap.avg_response_time_ms - (17.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_stats_report_zero_average() {
        let stats = SharedStats::new().unwrap();
        assert_eq!(stats.snapshot().avg_response_time_ms, 0.0);
    }

    #[test]
    fn connection_gauge_tracks_open_and_closed() {
        let stats = SharedStats::new().unwrap();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        assert_eq!(stats.snapshot().active_connections, 1);
    }

    #[test]
    fn concurrent_updates_serialize_cleanly() {
        let stats = Arc::new(SharedStats::new().unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    stats.update(StatusClass::Success, 1, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_requests, 4000);
        assert_eq!(stats.snapshot().bytes_transferred, 4000);
    }

    #[test]
    fn monitor_stops_promptly_without_waiting_out_the_interval() {
        let stats = SharedStats::new().unwrap();
        let monitor = StatsMonitor::spawn(stats, Duration::from_secs(3600));
        let start = std::time::Instant::now();
        monitor.join();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
