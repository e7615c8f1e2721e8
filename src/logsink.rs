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

//! Buffered, periodically-flushed, size-rotated access log.
//!
//! One sink per worker process. Entries are Common Log Format lines; this is a fixed-format
//! business record for log analysis tools, not the diagnostics stream in `crate::error`/the `log`
//! facade.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;

use crate::error::Result;

const BUFFER_CAPACITY: usize = 4 * 1024;
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const POLL_CHUNK: Duration = Duration::from_secs(1);

struct Inner {
    path: PathBuf,
    buffer: Vec<u8>,
}

/// Process-local access log sink, safe to share across handler threads via `Arc`.
pub struct AccessLogSink {
    inner: Mutex<Inner>,
    shutdown: Mutex<bool>,
    shutdown_cvar: Condvar,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl AccessLogSink {
    /// Opens (creating if needed) the log file at `path` and starts the periodic flush thread.
    pub fn open(path: &Path) -> Result<std::sync::Arc<Self>> {
        // Touch the file up front so a misconfigured path fails fast at worker start rather than
        // on the first request.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let sink = std::sync::Arc::new(Self {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                buffer: Vec::with_capacity(BUFFER_CAPACITY),
            }),
            shutdown: Mutex::new(false),
            shutdown_cvar: Condvar::new(),
            flush_thread: Mutex::new(None),
        });

        let flusher = {
            let sink = sink.clone();
            thread::spawn(move || sink.flush_loop())
        };
        *sink.flush_thread.lock().unwrap() = Some(flusher);

        Ok(sink)
    }

    /// Formats and appends one Common Log Format line, flushing first if it would overflow the
    /// in-memory buffer.
    pub fn log_request(&self, client_ip: &str, method: &str, path: &str, status: u16, bytes: u64) {
        let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
        let line = format!(
            "{client_ip} - - [{timestamp}] \"{method} {path} HTTP/1.1\" {status} {bytes}\n"
        );

        let mut inner = self.inner.lock().unwrap();
        if inner.buffer.len() + line.len() > BUFFER_CAPACITY {
            flush_locked(&mut inner);
        }
        inner.buffer.extend_from_slice(line.as_bytes());
    }

    fn flush_loop(&self) {
        let mut guard = self.shutdown.lock().unwrap();
        loop {
            let mut waited = Duration::ZERO;
            while waited < FLUSH_INTERVAL {
                let (next, _) = self
                    .shutdown_cvar
                    .wait_timeout(guard, POLL_CHUNK)
                    .unwrap();
                guard = next;
                if *guard {
                    self.flush();
                    return;
                }
                waited += POLL_CHUNK;
            }
            self.flush();
        }
    }

    /// Flushes the in-memory buffer to disk, rotating first if the file has grown past the
    /// single-generation rotation threshold.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        flush_locked(&mut inner);
    }

    /// Signals the flush thread to drain the buffer one last time and exit. Blocks until it has.
    pub fn shutdown(&self) {
        *self.shutdown.lock().unwrap() = true;
        self.shutdown_cvar.notify_all();
        if let Some(handle) = self.flush_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn flush_locked(inner: &mut Inner) {
    if inner.buffer.is_empty() {
        return;
    }

    rotate_if_oversized(&inner.path);

    let file = OpenOptions::new().create(true).append(true).open(&inner.path);
    match file {
        Ok(mut f) => {
            if f.write_all(&inner.buffer).is_ok() {
                inner.buffer.clear();
            }
        }
        Err(_) => {
            // Disk/log path trouble is not fatal to request serving; the buffer is retained and
            // retried on the next flush.
        }
    }
}

fn rotate_if_oversized(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= ROTATE_AT_BYTES {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".old");
            let _ = fs::rename(path, rotated);
        }
    }
}
