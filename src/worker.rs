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

//! A worker process: owns a local task queue, file cache, and handler thread pool, and receives
//! accepted connections from the master over an [`IpcChannel`].

use std::net::TcpStream;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::Arc;

use log::{info, warn};
use nix::sys::signal::{self, SigHandler, Signal};

use crate::cache::FileCache;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler;
use crate::ipc::IpcChannel;
use crate::logsink::AccessLogSink;
use crate::pool::WorkerPool;
use crate::queue::TaskQueue;
use crate::stats::SharedStats;

/// Runs one worker process to completion. Returns once the master has closed its side of
/// `channel`, after every handler thread has drained and exited.
pub fn run(id: usize, config: ServerConfig, channel: IpcChannel, stats: SharedStats) -> Result<()> {
    ignore_interactive_interrupt();

    info!("worker {id} (pid {}) starting", std::process::id());

    let queue = Arc::new(TaskQueue::<TcpStream>::new(config.max_queue_size));
    let cache = Arc::new(FileCache::new(config.cache_size_bytes()));
    let log = AccessLogSink::open(&config.log_file)?;

    let pool = {
        let queue = queue.clone();
        let cache = cache.clone();
        let log = log.clone();
        let pool_config = config.clone();
        WorkerPool::spawn(config.threads_per_worker, move || {
            while let Some(stream) = queue.dequeue() {
                handler::serve_connection(stream, &pool_config, &cache, &log, &stats);
            }
        })
    };

    loop {
        match channel.recv_fd() {
            Ok(Some(owned_fd)) => {
                // SAFETY: `owned_fd` was just received via SCM_RIGHTS and is uniquely owned here.
                let stream = unsafe { TcpStream::from_raw_fd(owned_fd.into_raw_fd()) };
                if let Err((_, stream)) = queue.try_enqueue(stream) {
                    warn!("worker {id}: task queue full, rejecting connection with 503");
                    handler::reject_with_service_unavailable(stream);
                }
            }
            Ok(None) => {
                info!("worker {id}: master closed the channel, shutting down");
                break;
            }
            Err(e) => {
                warn!("worker {id}: IPC receive error: {e}");
                break;
            }
        }
    }

    queue.shutdown();
    pool.join();
    log.shutdown();
    cache.destroy();
    info!("worker {id} exiting");
    Ok(())
}

fn ignore_interactive_interrupt() {
    // SAFETY: installing `SIG_IGN` is always signal-safe. A worker's shutdown is driven entirely
    // by IPC channel EOF from the master, not by receiving SIGINT directly — a shared foreground
    // process group would otherwise deliver Ctrl+C to every worker independently.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
    }
}
