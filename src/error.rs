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

//! Error taxonomy for the server core.
//!
//! [`ServerError`] distinguishes fatal startup/topology failures (reported to stderr, nonzero
//! exit) from recoverable conditions that a caller is expected to fold into a response rather than
//! propagate. Handlers never let a [`ServerError`] cross a thread boundary; see
//! [`crate::handler`].

use std::io;

use thiserror::Error;

/// Errors surfaced by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wraps a transient I/O failure. Usually recoverable at the call site.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binding or listening on the configured port failed. Fatal.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the master attempted to bind.
        addr: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// `fork(2)` failed while spawning worker processes. Fatal.
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    /// Allocating or initializing the cross-process shared memory region failed. Fatal.
    #[error("shared memory setup failed: {0}")]
    SharedMemory(#[source] nix::Error),

    /// Establishing or using the master↔worker FD-passing channel failed.
    #[error("IPC channel error: {0}")]
    Ipc(#[source] nix::Error),

    /// A `put` into the LRU cache was rejected. Always advisory; never surfaced to a client.
    #[error("cache rejected entry: {0}")]
    CacheRejected(&'static str),

    /// The per-worker task queue was full. Expected backpressure, not a fault.
    #[error("task queue is full")]
    QueueFull,

    /// The per-worker task queue has been shut down.
    #[error("task queue is shutting down")]
    QueueShutdown,
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, ServerError>;
