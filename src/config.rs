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

//! Frozen server configuration.
//!
//! `ServerConfig` is the only input the core accepts. Loading it from a file, the environment, or
//! the command line is the job of the binary crate (`src/bin/concurrent-httpd.rs`); the library
//! never reads `std::env` itself.

use std::path::PathBuf;

/// Fully populated, immutable configuration consumed by [`crate::master::Master`].
///
/// Once constructed, a `ServerConfig` never changes. It is cheap to clone and is shared by value
/// with every worker before `fork`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the master listens on, across all interfaces.
    pub port: u16,
    /// Number of worker processes to fork.
    pub num_workers: usize,
    /// Handler threads spawned inside each worker.
    pub threads_per_worker: usize,
    /// Capacity of each worker's bounded task queue.
    pub max_queue_size: usize,
    /// Filesystem root files are served from.
    pub document_root: PathBuf,
    /// Path the access log is appended to.
    pub log_file: PathBuf,
    /// Per-worker cache budget, in megabytes.
    pub cache_size_mb: usize,
    /// Idle/read timeout, in seconds. Also used as the stats-print interval.
    pub timeout_seconds: u64,
    /// Keep-alive idle timeout, in seconds.
    pub keep_alive_timeout: u64,
}

impl ServerConfig {
    /// Per-worker cache budget in bytes.
    pub fn cache_size_bytes(&self) -> usize {
        self.cache_size_mb * 1024 * 1024
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            num_workers: 2,
            threads_per_worker: 4,
            max_queue_size: 64,
            document_root: PathBuf::from("./public"),
            log_file: PathBuf::from("./access.log"),
            cache_size_mb: 16,
            timeout_seconds: 60,
            keep_alive_timeout: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_size_bytes_converts_mb() {
        let mut cfg = ServerConfig::default();
        cfg.cache_size_mb = 3;
        assert_eq!(cfg.cache_size_bytes(), 3 * 1024 * 1024);
    }
}
