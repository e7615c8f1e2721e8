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

//! Command-line entry point. Parses arguments, validates them, builds a frozen
//! `ServerConfig`, and hands off to the core.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use concurrent_httpd::ServerConfig;

/// Preforking, multi-threaded HTTP/1.1 static file server.
#[derive(Debug, Parser)]
#[command(name = "concurrent-httpd", version, about)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Number of worker processes to fork.
    #[arg(short = 'w', long = "workers", default_value_t = 4)]
    num_workers: usize,

    /// Handler threads spawned inside each worker.
    #[arg(short = 't', long = "threads", default_value_t = 8)]
    threads_per_worker: usize,

    /// Capacity of each worker's bounded task queue.
    #[arg(long, default_value_t = 128)]
    max_queue_size: usize,

    /// Filesystem root files are served from.
    #[arg(short = 'd', long, default_value = "./public")]
    document_root: PathBuf,

    /// Path the access log is appended to.
    #[arg(long, default_value = "./access.log")]
    log_file: PathBuf,

    /// Per-worker cache budget, in megabytes.
    #[arg(long, default_value_t = 16)]
    cache_size_mb: usize,

    /// Idle timeout in seconds; also the stats-print interval.
    #[arg(long, default_value_t = 60)]
    timeout_seconds: u64,

    /// Keep-alive idle timeout, in seconds.
    #[arg(long, default_value_t = 5)]
    keep_alive_timeout: u64,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, String> {
        if self.num_workers == 0 {
            return Err("--workers must be at least 1".into());
        }
        if self.threads_per_worker == 0 {
            return Err("--threads must be at least 1".into());
        }
        if !self.document_root.is_dir() {
            return Err(format!(
                "--document-root {} is not a directory",
                self.document_root.display()
            ));
        }

        Ok(ServerConfig {
            port: self.port,
            num_workers: self.num_workers,
            threads_per_worker: self.threads_per_worker,
            max_queue_size: self.max_queue_size,
            document_root: self.document_root,
            log_file: self.log_file,
            cache_size_mb: self.cache_size_mb,
            timeout_seconds: self.timeout_seconds,
            keep_alive_timeout: self.keep_alive_timeout,
        })
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("concurrent-httpd: {msg}");
            return ExitCode::FAILURE;
        }
    };

    match concurrent_httpd::master::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("concurrent-httpd: {e}");
            ExitCode::FAILURE
        }
    }
}
