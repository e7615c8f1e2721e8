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

#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! A preforking, multi-threaded HTTP/1.1 static file server.
//!
//! A master process owns the listening socket and round-robins accepted connections to a fixed
//! pool of worker processes over [`ipc`] FD-passing channels. Each worker serves its share of
//! connections with its own thread pool ([`pool`]), file cache ([`cache`]), and access log
//! ([`logsink`]), while every process shares one cross-process statistics region ([`stats`]).
//!
//! This crate is a library plus a thin binary (`src/bin/concurrent-httpd.rs`) that parses
//! arguments into a [`config::ServerConfig`] and calls [`master::run`]. The library itself never
//! reads the environment or installs a logging backend.

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod ipc;
pub mod logsink;
pub mod master;
pub mod mime;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod worker;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
