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

//! Representation of the requested HTTP version.
//!
//! The request line's version token is never used to gate a request (this server speaks the
//! HTTP/1.1 subset regardless of what a client claims); it is only carried through for the access
//! log's request line field.

use std::fmt::Display;

/// Representation of the requested HTTP version.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
    /// Anything else claimed on the request line.
    Other,
}

impl Version {
    /// Parses the request line's version token, e.g. `HTTP/1.1`.
    pub fn parse(token: &str) -> Self {
        match token {
            "HTTP/1.0" => Self::H1_0,
            "HTTP/1.1" => Self::H1_1,
            _ => Self::Other,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
            Self::Other => "HTTP/1.1",
        })
    }
}
