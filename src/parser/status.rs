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

//! Http Status Codes
//! [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
//!
//! Limited to the codes this server actually emits.

use std::fmt::Display;

/// Http Status Codes
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.3.7
    PartialContent = 206,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.4
    Forbidden = 403,
    /// 15.5.5
    NotFound = 404,
    /// 15.5.6
    MethodNotAllowed = 405,
    /// 15.5.9
    RequestTimeout = 408,
    /// 15.5.17
    RangeNotSatisfiable = 416,
    /// 15.6.1
    InternalServerError = 500,
    /// 15.6.4
    ServiceUnavailable = 503,
}

impl Status {
    /// The reason phrase conventionally paired with this code on the status line.
    pub fn reason_phrase(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestTimeout => "Request Timeout",
            Status::RangeNotSatisfiable => "Range Not Satisfiable",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// The numeric code, for accounting and the status line.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason_phrase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_status_line_convention() {
        assert_eq!(Status::NotFound.to_string(), "404 Not Found");
        assert_eq!(Status::Ok.to_string(), "200 OK");
    }
}
