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

//! Response header-block construction.

use chrono::Utc;

use super::status::Status;

/// `Server` header value sent on every response.
pub const SERVER_NAME: &str = "ConcurrentHTTP/1.0";

/// Whether a response ends its connection or keeps it open for a subsequent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// `Connection: keep-alive`, the default.
    KeepAlive,
    /// `Connection: close`, sent on explicit client request or before final shutdown.
    Close,
}

impl Connection {
    fn as_header_value(self) -> &'static str {
        match self {
            Connection::KeepAlive => "keep-alive",
            Connection::Close => "close",
        }
    }
}

/// Everything needed to serialize one response's header block.
#[derive(Debug)]
pub struct ResponseHead<'a> {
    /// Status line code and reason.
    pub status: Status,
    /// `Content-Type` value.
    pub content_type: &'a str,
    /// `Content-Length` value, in bytes.
    pub content_length: u64,
    /// `Content-Range`, set only for 206 responses.
    pub content_range: Option<(u64, u64, u64)>,
    /// `Connection` header.
    pub connection: Connection,
}

impl<'a> ResponseHead<'a> {
    /// Serializes the status line and headers, terminated by the blank line that separates
    /// headers from body. The caller appends the body bytes (or nothing, for HEAD) after this.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        use std::io::Write;

        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason_phrase()
        );
        let _ = write!(out, "Date: {}\r\n", rfc1123_now());
        let _ = write!(out, "Server: {SERVER_NAME}\r\n");
        let _ = write!(out, "Content-Type: {}\r\n", self.content_type);
        let _ = write!(out, "Content-Length: {}\r\n", self.content_length);
        if let Some((start, end, total)) = self.content_range {
            let _ = write!(out, "Content-Range: bytes {start}-{end}/{total}\r\n");
        }
        let _ = write!(
            out,
            "Connection: {}\r\n",
            self.connection.as_header_value()
        );
        out.extend_from_slice(b"\r\n");
    }
}

/// Current time formatted per RFC 1123, as required for HTTP `Date` headers (e.g.
/// `Tue, 15 Nov 1994 08:12:31 GMT`).
pub fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_a_basic_200() {
        let head = ResponseHead {
            status: Status::Ok,
            content_type: "text/html; charset=utf-8",
            content_length: 42,
            content_range: None,
            connection: Connection::KeepAlive,
        };
        let mut buf = Vec::new();
        head.write_to(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 42\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains(&format!("Server: {SERVER_NAME}\r\n")));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serializes_content_range_for_partial_content() {
        let head = ResponseHead {
            status: Status::PartialContent,
            content_type: "application/octet-stream",
            content_length: 100,
            content_range: Some((0, 99, 500)),
            connection: Connection::Close,
        };
        let mut buf = Vec::new();
        head.write_to(&mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Content-Range: bytes 0-99/500\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn rfc1123_format_has_expected_shape() {
        let s = rfc1123_now();
        assert!(s.ends_with(" GMT"));
        assert_eq!(s.matches(',').count(), 1);
    }
}
