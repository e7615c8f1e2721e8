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

//! Minimal HTTP/1.1 request-line and header parsing.
//!
//! Deliberately not a streaming/zero-copy parser: requests are read into one bounded buffer (see
//! `crate::handler`) before parsing ever starts, so borrowing slices of that buffer is sufficient.

use super::method::Method;
use super::version::Version;

/// A parsed request line plus the handful of headers the handler actually consults.
#[derive(Debug)]
pub struct Request<'a> {
    /// The request method, if recognized (an unrecognized token is still captured as text for
    /// logging, but `method` is `None`).
    pub method: Option<Method>,
    /// Raw method token, always present when parsing succeeds, independent of whether it maps to
    /// a known [`Method`].
    pub method_raw: &'a str,
    /// Request target, e.g. `/index.html`.
    pub path: &'a str,
    /// Declared HTTP version.
    pub version: Version,
    /// `Host` header value, port stripped.
    pub host: Option<&'a str>,
    /// Parsed `Range` header, if present and well-formed.
    pub range: Option<ByteRange>,
    /// Whether the client sent `Connection: close`.
    pub connection_close: bool,
}

/// A `Range: bytes=S-[E]` request, already split into start and optional end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Inclusive start offset.
    pub start: u64,
    /// Inclusive end offset, if the client supplied one.
    pub end: Option<u64>,
}

/// Failure parsing the request line. Headers are parsed best-effort and never fail on their own.
#[derive(Debug)]
pub struct MalformedRequestLine;

impl<'a> Request<'a> {
    /// Parses `buf` (already known to contain at least the request line's terminating CRLF).
    ///
    /// `buf` must be valid UTF-8 up through the headers; an HTTP request line and header block is
    /// ASCII in practice, so callers can use `from_utf8_lossy` and slice off the body no worse for
    /// the comparisons this function performs.
    pub fn parse(buf: &'a str) -> Result<Self, MalformedRequestLine> {
        let (line, rest) = split_on_crlf(buf).ok_or(MalformedRequestLine)?;

        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let method_raw = tokens.next().ok_or(MalformedRequestLine)?;
        let path = tokens.next().ok_or(MalformedRequestLine)?;
        let version_tok = tokens.next().ok_or(MalformedRequestLine)?;

        let mut host = None;
        let mut range = None;
        let mut connection_close = false;
        for header_line in rest.split("\r\n") {
            let Some((name, value)) = header_line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("host") {
                host = Some(strip_port(value));
            } else if name.eq_ignore_ascii_case("range") {
                range = parse_range(value);
            } else if name.eq_ignore_ascii_case("connection") {
                connection_close = value.eq_ignore_ascii_case("close");
            }
        }

        Ok(Request {
            method: method_raw.parse().ok(),
            method_raw,
            path,
            version: Version::parse(version_tok),
            host,
            range,
            connection_close,
        })
    }
}

fn split_on_crlf(buf: &str) -> Option<(&str, &str)> {
    let idx = buf.find("\r\n")?;
    Some((&buf[..idx], &buf[idx + 2..]))
}

fn strip_port(host_header: &str) -> &str {
    // IPv6 literals (`[::1]:8080`) carry colons of their own; only strip a port past the closing
    // bracket, or at the first colon when there's no bracket at all.
    if let Some(bracket_end) = host_header.rfind(']') {
        return &host_header[..=bracket_end];
    }
    match host_header.rfind(':') {
        Some(idx) => &host_header[..idx],
        None => host_header,
    }
}

fn parse_range(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    let start = start_s.parse().ok()?;
    let end = if end_s.is_empty() {
        None
    } else {
        Some(end_s.parse().ok()?)
    };
    Some(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get() {
        let raw = "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.version, Version::H1_1);
        assert_eq!(req.host, Some("example.com"));
        assert!(req.range.is_none());
    }

    #[test]
    fn strips_port_from_host_header() {
        let raw = "GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.host, Some("example.com"));
    }

    #[test]
    fn keeps_ipv6_literal_host_intact() {
        let raw = "GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.host, Some("[::1]"));
    }

    #[test]
    fn parses_open_ended_range() {
        let raw = "GET /f HTTP/1.1\r\nRange: bytes=512-\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(
            req.range,
            Some(ByteRange {
                start: 512,
                end: None
            })
        );
    }

    #[test]
    fn parses_closed_range() {
        let raw = "GET /f HTTP/1.1\r\nRange: bytes=0-99\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(
            req.range,
            Some(ByteRange {
                start: 0,
                end: Some(99)
            })
        );
    }

    #[test]
    fn missing_crlf_is_malformed() {
        assert!(Request::parse("GET / HTTP/1.1").is_err());
    }

    #[test]
    fn too_few_tokens_is_malformed() {
        let raw = "GET /\r\nHost: x\r\n\r\n";
        assert!(Request::parse(raw).is_err());
    }

    #[test]
    fn unrecognized_method_token_is_still_captured_raw() {
        let raw = "FETCH / HTTP/1.1\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert!(req.method.is_none());
        assert_eq!(req.method_raw, "FETCH");
    }

    #[test]
    fn detects_connection_close_header() {
        let raw = "GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert!(req.connection_close);
    }

    #[test]
    fn connection_close_defaults_to_false() {
        let raw = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert!(!req.connection_close);
    }
}
