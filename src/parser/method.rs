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

//! Representation of HTTP method
use std::fmt::Display;
use std::str::FromStr;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
///
/// Every method token is recognized so unsupported-but-well-formed requests can be told apart
/// from malformed ones; only [`Method::Get`] and [`Method::Head`] are actually served (see
/// `crate::handler`), everything else is rejected with `405 Method Not Allowed`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
    /// RFC 9110 9.3.9
    Patch,
}

impl Method {
    /// Whether this server serves the method, as opposed to only recognizing the token.
    pub fn is_supported(self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

/// A method token this server has never heard of.
#[derive(Debug)]
pub struct UnknownMethod;

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "CONNECT" => Ok(Self::Connect),
            "OPTIONS" => Ok(Self::Options),
            "TRACE" => Ok(Self::Trace),
            "PATCH" => Ok(Self::Patch),
            _ => Err(UnknownMethod),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_and_head_are_supported() {
        assert!(Method::Get.is_supported());
        assert!(Method::Head.is_supported());
        assert!(!Method::Post.is_supported());
        assert!(!Method::Delete.is_supported());
    }

    #[test]
    fn parses_known_tokens_and_rejects_garbage() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert!("FETCH".parse::<Method>().is_err());
    }
}
