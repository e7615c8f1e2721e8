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

//! The per-connection, per-request pipeline: read, parse, route, respond, account.
//!
//! One call to [`serve_connection`] owns a socket for its whole lifetime, serving requests in a
//! loop until the client or server ends keep-alive.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::cache::{FileCache, MAX_ENTRY_BYTES};
use crate::config::ServerConfig;
use crate::logsink::AccessLogSink;
use crate::mime;
use crate::parser::{Connection, Method, Request, ResponseHead, Status};
use crate::stats::{SharedStats, StatusClass};

const READ_BUF_SIZE: usize = 2 * 1024;
const STREAM_CHUNK: usize = 8 * 1024;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

enum ConnectionState {
    KeepAlive,
    Close,
}

/// Serves every request on `stream` until the connection ends, then tears down its accounting.
pub fn serve_connection(
    mut stream: TcpStream,
    config: &ServerConfig,
    cache: &FileCache,
    log: &AccessLogSink,
    stats: &SharedStats,
) {
    let client_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "-".to_string());

    let timeout = if config.keep_alive_timeout == 0 {
        DEFAULT_KEEP_ALIVE
    } else {
        Duration::from_secs(config.keep_alive_timeout)
    };
    if let Err(e) = stream.set_read_timeout(Some(timeout)) {
        warn!("failed to set read timeout: {e}");
    }

    stats.connection_opened();

    let mut first_request = true;
    loop {
        match handle_one_request(
            &mut stream,
            config,
            cache,
            log,
            stats,
            &client_ip,
            first_request,
        ) {
            ConnectionState::KeepAlive => first_request = false,
            ConnectionState::Close => break,
        }
    }

    stats.connection_closed();
}

/// Writes a minimal 503 and drops the socket. Used when a worker's task queue is full and a
/// connection was never handed to a handler thread at all.
pub fn reject_with_service_unavailable(mut stream: TcpStream) {
    let body = default_error_body(Status::ServiceUnavailable);
    let head = ResponseHead {
        status: Status::ServiceUnavailable,
        content_type: "text/html; charset=utf-8",
        content_length: body.len() as u64,
        content_range: None,
        connection: Connection::Close,
    };
    let mut out = Vec::new();
    head.write_to(&mut out);
    out.extend_from_slice(&body);
    let _ = stream.write_all(&out);
}

fn handle_one_request(
    stream: &mut TcpStream,
    config: &ServerConfig,
    cache: &FileCache,
    log: &AccessLogSink,
    stats: &SharedStats,
    client_ip: &str,
    first_request: bool,
) -> ConnectionState {
    let start = Instant::now();

    let mut buf = [0u8; READ_BUF_SIZE];
    let n = match stream.read(&mut buf) {
        Ok(0) => return ConnectionState::Close,
        Ok(n) => n,
        Err(e) if is_timeout(&e) => {
            if first_request {
                respond_error(stream, config, Status::RequestTimeout, true, Connection::Close);
                record(stats, log, client_ip, "-", "-", Status::RequestTimeout.code(), 0, start);
            }
            return ConnectionState::Close;
        }
        Err(_) => return ConnectionState::Close,
    };

    let text = String::from_utf8_lossy(&buf[..n]);
    let req = match Request::parse(&text) {
        Ok(req) => req,
        Err(_) => {
            respond_error(stream, config, Status::BadRequest, true, Connection::Close);
            record(stats, log, client_ip, "-", "-", Status::BadRequest.code(), 0, start);
            return ConnectionState::Close;
        }
    };

    let method_label = req.method_raw;
    let path_label = req.path;
    let connection = if req.connection_close {
        Connection::Close
    } else {
        Connection::KeepAlive
    };

    let method = match req.method {
        Some(m) if m.is_supported() => m,
        _ => {
            respond_error(stream, config, Status::MethodNotAllowed, true, Connection::Close);
            record(
                stats,
                log,
                client_ip,
                method_label,
                path_label,
                Status::MethodNotAllowed.code(),
                0,
                start,
            );
            return ConnectionState::Close;
        }
    };
    let send_body = method != Method::Head;

    if req.path.contains("..") {
        respond_error(stream, config, Status::Forbidden, send_body, Connection::Close);
        record(
            stats,
            log,
            client_ip,
            method_label,
            path_label,
            Status::Forbidden.code(),
            0,
            start,
        );
        return ConnectionState::Close;
    }

    let route_path = req.path.split('?').next().unwrap_or(req.path);

    if route_path == "/stats" {
        let body = serde_json::to_vec(&stats.snapshot()).unwrap_or_default();
        respond_body(
            stream,
            Status::Ok,
            "application/json",
            &body,
            None,
            send_body,
            connection,
        );
        record(
            stats,
            log,
            client_ip,
            method_label,
            path_label,
            Status::Ok.code(),
            body.len() as u64,
            start,
        );
        return state_from(connection);
    }

    let mut resolved = resolve_path(config, req.host, route_path);
    if resolved.is_dir() {
        resolved = resolved.join("index.html");
    }

    let metadata = match fs::metadata(&resolved) {
        Ok(m) if m.is_file() => m,
        _ => {
            respond_error(stream, config, Status::NotFound, send_body, Connection::Close);
            record(
                stats,
                log,
                client_ip,
                method_label,
                path_label,
                Status::NotFound.code(),
                0,
                start,
            );
            return ConnectionState::Close;
        }
    };
    let size = metadata.len();
    let content_type = mime::content_type_for(&resolved);

    if let Some(range) = req.range {
        let end = range
            .end
            .unwrap_or_else(|| size.saturating_sub(1))
            .min(size.saturating_sub(1));
        if range.start >= size || range.start > end {
            respond_error(
                stream,
                config,
                Status::RangeNotSatisfiable,
                send_body,
                Connection::Close,
            );
            record(
                stats,
                log,
                client_ip,
                method_label,
                path_label,
                Status::RangeNotSatisfiable.code(),
                0,
                start,
            );
            return ConnectionState::Close;
        }

        let body_len = end - range.start + 1;
        let head = ResponseHead {
            status: Status::PartialContent,
            content_type,
            content_length: body_len,
            content_range: Some((range.start, end, size)),
            connection,
        };
        let mut out = Vec::new();
        head.write_to(&mut out);
        if stream.write_all(&out).is_err() {
            return ConnectionState::Close;
        }
        if send_body {
            if let Err(e) = stream_file_range(stream, &resolved, range.start, body_len) {
                warn!("error streaming range body for {}: {e}", resolved.display());
            }
        }
        record(
            stats,
            log,
            client_ip,
            method_label,
            path_label,
            Status::PartialContent.code(),
            body_len,
            start,
        );
        return state_from(connection);
    }

    if (size as usize) < MAX_ENTRY_BYTES {
        let cache_key = resolved.to_string_lossy().into_owned();
        let body: Arc<[u8]> = match cache.get(&cache_key) {
            Some(bytes) => bytes,
            None => match fs::read(&resolved) {
                Ok(bytes) => {
                    let bytes: Arc<[u8]> = bytes.into();
                    cache.put(cache_key, bytes.clone());
                    bytes
                }
                Err(_) => {
                    respond_error(
                        stream,
                        config,
                        Status::InternalServerError,
                        send_body,
                        Connection::Close,
                    );
                    record(
                        stats,
                        log,
                        client_ip,
                        method_label,
                        path_label,
                        Status::InternalServerError.code(),
                        0,
                        start,
                    );
                    return ConnectionState::Close;
                }
            },
        };
        respond_body(
            stream,
            Status::Ok,
            content_type,
            &body,
            None,
            send_body,
            connection,
        );
        record(
            stats,
            log,
            client_ip,
            method_label,
            path_label,
            Status::Ok.code(),
            body.len() as u64,
            start,
        );
        return state_from(connection);
    }

    let head = ResponseHead {
        status: Status::Ok,
        content_type,
        content_length: size,
        content_range: None,
        connection,
    };
    let mut out = Vec::new();
    head.write_to(&mut out);
    if stream.write_all(&out).is_err() {
        return ConnectionState::Close;
    }
    if send_body {
        if let Err(e) = stream_file_range(stream, &resolved, 0, size) {
            warn!("error streaming file body for {}: {e}", resolved.display());
        }
    }
    record(
        stats,
        log,
        client_ip,
        method_label,
        path_label,
        Status::Ok.code(),
        size,
        start,
    );
    state_from(connection)
}

fn resolve_path(config: &ServerConfig, host: Option<&str>, route_path: &str) -> PathBuf {
    let base = host
        .map(|h| config.document_root.join(h))
        .filter(|p| p.is_dir())
        .unwrap_or_else(|| config.document_root.clone());

    base.join(route_path.trim_start_matches('/'))
}

fn stream_file_range(
    stream: &mut TcpStream,
    path: &Path,
    start: u64,
    len: u64,
) -> std::io::Result<()> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let mut remaining = len;
    let mut buf = [0u8; STREAM_CHUNK];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

fn respond_error(
    stream: &mut TcpStream,
    config: &ServerConfig,
    status: Status,
    send_body: bool,
    connection: Connection,
) {
    let custom = config
        .document_root
        .join("errors")
        .join(format!("{}.html", status.code()));
    let body = fs::read(&custom).unwrap_or_else(|_| default_error_body(status));
    respond_body(
        stream,
        status,
        "text/html; charset=utf-8",
        &body,
        None,
        send_body,
        connection,
    );
}

fn respond_body(
    stream: &mut TcpStream,
    status: Status,
    content_type: &str,
    body: &[u8],
    content_range: Option<(u64, u64, u64)>,
    send_body: bool,
    connection: Connection,
) {
    let head = ResponseHead {
        status,
        content_type,
        content_length: body.len() as u64,
        content_range,
        connection,
    };
    let mut out = Vec::new();
    head.write_to(&mut out);
    if send_body {
        out.extend_from_slice(body);
    }
    let _ = stream.write_all(&out);
}

fn default_error_body(status: Status) -> Vec<u8> {
    format!(
        "<html><body><h1>{} {}</h1></body></html>",
        status.code(),
        status.reason_phrase()
    )
    .into_bytes()
}

fn record(
    stats: &SharedStats,
    log: &AccessLogSink,
    client_ip: &str,
    method: &str,
    path: &str,
    status: u16,
    bytes: u64,
    start: Instant,
) {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    stats.update(StatusClass::from_code(status), bytes, elapsed_ms);
    log.log_request(client_ip, method, path, status, bytes);
}

fn state_from(connection: Connection) -> ConnectionState {
    match connection {
        Connection::KeepAlive => ConnectionState::KeepAlive,
        Connection::Close => ConnectionState::Close,
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SharedStats;
    use std::net::{TcpListener, TcpStream};
    use tempfile::tempdir;

    fn config_at(root: &Path) -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.document_root = root.to_path_buf();
        cfg.keep_alive_timeout = 1;
        cfg
    }

    fn one_shot_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn serves_a_small_file_end_to_end() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("<h1>hi</h1>"));
        assert_eq!(stats.snapshot().total_requests, 1);
        log.shutdown();
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"GET /../secret HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        log.shutdown();
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"POST / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        log.shutdown();
    }

    #[test]
    fn serves_a_range_request() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"GET /f.bin HTTP/1.1\r\nRange: bytes=2-4\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 2-4/10\r\n"));
        assert!(text.ends_with("234"));
    }

    #[test]
    fn head_request_omits_body() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"hello").unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"HEAD /index.html HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn stats_endpoint_returns_json() {
        let dir = tempdir().unwrap();
        let config = config_at(dir.path());
        let cache = FileCache::new(config.cache_size_bytes());
        let log = AccessLogSink::open(&dir.path().join("access.log")).unwrap();
        let stats = SharedStats::new().unwrap();

        let (mut client, server) = one_shot_pair();
        client
            .write_all(b"GET /stats HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        serve_connection(server, &config, &cache, &log, &stats);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.contains("Content-Type: application/json\r\n"));
        assert!(response.contains("\"total_requests\""));
    }

    #[test]
    fn rejects_with_service_unavailable_writes_503() {
        let (mut client, server) = one_shot_pair();
        reject_with_service_unavailable(server);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }
}
