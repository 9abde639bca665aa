/*
 * Copyright (C) 2024-2025 the Zibai authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::logger;
use log::error;
use std::error::Error;
use std::io::{self, Read};

pub type AppError = Box<dyn Error + Send + Sync>;

/// A finite, once-only sequence of response body chunks. Dropping the
/// iterator is the release hook; the connection handler drops it on every
/// exit path.
pub type BodyChunks = Box<dyn Iterator<Item = Result<Vec<u8>, AppError>>>;

/// The gateway application contract: the server hands the application a
/// request environment and a responder, and the application returns the
/// response body as a lazy chunk sequence after starting the response.
pub trait Application: Send + Sync {
    fn call(&self, environ: Environ, responder: &mut Responder)
        -> Result<BodyChunks, AppError>;
}

impl<F> Application for F
where
    F: Fn(Environ, &mut Responder) -> Result<BodyChunks, AppError> + Send + Sync,
{
    fn call(
        &self,
        environ: Environ,
        responder: &mut Responder,
    ) -> Result<BodyChunks, AppError> {
        self(environ, responder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    /// Parse a WSGI-style status string such as `"200 OK"`.
    pub fn parse(status: &str) -> Result<Self, AppError> {
        let (code, reason) = match status.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (status, ""),
        };

        let code: u16 = code
            .parse()
            .map_err(|_| format!("invalid status line: {:?}", status))?;

        if !(100..=999).contains(&code) {
            return Err(format!("invalid status code: {}", code).into());
        }

        Ok(Self::new(code, reason))
    }
}

pub type Headers = Vec<(String, Vec<u8>)>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("start_response was already called")]
    AlreadyStarted,

    #[error("start_response replacement after headers were sent")]
    HeadersAlreadySent,

    #[error("start_response was not called")]
    NotStarted,
}

/// Collects the application's response start. The application must start
/// the response exactly once before yielding the first body chunk; a second
/// call is permitted only from an error path (with `exc_info`) and only
/// while no body bytes have been transmitted.
pub struct Responder {
    response: Option<(StatusLine, Headers)>,
    headers_sent: bool,
}

#[allow(clippy::new_without_default)]
impl Responder {
    pub fn new() -> Self {
        Self {
            response: None,
            headers_sent: false,
        }
    }

    pub fn start(
        &mut self,
        status: StatusLine,
        headers: Headers,
        exc_info: Option<&AppError>,
    ) -> Result<(), GatewayError> {
        if exc_info.is_some() {
            if self.headers_sent {
                return Err(GatewayError::HeadersAlreadySent);
            }
        } else if self.response.is_some() {
            return Err(GatewayError::AlreadyStarted);
        }

        self.response = Some((status, headers));

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    pub(crate) fn take(&mut self) -> Result<(StatusLine, Headers), GatewayError> {
        self.response.take().ok_or(GatewayError::NotStarted)
    }
}

/// Lazy reader over the request body. Pulls data from the connection on
/// demand; the first pull transparently emits `100 Continue` when the
/// client asked for it.
pub struct Input {
    receive: Box<dyn FnMut() -> io::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    has_more: bool,
}

impl Input {
    pub fn new(receive: Box<dyn FnMut() -> io::Result<Vec<u8>>>) -> Self {
        Self {
            receive,
            buffer: Vec::new(),
            has_more: true,
        }
    }

    /// An input that yields no data, for requests without a body.
    pub fn empty() -> Self {
        Self {
            receive: Box::new(|| Ok(Vec::new())),
            buffer: Vec::new(),
            has_more: false,
        }
    }

    fn receive_more(&mut self) -> io::Result<()> {
        if !self.has_more {
            return Ok(());
        }

        let data = (self.receive)()?;

        if data.is_empty() {
            self.has_more = false;
        } else {
            self.buffer.extend_from_slice(&data);
        }

        Ok(())
    }

    /// Read one line, including the trailing newline if present. Returns an
    /// empty vec at end of body.
    pub fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                return Ok(self.buffer.drain(..=pos).collect());
            }

            if !self.has_more {
                return Ok(std::mem::take(&mut self.buffer));
            }

            self.receive_more()?;
        }
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buffer.is_empty() && self.has_more {
            self.receive_more()?;
        }

        let size = std::cmp::min(buf.len(), self.buffer.len());
        buf[..size].copy_from_slice(&self.buffer[..size]);
        self.buffer.drain(..size);

        Ok(size)
    }
}

/// Line sink for application diagnostics, routed to the error log target.
pub struct ErrorSink {
    buf: Vec<u8>,
}

#[allow(clippy::new_without_default)]
impl ErrorSink {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn emit(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);

        if !line.is_empty() {
            error!(target: logger::ERROR, "{}", line);
        }
    }
}

impl io::Write for ErrorSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.emit(&line);
        }

        Ok(())
    }
}

impl Drop for ErrorSink {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

/// The request environment handed to the application. Field names follow
/// the gateway contract's key vocabulary; `vars()` renders the mapping
/// form for logging.
pub struct Environ {
    pub request_method: String,
    pub script_name: String,
    pub path_info: String,
    pub query_string: String,
    pub server_protocol: String,
    pub server_name: String,
    pub server_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub content_type: Option<String>,
    pub content_length: Option<String>,

    /// All request headers with original case, for case-insensitive lookup.
    pub headers: Vec<(String, String)>,

    pub url_scheme: String,
    pub multithread: bool,
    pub multiprocess: bool,
    pub run_once: bool,

    pub input: Input,
    pub errors: ErrorSink,
}

impl Environ {
    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Render the environment as its key/value mapping, for structured log
    /// records. Header names become `HTTP_*` keys, upper-cased with hyphens
    /// replaced by underscores; Content-Type and Content-Length keep their
    /// dedicated keys.
    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("REQUEST_METHOD".to_string(), self.request_method.clone()),
            ("SCRIPT_NAME".to_string(), self.script_name.clone()),
            ("PATH_INFO".to_string(), self.path_info.clone()),
            ("QUERY_STRING".to_string(), self.query_string.clone()),
            (
                "SERVER_PROTOCOL".to_string(),
                self.server_protocol.clone(),
            ),
            ("SERVER_NAME".to_string(), self.server_name.clone()),
            ("SERVER_PORT".to_string(), self.server_port.to_string()),
            ("REMOTE_ADDR".to_string(), self.remote_addr.clone()),
            ("REMOTE_PORT".to_string(), self.remote_port.to_string()),
            ("wsgi.url_scheme".to_string(), self.url_scheme.clone()),
            ("wsgi.multithread".to_string(), self.multithread.to_string()),
            (
                "wsgi.multiprocess".to_string(),
                self.multiprocess.to_string(),
            ),
            ("wsgi.run_once".to_string(), self.run_once.to_string()),
        ];

        if let Some(value) = &self.content_type {
            vars.push(("CONTENT_TYPE".to_string(), value.clone()));
        }

        if let Some(value) = &self.content_length {
            vars.push(("CONTENT_LENGTH".to_string(), value.clone()));
        }

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Type")
                || name.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }

            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            vars.push((key, value.clone()));
        }

        vars
    }
}
