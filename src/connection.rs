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

use crate::gateway::{
    AppError, Application, BodyChunks, Environ, ErrorSink, Input, Responder,
};
use crate::http1::protocol::{
    BodySize, Event, ProtocolError, RequestHead, ResponseHead, ServerProtocol,
};
use crate::logger::{self, ExchangeFields};
use crate::net::{NetStream, PeerAddr};
use log::{debug, error};
use percent_encoding::percent_decode;
use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;

const READ_SIZE: usize = 16384;

// how often an idle keep-alive wait rechecks the graceful-exit flag
const IDLE_POLL: Duration = Duration::from_millis(500);

const SERVER_VALUE: &str = concat!("zibai/", env!("CARGO_PKG_VERSION"));

const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// Shared state a connection handler needs from its worker.
#[derive(Clone)]
pub struct ServeContext {
    pub app: Arc<dyn Application>,
    pub script_name: String,
    pub url_scheme: String,
    pub multiprocess: bool,
    pub graceful: Arc<AtomicBool>,
    pub requests: Arc<AtomicU64>,
    pub max_request_pre_process: Option<u64>,
    pub max_incomplete_event_size: Option<usize>,
}

struct CountingWriter<'a> {
    inner: &'a mut NetStream,
    count: &'a mut u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.inner.write(buf)?;
        *self.count += size as u64;

        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The socket plus its framing engine. Shared between the handler and the
/// lazy request-body reader handed to the application.
struct Wire {
    stream: NetStream,
    protocol: ServerProtocol,
    peer: PeerAddr,
    bytes_sent: u64,
}

impl Wire {
    fn fill(&mut self) -> io::Result<()> {
        let mut buf = [0u8; READ_SIZE];

        let size = self.stream.read(&mut buf)?;

        if size == 0 {
            self.protocol.receive_data(b"");
        } else {
            self.protocol.receive_data(&buf[..size]);
        }

        Ok(())
    }

    fn send_response_head(
        &mut self,
        head: &ResponseHead,
        body_size: BodySize,
    ) -> Result<(), ProtocolError> {
        let Self {
            stream,
            protocol,
            bytes_sent,
            ..
        } = self;

        protocol.send_response(
            &mut CountingWriter {
                inner: stream,
                count: bytes_sent,
            },
            head,
            body_size,
        )
    }

    fn send_body(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let Self {
            stream,
            protocol,
            bytes_sent,
            ..
        } = self;

        protocol.send_body_data(
            &mut CountingWriter {
                inner: stream,
                count: bytes_sent,
            },
            data,
        )
    }

    fn send_end(&mut self) -> Result<(), ProtocolError> {
        let Self {
            stream,
            protocol,
            bytes_sent,
            ..
        } = self;

        protocol.send_end(&mut CountingWriter {
            inner: stream,
            count: bytes_sent,
        })
    }

    /// Pull the next piece of request body off the wire, emitting the
    /// interim 100 first when the client is waiting for it. Returns an
    /// empty vec at end of body.
    fn receive_body_chunk(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if self.protocol.they_are_waiting_for_100_continue() {
                let Self {
                    stream,
                    protocol,
                    bytes_sent,
                    ..
                } = self;

                protocol
                    .send_100_continue(&mut CountingWriter {
                        inner: stream,
                        count: bytes_sent,
                    })
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            }

            match self.protocol.next_event() {
                Ok(Event::Data(data)) => return Ok(data),
                Ok(Event::EndOfMessage) | Ok(Event::Paused) | Ok(Event::ConnectionClosed) => {
                    return Ok(Vec::new())
                }
                Ok(Event::NeedData) => self.fill()?,
                Ok(Event::Request(_)) => unreachable!("body read before request"),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }
}

enum Flow {
    KeepAlive,
    Close,
    Abort,
}

/// Drive one accepted socket through request/response exchanges until the
/// peer goes away, the protocol demands a close, or the worker drains.
pub fn handle_connection(
    ctx: &ServeContext,
    stream: NetStream,
    peer: PeerAddr,
    server: (String, u16),
) {
    debug!(target: logger::DEBUG, "handling connection from {}", peer);

    let wire = Rc::new(RefCell::new(Wire {
        stream,
        protocol: ServerProtocol::new(ctx.max_incomplete_event_size),
        peer: peer.clone(),
        bytes_sent: 0,
    }));

    loop {
        match handle_exchange(ctx, &wire, &server) {
            Flow::KeepAlive => {
                let mut wire = wire.borrow_mut();

                if wire.protocol.start_next_cycle().is_err() {
                    break;
                }

                debug!(target: logger::DEBUG, "start next cycle for {}", peer);
            }
            Flow::Close => break,
            Flow::Abort => {
                let wire = wire.borrow();
                let _ = wire.stream.shutdown(Shutdown::Both);
                break;
            }
        }
    }

    debug!(target: logger::DEBUG, "finished with connection from {}", peer);
}

fn handle_exchange(ctx: &ServeContext, wire: &Rc<RefCell<Wire>>, server: &(String, u16)) -> Flow {
    let head = match wait_for_request(ctx, wire) {
        Ok(Some(head)) => head,
        Ok(None) => return Flow::Close,
        Err(ProtocolError::Io(e)) => {
            debug!(
                target: logger::DEBUG,
                "read error from {}: {}",
                wire.borrow().peer,
                e
            );
            return Flow::Close;
        }
        Err(ProtocolError::UnexpectedEof) => {
            debug!(
                target: logger::DEBUG,
                "connection closed by {} mid-request",
                wire.borrow().peer
            );
            return Flow::Close;
        }
        Err(e) => {
            // pre-body protocol error: synthesize 400 or 431 and close
            let (code, reason) = e.status_hint();

            error!(
                target: logger::ERROR,
                "protocol error from {}: {}",
                wire.borrow().peer,
                e
            );

            let _ = send_simple_response(wire, code, reason, reason);

            return Flow::Close;
        }
    };

    let started = Instant::now();
    let bytes_start = wire.borrow().bytes_sent;

    let count = ctx.requests.fetch_add(1, Ordering::SeqCst) + 1;

    if let Some(max) = ctx.max_request_pre_process {
        if count >= max {
            ctx.graceful.store(true, Ordering::SeqCst);
        }
    }

    // close after the current exchange once draining has begun or the
    // request budget is spent
    if ctx.graceful.load(Ordering::SeqCst) {
        wire.borrow_mut().protocol.set_persistent(false);
    }

    let environ = build_environ(ctx, wire, &head, server);

    let log_vars = environ.vars();
    let method = environ.request_method.clone();
    let path = environ.path_info.clone();
    let protocol_name = environ.server_protocol.clone();

    let log = |status: u16, failed: bool| {
        let wire = wire.borrow();

        logger::log_exchange(
            &method,
            &path,
            &protocol_name,
            failed,
            &ExchangeFields {
                environ_vars: &log_vars,
                status,
                bytes_sent: wire.bytes_sent - bytes_start,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
    };

    let mut responder = Responder::new();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.app.call(environ, &mut responder)
    }));

    let body = match result {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            return app_failed(wire, &e, &log);
        }
        Err(cause) => {
            let e: AppError = panic_message(cause).into();
            return app_failed(wire, &e, &log);
        }
    };

    let mut body = body;

    // the response must be started before the first chunk is known
    let first = next_chunk(&mut body);

    let first = match first {
        Some(Err(e)) => {
            drop(body);
            return app_failed(wire, &e, &log);
        }
        Some(Ok(chunk)) => Some(chunk),
        None => None,
    };

    let (status, headers) = match responder.take() {
        Ok(x) => x,
        Err(e) => {
            drop(body);
            let e: AppError = e.to_string().into();
            return app_failed(wire, &e, &log);
        }
    };

    // outbound framing: identity when the application declared a length,
    // otherwise chunked (1.1) or close-delimited (1.0)
    let mut body_size = BodySize::Unknown;

    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            if let Ok(value) = std::str::from_utf8(value) {
                if let Ok(len) = value.trim().parse() {
                    body_size = BodySize::Known(len);
                }
            }
        }
    }

    let head = ResponseHead {
        code: status.code,
        reason: status.reason.clone(),
        headers: prepare_headers(headers),
    };

    // draining may have begun while the application ran
    if ctx.graceful.load(Ordering::SeqCst) {
        wire.borrow_mut().protocol.set_persistent(false);
    }

    if let Err(e) = wire.borrow_mut().send_response_head(&head, body_size) {
        drop(body);
        debug!(target: logger::DEBUG, "write error: {}", e);
        return Flow::Abort;
    }

    responder.mark_headers_sent();

    // stream the chunk sequence; failures after this point abort the
    // connection without further bytes
    let mut failed = false;

    if let Some(chunk) = first {
        if let Err(e) = wire.borrow_mut().send_body(&chunk) {
            debug!(target: logger::DEBUG, "write error: {}", e);
            failed = true;
        }
    }

    while !failed {
        match next_chunk(&mut body) {
            None => break,
            Some(Ok(chunk)) => {
                if let Err(e) = wire.borrow_mut().send_body(&chunk) {
                    debug!(target: logger::DEBUG, "write error: {}", e);
                    failed = true;
                }
            }
            Some(Err(e)) => {
                error!(
                    target: logger::ERROR,
                    "error in application body after headers were sent: {}", e
                );
                failed = true;
            }
        }
    }

    if !failed {
        if let Err(e) = wire.borrow_mut().send_end() {
            debug!(target: logger::DEBUG, "write error: {}", e);
            failed = true;
        }
    }

    drop(body);

    if failed {
        log(status.code, true);
        return Flow::Abort;
    }

    // consume whatever is left of the request body so the parser lands on
    // a message boundary
    if wire.borrow().protocol.is_persistent() {
        if let Err(e) = drain_request_body(wire) {
            debug!(target: logger::DEBUG, "drain error: {}", e);
            log(status.code, false);
            return Flow::Close;
        }
    }

    log(status.code, false);

    let keep_alive = {
        let wire = wire.borrow();
        wire.protocol.is_persistent()
    };

    if !keep_alive || ctx.graceful.load(Ordering::SeqCst) {
        Flow::Close
    } else {
        Flow::KeepAlive
    }
}

/// Read until a full request head is available. While no request bytes
/// have arrived the wait polls with a short read timeout so a draining
/// worker can close idle keep-alive connections promptly.
fn wait_for_request(
    ctx: &ServeContext,
    wire: &Rc<RefCell<Wire>>,
) -> Result<Option<RequestHead>, ProtocolError> {
    {
        let wire = wire.borrow();
        let _ = wire.stream.set_read_timeout(Some(IDLE_POLL));
    }

    loop {
        let event = wire.borrow_mut().protocol.next_event()?;

        match event {
            Event::Request(head) => {
                let wire = wire.borrow();
                let _ = wire.stream.set_read_timeout(None);

                return Ok(Some(head));
            }
            Event::ConnectionClosed => return Ok(None),
            Event::NeedData => {
                if ctx.graceful.load(Ordering::SeqCst) && wire.borrow().protocol.buffered() == 0 {
                    // idle at drain time
                    return Ok(None);
                }

                let result = wire.borrow_mut().fill();

                match result {
                    Ok(()) => {}
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => return Err(ProtocolError::Io(e)),
                }
            }
            Event::Data(_) | Event::EndOfMessage | Event::Paused => {
                // a previous exchange left the parser mid-message
                return Ok(None);
            }
        }
    }
}

fn drain_request_body(wire: &Rc<RefCell<Wire>>) -> Result<(), ProtocolError> {
    loop {
        let event = wire.borrow_mut().protocol.next_event()?;

        match event {
            Event::Data(_) => {}
            Event::EndOfMessage | Event::Paused => return Ok(()),
            Event::ConnectionClosed => {
                return Err(ProtocolError::UnexpectedEof);
            }
            Event::NeedData => {
                let result = wire.borrow_mut().fill();

                match result {
                    Ok(()) => {}
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => return Err(ProtocolError::Io(e)),
                }
            }
            Event::Request(_) => unreachable!("request event while draining body"),
        }
    }
}

fn build_environ(
    ctx: &ServeContext,
    wire: &Rc<RefCell<Wire>>,
    head: &RequestHead,
    server: &(String, u16),
) -> Environ {
    let (path_raw, query_raw) = match head.target.iter().position(|b| *b == b'?') {
        Some(pos) => (&head.target[..pos], &head.target[(pos + 1)..]),
        None => (&head.target[..], &b""[..]),
    };

    let path_info = percent_decode(path_raw).decode_utf8_lossy().into_owned();
    let query_string = String::from_utf8_lossy(query_raw).into_owned();

    let headers: Vec<(String, String)> = head
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), String::from_utf8_lossy(value).into_owned()))
        .collect();

    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let content_type = find("Content-Type");
    let content_length = find("Content-Length");

    let (server_name, server_port) = match find("Host") {
        Some(host) => match host.rsplit_once(':') {
            Some((name, port)) => match port.parse() {
                Ok(port) => (name.to_string(), port),
                Err(_) => (host.clone(), server.1),
            },
            None => (host.clone(), server.1),
        },
        None => server.clone(),
    };

    let input = if head.body_size == BodySize::NoBody {
        Input::empty()
    } else {
        let wire = Rc::clone(wire);

        Input::new(Box::new(move || wire.borrow_mut().receive_body_chunk()))
    };

    let peer = wire.borrow().peer.clone();

    Environ {
        request_method: head.method.clone(),
        script_name: ctx.script_name.clone(),
        path_info,
        query_string,
        server_protocol: format!("HTTP/1.{}", head.ver_min),
        server_name,
        server_port,
        remote_addr: peer.addr,
        remote_port: peer.port,
        content_type,
        content_length,
        headers,
        url_scheme: ctx.url_scheme.clone(),
        multithread: true,
        multiprocess: ctx.multiprocess,
        run_once: false,
        input,
        errors: ErrorSink::new(),
    }
}

/// Strip hop-by-hop headers (plus Date and Server, which the server owns)
/// from the application-supplied set, then append the authoritative Date
/// and Server values.
fn prepare_headers(headers: Vec<(String, Vec<u8>)>) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = headers
        .into_iter()
        .filter(|(name, _)| {
            !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
                && !name.eq_ignore_ascii_case("Date")
                && !name.eq_ignore_ascii_case("Server")
        })
        .collect();

    out.push(("Date".to_string(), http_date().into_bytes()));
    out.push(("Server".to_string(), SERVER_VALUE.as_bytes().to_vec()));

    out
}

fn http_date() -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    OffsetDateTime::now_utc()
        .format(&format)
        .expect("failed to format date")
}

/// Synthesized error response with a short text body, used for protocol
/// errors and application failures before headers go out.
fn send_simple_response(
    wire: &Rc<RefCell<Wire>>,
    code: u16,
    reason: &str,
    body: &str,
) -> Result<(), ProtocolError> {
    let mut wire = wire.borrow_mut();

    wire.protocol.set_persistent(false);

    let head = ResponseHead {
        code,
        reason: reason.to_string(),
        headers: vec![
            (
                "Content-Type".to_string(),
                b"text/plain; charset=utf-8".to_vec(),
            ),
            ("Date".to_string(), http_date().into_bytes()),
            ("Server".to_string(), SERVER_VALUE.as_bytes().to_vec()),
        ],
    };

    wire.send_response_head(&head, BodySize::Known(body.len()))?;
    wire.send_body(body.as_bytes())?;
    wire.send_end()?;

    Ok(())
}

fn app_failed(wire: &Rc<RefCell<Wire>>, e: &AppError, log: &dyn Fn(u16, bool)) -> Flow {
    error!(
        target: logger::ERROR,
        "error while calling application: {}", e
    );

    let _ = send_simple_response(wire, 500, "Internal Server Error", "Internal Server Error");

    log(500, true);

    Flow::Close
}

fn next_chunk(body: &mut BodyChunks) -> Option<Result<Vec<u8>, AppError>> {
    match panic::catch_unwind(AssertUnwindSafe(|| body.next())) {
        Ok(item) => item,
        Err(cause) => Some(Err(panic_message(cause).into())),
    }
}

fn panic_message(cause: Box<dyn Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "application panicked".to_string()
    }
}
