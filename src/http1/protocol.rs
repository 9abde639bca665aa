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

use std::cmp;
use std::io::{self, Write};
use std::mem;
use std::str;

const HEADERS_MAX: usize = 100;

fn parse_as_int(src: &[u8]) -> Result<usize, ()> {
    let int_str = match str::from_utf8(src) {
        Ok(s) => s,
        Err(_) => return Err(()),
    };

    match int_str.trim().parse() {
        Ok(x) => Ok(x),
        Err(_) => Err(()),
    }
}

fn header_contains_param(value: &[u8], param: &str, ignore_case: bool) -> bool {
    for part in value.split(|b| *b == b',') {
        let part_str = match str::from_utf8(part) {
            Ok(s) => s,
            Err(_) => continue,
        };

        let part_str = part_str.trim();

        if ignore_case {
            if part_str.eq_ignore_ascii_case(param) {
                return true;
            }
        } else if part_str == param {
            return true;
        }
    }

    false
}

/// Size of a message body, as declared by its framing headers.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BodySize {
    NoBody,
    Known(usize),
    Unknown,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum RecvState {
    // waiting for a request line + header block
    Request,

    // receiving body data
    Body,

    // request fully received
    Done,

    // peer closed
    Closed,
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum SendState {
    // waiting for the response head
    Response,

    // sending body data
    Body,

    // response fully sent
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Parse(#[from] httparse::Error),

    #[error("unsupported http version")]
    UnsupportedVersion,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("conflicting content length values")]
    ConflictingContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("both content length and transfer encoding present")]
    AmbiguousFraming,

    #[error("request header block too large")]
    RequestHeaderTooLarge,

    #[error("incomplete event too large")]
    EventTooLarge,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("invalid chunk suffix")]
    InvalidChunkSuffix,

    #[error("peer closed connection mid-message")]
    UnexpectedEof,

    #[error("body exceeds declared content length")]
    ExcessBodyData,

    #[error("body shorter than declared content length")]
    TruncatedBody,

    #[error("exchange is not complete")]
    InvalidState,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Status code for the synthesized error response when the error was
    /// raised before any body data was accepted.
    pub fn status_hint(&self) -> (u16, &'static str) {
        match self {
            Self::RequestHeaderTooLarge => (431, "Request Header Fields Too Large"),
            _ => (400, "Bad Request"),
        }
    }
}

/// A parsed request head, plus the framing facts derived from it.
#[derive(Debug, PartialEq)]
pub struct RequestHead {
    pub method: String,
    pub target: Vec<u8>,
    pub ver_min: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body_size: BodySize,
    pub expect_100: bool,
}

pub struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// One inbound protocol event.
#[derive(Debug, PartialEq)]
pub enum Event {
    NeedData,
    Request(RequestHead),
    Data(Vec<u8>),
    EndOfMessage,
    Paused,
    ConnectionClosed,
}

/// Sans-io HTTP/1.1 server state machine.
///
/// Bytes go in through `receive_data`, events come out of `next_event`.
/// Outbound events are serialized into any writer by the `send_*` methods.
/// After both sides of an exchange complete, `start_next_cycle` resets the
/// per-exchange state while retaining any buffered pipelined bytes.
///
/// Parsing of request lines, header blocks, chunk sizes and trailers is
/// delegated to httparse; this type owns the framing rules built on top:
/// message boundaries, keep-alive, chunked encode/decode, and rejection of
/// ambiguous framing.
pub struct ServerProtocol {
    rbuf: Vec<u8>,
    eof: bool,
    max_incomplete: Option<usize>,

    recv_state: RecvState,
    send_state: SendState,

    ver_min: u8,
    head_request: bool,
    persistent: bool,
    expect_100: bool,

    recv_left: usize,
    chunked_in: bool,
    chunk_left: Option<usize>,
    chunk_size: usize,

    send_body: BodySize,
    send_left: usize,
    chunked_out: bool,
}

#[allow(clippy::new_without_default)]
impl ServerProtocol {
    pub fn new(max_incomplete_event_size: Option<usize>) -> Self {
        Self {
            rbuf: Vec::new(),
            eof: false,
            max_incomplete: max_incomplete_event_size,
            recv_state: RecvState::Request,
            send_state: SendState::Response,
            ver_min: 1,
            head_request: false,
            persistent: false,
            expect_100: false,
            recv_left: 0,
            chunked_in: false,
            chunk_left: None,
            chunk_size: 0,
            send_body: BodySize::NoBody,
            send_left: 0,
            chunked_out: false,
        }
    }

    /// Append inbound bytes. An empty slice marks peer EOF.
    pub fn receive_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.eof = true;
        } else {
            self.rbuf.extend_from_slice(data);
        }
    }

    pub fn buffered(&self) -> usize {
        self.rbuf.len()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Force the connection to close after the current exchange.
    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    /// True when the client sent `Expect: 100-continue` and no interim or
    /// final response has gone out yet.
    pub fn they_are_waiting_for_100_continue(&self) -> bool {
        self.expect_100 && self.send_state == SendState::Response
    }

    pub fn next_event(&mut self) -> Result<Event, ProtocolError> {
        match self.recv_state {
            RecvState::Request => self.read_request(),
            RecvState::Body => self.read_body(),
            RecvState::Done => Ok(Event::Paused),
            RecvState::Closed => Ok(Event::ConnectionClosed),
        }
    }

    fn read_request(&mut self) -> Result<Event, ProtocolError> {
        if self.rbuf.is_empty() {
            if self.eof {
                self.recv_state = RecvState::Closed;
                return Ok(Event::ConnectionClosed);
            }

            return Ok(Event::NeedData);
        }

        // take the buffer so the parse borrow doesn't pin all of self
        let mut buf = mem::take(&mut self.rbuf);

        // None marks an incomplete head
        let parsed: Result<Option<(RequestHead, usize)>, ProtocolError> = {
            let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
            let mut req = httparse::Request::new(&mut headers);

            match req.parse(&buf) {
                Ok(httparse::Status::Complete(size)) => self
                    .process_request(&req)
                    .map(|head| Some((head, size))),
                Ok(httparse::Status::Partial) => Ok(None),
                Err(e) => Err(ProtocolError::Parse(e)),
            }
        };

        match parsed {
            Ok(Some((head, size))) => {
                buf.drain(..size);
                self.rbuf = buf;

                self.recv_state = match head.body_size {
                    BodySize::NoBody => RecvState::Done,
                    BodySize::Known(_) | BodySize::Unknown => RecvState::Body,
                };

                Ok(Event::Request(head))
            }
            Ok(None) => {
                let too_large = match self.max_incomplete {
                    Some(max) => buf.len() > max,
                    None => false,
                };

                self.rbuf = buf;

                if too_large {
                    return Err(ProtocolError::RequestHeaderTooLarge);
                }

                if self.eof {
                    self.recv_state = RecvState::Closed;
                    return Err(ProtocolError::UnexpectedEof);
                }

                Ok(Event::NeedData)
            }
            Err(e) => {
                self.rbuf = buf;
                Err(e)
            }
        }
    }

    fn process_request(&mut self, req: &httparse::Request) -> Result<RequestHead, ProtocolError> {
        let version = req.version.unwrap();

        if version > 1 {
            return Err(ProtocolError::UnsupportedVersion);
        }

        let mut content_len: Option<usize> = None;
        let mut chunked = false;
        let mut keep_alive = false;
        let mut close = false;
        let mut expect_100 = false;

        let mut headers = Vec::with_capacity(req.headers.len());

        for h in req.headers.iter() {
            if h.name.eq_ignore_ascii_case("Content-Length") {
                let len = match parse_as_int(h.value) {
                    Ok(len) => len,
                    Err(()) => return Err(ProtocolError::InvalidContentLength),
                };

                match content_len {
                    Some(prev) if prev != len => {
                        return Err(ProtocolError::ConflictingContentLength)
                    }
                    _ => content_len = Some(len),
                }
            } else if h.name.eq_ignore_ascii_case("Transfer-Encoding") {
                // chunked must be the only (and thus last) coding applied
                let mut codings = h.value.split(|b| *b == b',');

                let only = match (codings.next(), codings.next()) {
                    (Some(c), None) => c,
                    _ => return Err(ProtocolError::UnsupportedTransferEncoding),
                };

                let only = match str::from_utf8(only) {
                    Ok(s) => s.trim(),
                    Err(_) => return Err(ProtocolError::UnsupportedTransferEncoding),
                };

                if !only.eq_ignore_ascii_case("chunked") {
                    return Err(ProtocolError::UnsupportedTransferEncoding);
                }

                chunked = true;
            } else if h.name.eq_ignore_ascii_case("Connection") {
                if !keep_alive && header_contains_param(h.value, "keep-alive", true) {
                    keep_alive = true;
                }

                if !close && header_contains_param(h.value, "close", false) {
                    close = true;
                }
            } else if h.name.eq_ignore_ascii_case("Expect") {
                if header_contains_param(h.value, "100-continue", false) && version >= 1 {
                    expect_100 = true;
                }
            }

            headers.push((h.name.to_string(), h.value.to_vec()));
        }

        if chunked && content_len.is_some() {
            return Err(ProtocolError::AmbiguousFraming);
        }

        let body_size = if chunked {
            BodySize::Unknown
        } else if let Some(len) = content_len {
            BodySize::Known(len)
        } else {
            BodySize::NoBody
        };

        let method = req.method.unwrap();

        self.ver_min = version;
        self.head_request = method == "HEAD";
        self.chunked_in = chunked;
        self.chunk_left = None;
        self.chunk_size = 0;

        if let BodySize::Known(len) = body_size {
            self.recv_left = len;
        }

        if version >= 1 {
            self.persistent = !close;
        } else {
            self.persistent = keep_alive && !close;
        }

        let expect_100 = expect_100 && body_size != BodySize::NoBody;
        self.expect_100 = expect_100;

        Ok(RequestHead {
            method: method.to_string(),
            target: req.path.unwrap().as_bytes().to_vec(),
            ver_min: version,
            headers,
            body_size,
            expect_100,
        })
    }

    fn read_body(&mut self) -> Result<Event, ProtocolError> {
        if self.chunked_in {
            self.read_body_chunked()
        } else {
            self.read_body_sized()
        }
    }

    fn read_body_sized(&mut self) -> Result<Event, ProtocolError> {
        if self.recv_left == 0 {
            self.recv_state = RecvState::Done;
            return Ok(Event::EndOfMessage);
        }

        if self.rbuf.is_empty() {
            if self.eof {
                self.recv_state = RecvState::Closed;
                return Err(ProtocolError::UnexpectedEof);
            }

            return Ok(Event::NeedData);
        }

        let size = cmp::min(self.recv_left, self.rbuf.len());
        let data: Vec<u8> = self.rbuf.drain(..size).collect();
        self.recv_left -= size;

        Ok(Event::Data(data))
    }

    fn read_body_chunked(&mut self) -> Result<Event, ProtocolError> {
        loop {
            if self.chunk_left.is_none() {
                match httparse::parse_chunk_size(&self.rbuf) {
                    Ok(httparse::Status::Complete((pos, size))) => {
                        let size = size as usize;
                        self.rbuf.drain(..pos);
                        self.chunk_left = Some(size);
                        self.chunk_size = size;
                    }
                    Ok(httparse::Status::Partial) => {
                        if let Some(max) = self.max_incomplete {
                            if self.rbuf.len() > max {
                                return Err(ProtocolError::EventTooLarge);
                            }
                        }

                        if self.eof {
                            self.recv_state = RecvState::Closed;
                            return Err(ProtocolError::UnexpectedEof);
                        }

                        return Ok(Event::NeedData);
                    }
                    Err(_) => return Err(ProtocolError::InvalidChunkSize),
                }
            }

            let left = self.chunk_left.unwrap();

            if left > 0 {
                if self.rbuf.is_empty() {
                    if self.eof {
                        self.recv_state = RecvState::Closed;
                        return Err(ProtocolError::UnexpectedEof);
                    }

                    return Ok(Event::NeedData);
                }

                let size = cmp::min(left, self.rbuf.len());
                let data: Vec<u8> = self.rbuf.drain(..size).collect();
                self.chunk_left = Some(left - size);

                return Ok(Event::Data(data));
            }

            // content consumed. read the footer, or the trailer block for
            // the final chunk

            if self.chunk_size == 0 {
                let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];

                match httparse::parse_headers(&self.rbuf, &mut headers) {
                    Ok(httparse::Status::Complete((pos, _))) => {
                        self.rbuf.drain(..pos);
                        self.chunk_left = None;
                        self.recv_state = RecvState::Done;

                        return Ok(Event::EndOfMessage);
                    }
                    Ok(httparse::Status::Partial) => {
                        if let Some(max) = self.max_incomplete {
                            if self.rbuf.len() > max {
                                return Err(ProtocolError::EventTooLarge);
                            }
                        }

                        if self.eof {
                            self.recv_state = RecvState::Closed;
                            return Err(ProtocolError::UnexpectedEof);
                        }

                        return Ok(Event::NeedData);
                    }
                    Err(e) => return Err(ProtocolError::Parse(e)),
                }
            }

            if self.rbuf.len() < 2 {
                if self.eof {
                    self.recv_state = RecvState::Closed;
                    return Err(ProtocolError::UnexpectedEof);
                }

                return Ok(Event::NeedData);
            }

            if &self.rbuf[..2] != b"\r\n" {
                return Err(ProtocolError::InvalidChunkSuffix);
            }

            self.rbuf.drain(..2);
            self.chunk_left = None;
            self.chunk_size = 0;
        }
    }

    pub fn send_100_continue<W: Write>(&mut self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        self.expect_100 = false;

        Ok(())
    }

    /// Serialize the response head.
    ///
    /// `body_size` declares the outbound framing: `Known` produces identity
    /// framing with a Content-Length header, `Unknown` produces chunked
    /// framing on HTTP/1.1 and close-delimited framing on HTTP/1.0.
    /// Connection, Content-Length and Transfer-Encoding headers in `head`
    /// are ignored; this type computes them.
    pub fn send_response<W: Write>(
        &mut self,
        writer: &mut W,
        head: &ResponseHead,
        body_size: BodySize,
    ) -> Result<(), ProtocolError> {
        assert_eq!(self.send_state, SendState::Response);

        let mut body_size = body_size;

        // certain responses have no body
        match head.code {
            100..=199 | 204 | 304 => {
                body_size = BodySize::NoBody;
            }
            _ => {}
        }

        let chunked = body_size == BodySize::Unknown && self.ver_min >= 1;

        if body_size == BodySize::Unknown && !chunked {
            // close-delimited
            self.persistent = false;
        }

        if self.ver_min >= 1 {
            writer.write_all(b"HTTP/1.1 ")?;
        } else {
            writer.write_all(b"HTTP/1.0 ")?;
        }

        write!(writer, "{} {}\r\n", head.code, head.reason)?;

        for (name, value) in head.headers.iter() {
            if name.eq_ignore_ascii_case("Connection")
                || name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Transfer-Encoding")
            {
                continue;
            }

            write!(writer, "{}: ", name)?;
            writer.write_all(value)?;
            writer.write_all(b"\r\n")?;
        }

        if self.persistent && self.ver_min == 0 {
            writer.write_all(b"Connection: keep-alive\r\n")?;
        } else if !self.persistent && self.ver_min >= 1 {
            writer.write_all(b"Connection: close\r\n")?;
        }

        if let BodySize::Known(x) = body_size {
            write!(writer, "Content-Length: {}\r\n", x)?;
        }

        if chunked {
            writer.write_all(b"Transfer-Encoding: chunked\r\n")?;
        }

        writer.write_all(b"\r\n")?;

        self.send_state = SendState::Body;
        self.send_body = body_size;
        self.send_left = match body_size {
            BodySize::Known(x) => x,
            _ => 0,
        };
        self.chunked_out = chunked;
        self.expect_100 = false;

        Ok(())
    }

    /// Serialize one piece of body data. For HEAD requests the bytes are
    /// counted against the declared framing but not written.
    pub fn send_body_data<W: Write>(
        &mut self,
        writer: &mut W,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        assert_eq!(self.send_state, SendState::Body);

        match self.send_body {
            BodySize::NoBody => Ok(()),
            BodySize::Known(_) => {
                if data.len() > self.send_left {
                    return Err(ProtocolError::ExcessBodyData);
                }

                self.send_left -= data.len();

                if !self.head_request {
                    writer.write_all(data)?;
                }

                Ok(())
            }
            BodySize::Unknown => {
                if self.head_request || data.is_empty() {
                    return Ok(());
                }

                if self.chunked_out {
                    write!(writer, "{:x}\r\n", data.len())?;
                    writer.write_all(data)?;
                    writer.write_all(b"\r\n")?;
                } else {
                    writer.write_all(data)?;
                }

                Ok(())
            }
        }
    }

    /// Finish the outbound message: write the terminating zero chunk for
    /// chunked framing and verify identity framing was satisfied.
    pub fn send_end<W: Write>(&mut self, writer: &mut W) -> Result<(), ProtocolError> {
        assert_eq!(self.send_state, SendState::Body);

        match self.send_body {
            BodySize::Known(_) => {
                if self.send_left != 0 {
                    return Err(ProtocolError::TruncatedBody);
                }
            }
            BodySize::Unknown => {
                if self.chunked_out && !self.head_request {
                    writer.write_all(b"0\r\n\r\n")?;
                }
            }
            BodySize::NoBody => {}
        }

        self.send_state = SendState::Done;

        Ok(())
    }

    /// Reset per-exchange state, keeping buffered pipelined bytes.
    pub fn start_next_cycle(&mut self) -> Result<(), ProtocolError> {
        if self.recv_state != RecvState::Done
            || self.send_state != SendState::Done
            || !self.persistent
        {
            return Err(ProtocolError::InvalidState);
        }

        self.recv_state = RecvState::Request;
        self.send_state = SendState::Response;
        self.head_request = false;
        self.expect_100 = false;
        self.recv_left = 0;
        self.chunked_in = false;
        self.chunk_left = None;
        self.chunk_size = 0;
        self.send_body = BodySize::NoBody;
        self.send_left = 0;
        self.chunked_out = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_request(p: &mut ServerProtocol, data: &[u8]) -> Result<RequestHead, ProtocolError> {
        p.receive_data(data);

        match p.next_event()? {
            Event::Request(head) => Ok(head),
            e => panic!("unexpected event: {:?}", e),
        }
    }

    #[test]
    fn test_request_no_body() {
        let mut p = ServerProtocol::new(None);

        let head = recv_request(&mut p, b"GET /path?a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, b"/path?a=1");
        assert_eq!(head.ver_min, 1);
        assert_eq!(head.body_size, BodySize::NoBody);
        assert!(!head.expect_100);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0, "Host");
        assert_eq!(head.headers[0].1, b"example.com");
        assert!(p.is_persistent());

        assert_eq!(p.next_event().unwrap(), Event::Paused);
    }

    #[test]
    fn test_request_partial_then_complete() {
        let mut p = ServerProtocol::new(None);

        p.receive_data(b"GET / HTTP/1.1\r\nHost: exa");
        assert_eq!(p.next_event().unwrap(), Event::NeedData);

        p.receive_data(b"mple.com\r\n\r\n");
        match p.next_event().unwrap() {
            Event::Request(head) => assert_eq!(head.method, "GET"),
            e => panic!("unexpected event: {:?}", e),
        }
    }

    #[test]
    fn test_request_with_body() {
        let mut p = ServerProtocol::new(None);

        let head =
            recv_request(&mut p, b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel").unwrap();
        assert_eq!(head.body_size, BodySize::Known(5));

        assert_eq!(p.next_event().unwrap(), Event::Data(b"hel".to_vec()));
        assert_eq!(p.next_event().unwrap(), Event::NeedData);

        p.receive_data(b"lo");
        assert_eq!(p.next_event().unwrap(), Event::Data(b"lo".to_vec()));
        assert_eq!(p.next_event().unwrap(), Event::EndOfMessage);
        assert_eq!(p.next_event().unwrap(), Event::Paused);
    }

    #[test]
    fn test_request_chunked_body() {
        let mut p = ServerProtocol::new(None);

        let head = recv_request(
            &mut p,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.body_size, BodySize::Unknown);

        p.receive_data(b"5\r\nhello\r\n3\r\nfoo\r\n0\r\n\r\n");
        assert_eq!(p.next_event().unwrap(), Event::Data(b"hello".to_vec()));
        assert_eq!(p.next_event().unwrap(), Event::Data(b"foo".to_vec()));
        assert_eq!(p.next_event().unwrap(), Event::EndOfMessage);
    }

    #[test]
    fn test_request_chunked_with_trailers() {
        let mut p = ServerProtocol::new(None);

        recv_request(
            &mut p,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();

        p.receive_data(b"2\r\nab\r\n0\r\nX-Checksum: abc\r\n\r\n");
        assert_eq!(p.next_event().unwrap(), Event::Data(b"ab".to_vec()));
        assert_eq!(p.next_event().unwrap(), Event::EndOfMessage);
    }

    #[test]
    fn test_content_length_with_chunked_rejected() {
        let mut p = ServerProtocol::new(None);
        p.receive_data(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );

        match p.next_event() {
            Err(ProtocolError::AmbiguousFraming) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_conflicting_content_length_rejected() {
        let mut p = ServerProtocol::new(None);
        p.receive_data(b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");

        match p.next_event() {
            Err(ProtocolError::ConflictingContentLength) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_duplicate_equal_content_length_allowed() {
        let mut p = ServerProtocol::new(None);
        p.receive_data(b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok");

        match p.next_event().unwrap() {
            Event::Request(head) => assert_eq!(head.body_size, BodySize::Known(2)),
            e => panic!("unexpected event: {:?}", e),
        }
    }

    #[test]
    fn test_unsupported_transfer_encoding_rejected() {
        for value in ["gzip", "gzip, chunked", "chunked, gzip"] {
            let mut p = ServerProtocol::new(None);
            p.receive_data(
                format!("POST / HTTP/1.1\r\nTransfer-Encoding: {}\r\n\r\n", value).as_bytes(),
            );

            match p.next_event() {
                Err(ProtocolError::UnsupportedTransferEncoding) => {}
                r => panic!("unexpected result for {:?}: {:?}", value, r),
            }
        }
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut p = ServerProtocol::new(None);
        p.receive_data(b"GET / HTTP/2.0\r\n\r\n");

        assert!(p.next_event().is_err());
    }

    #[test]
    fn test_header_block_cap() {
        let mut p = ServerProtocol::new(Some(64));

        p.receive_data(b"GET / HTTP/1.1\r\n");
        assert_eq!(p.next_event().unwrap(), Event::NeedData);

        p.receive_data(b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");

        match p.next_event() {
            Err(ProtocolError::RequestHeaderTooLarge) => {}
            r => panic!("unexpected result: {:?}", r),
        }

        assert_eq!(ProtocolError::RequestHeaderTooLarge.status_hint().0, 431);
    }

    #[test]
    fn test_expect_100_continue() {
        let mut p = ServerProtocol::new(None);

        let head = recv_request(
            &mut p,
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap();
        assert!(head.expect_100);
        assert!(p.they_are_waiting_for_100_continue());

        let mut out = Vec::new();
        p.send_100_continue(&mut out).unwrap();
        assert_eq!(out, b"HTTP/1.1 100 Continue\r\n\r\n");
        assert!(!p.they_are_waiting_for_100_continue());
    }

    #[test]
    fn test_expect_without_body_ignored() {
        let mut p = ServerProtocol::new(None);

        let head =
            recv_request(&mut p, b"GET / HTTP/1.1\r\nExpect: 100-continue\r\n\r\n").unwrap();
        assert!(!head.expect_100);
    }

    #[test]
    fn test_connection_closed() {
        let mut p = ServerProtocol::new(None);

        p.receive_data(b"");
        assert_eq!(p.next_event().unwrap(), Event::ConnectionClosed);
    }

    #[test]
    fn test_closed_mid_request() {
        let mut p = ServerProtocol::new(None);

        p.receive_data(b"GET / HT");
        p.receive_data(b"");

        match p.next_event() {
            Err(ProtocolError::UnexpectedEof) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_closed_mid_body() {
        let mut p = ServerProtocol::new(None);

        recv_request(&mut p, b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").unwrap();
        assert_eq!(p.next_event().unwrap(), Event::Data(b"abc".to_vec()));

        p.receive_data(b"");
        match p.next_event() {
            Err(ProtocolError::UnexpectedEof) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_response_identity() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![("Content-Type".to_string(), b"text/plain".to_vec())],
            },
            BodySize::Known(5),
        )
        .unwrap();

        let head = String::from_utf8(out.clone()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(!head.contains("Connection:"));

        out.clear();
        p.send_body_data(&mut out, b"hello").unwrap();
        assert_eq!(out, b"hello");

        out.clear();
        p.send_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert!(p.is_persistent());

        p.start_next_cycle().unwrap();
        assert_eq!(p.next_event().unwrap(), Event::NeedData);
    }

    #[test]
    fn test_response_chunked() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Unknown,
        )
        .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Transfer-Encoding: chunked\r\n"));

        let mut out = Vec::new();
        p.send_body_data(&mut out, b"ab").unwrap();
        p.send_body_data(&mut out, b"cd").unwrap();
        p.send_body_data(&mut out, b"").unwrap();
        p.send_end(&mut out).unwrap();

        assert_eq!(out, b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n");
        assert!(p.is_persistent());
    }

    #[test]
    fn test_response_close_delimited_on_10() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(p.is_persistent());

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Unknown,
        )
        .unwrap();

        let head = String::from_utf8(out).unwrap();
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(!p.is_persistent());

        let mut out = Vec::new();
        p.send_body_data(&mut out, b"raw").unwrap();
        p.send_end(&mut out).unwrap();
        assert_eq!(out, b"raw");
    }

    #[test]
    fn test_response_http10_keep_alive_header() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Known(0),
        )
        .unwrap();

        assert!(String::from_utf8(out).unwrap().contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn test_response_connection_close_when_forced() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        p.set_persistent(false);

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Known(0),
        )
        .unwrap();

        assert!(String::from_utf8(out).unwrap().contains("Connection: close\r\n"));
    }

    #[test]
    fn test_response_overrides_framing_headers() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![
                    ("Content-Length".to_string(), b"999".to_vec()),
                    ("Transfer-Encoding".to_string(), b"gzip".to_vec()),
                    ("Connection".to_string(), b"upgrade".to_vec()),
                ],
            },
            BodySize::Known(2),
        )
        .unwrap();

        let head = String::from_utf8(out).unwrap();
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(!head.contains("999"));
        assert!(!head.contains("gzip"));
        assert!(!head.contains("upgrade"));
    }

    #[test]
    fn test_head_request_suppresses_body() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Known(5),
        )
        .unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Content-Length: 5\r\n"));

        let mut out = Vec::new();
        p.send_body_data(&mut out, b"hello").unwrap();
        p.send_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_body_length_enforced() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Known(3),
        )
        .unwrap();

        match p.send_body_data(&mut out, b"toolong") {
            Err(ProtocolError::ExcessBodyData) => {}
            r => panic!("unexpected result: {:?}", r),
        }

        p.send_body_data(&mut out, b"ab").unwrap();
        match p.send_end(&mut out) {
            Err(ProtocolError::TruncatedBody) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_status_without_body() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 204,
                reason: "No Content".to_string(),
                headers: vec![],
            },
            BodySize::Unknown,
        )
        .unwrap();

        let head = String::from_utf8(out).unwrap();
        assert!(!head.contains("Transfer-Encoding"));

        let mut out = Vec::new();
        p.send_body_data(&mut out, b"ignored").unwrap();
        p.send_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert!(p.is_persistent());
    }

    #[test]
    fn test_pipelined_bytes_survive_cycle() {
        let mut p = ServerProtocol::new(None);

        p.receive_data(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");

        match p.next_event().unwrap() {
            Event::Request(head) => assert_eq!(head.target, b"/a"),
            e => panic!("unexpected event: {:?}", e),
        }

        let mut out = Vec::new();
        p.send_response(
            &mut out,
            &ResponseHead {
                code: 200,
                reason: "OK".to_string(),
                headers: vec![],
            },
            BodySize::Known(0),
        )
        .unwrap();
        p.send_end(&mut out).unwrap();

        p.start_next_cycle().unwrap();

        match p.next_event().unwrap() {
            Event::Request(head) => assert_eq!(head.target, b"/b"),
            e => panic!("unexpected event: {:?}", e),
        }
    }

    #[test]
    fn test_cycle_requires_completion() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        match p.start_next_cycle() {
            Err(ProtocolError::InvalidState) => {}
            r => panic!("unexpected result: {:?}", r),
        }
    }

    #[test]
    fn test_connection_close_request() {
        let mut p = ServerProtocol::new(None);
        recv_request(&mut p, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!p.is_persistent());
    }
}
