use std::collections::VecDeque;

use bytes::Bytes;
use chrono::Utc;
use ferry_common::{
    AsyncReply, AsyncRequest, AsyncRequestKind, CertificateRequest, CommandId, FerryError,
    MessageType, Notification, OptionId, Reply, ReplyFlags,
};
use ferry_core::aio::{Aio, Reader, Writer, WriterFactory};
use ferry_core::buffer_pool::BufferLease;
use ferry_core::connection::TlsEstablished;
use ferry_core::control_socket::ControlEvent;
use ferry_core::operation::{OpMeta, Operation};
use ferry_tls::certificate_info;
use http::header::LOCATION;
use http::{Method, StatusCode};
use url::Url;

use super::op_meta;
use crate::request::{HttpRequest, Target};
use crate::response::{HttpResponse, ResponseEvent, ResponseParser};
use crate::session::{HttpContext, HttpSession, Waiting};

/// Upper bound of loop iterations before yielding back to the event loop.
const MAX_ITERATIONS: usize = 100;

/// Where the body of a successful response goes.
pub enum BodyTarget {
    Discard,
    /// Written from `offset` on. A server ignoring the range restarts the
    /// file from zero.
    Writer { factory: WriterFactory, offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    WaitThrottle,
    Connect,
    WaitConnect,
    WaitCertificate,
    SendHead,
    SendBody,
    Read,
}

/// One request, including the redirects it is answered with.
pub struct RequestOp {
    meta: OpMeta,
    state: State,
    request: HttpRequest,
    target: BodyTarget,
    parser: ResponseParser,
    response: Option<HttpResponse>,
    redirects: u32,
    redirect: Option<Url>,
    reader: Option<Box<dyn Reader>>,
    writer: Option<Box<dyn Writer>>,
    lease: Option<BufferLease>,
    pending: VecDeque<Bytes>,
    received: u64,
    complete: bool,
    /// A request is in flight on the session's connection
    exchanging: bool,
}

impl RequestOp {
    pub fn new(request: HttpRequest, target: BodyTarget) -> Self {
        Self {
            meta: OpMeta::new("RequestOp", CommandId::FileTransfer),
            state: State::Init,
            parser: ResponseParser::new(request.method == Method::HEAD),
            request,
            target,
            response: None,
            redirects: 0,
            redirect: None,
            reader: None,
            writer: None,
            lease: None,
            pending: VecDeque::new(),
            received: 0,
            complete: false,
            exchanging: false,
        }
    }

    /// Redirects followed so far.
    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    /// Head of the final response.
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    /// Body bytes of the final response.
    pub fn received(&self) -> u64 {
        self.received
    }

    fn target(&self, cx: &HttpContext) -> Result<Target, Reply> {
        Target::from_url(&self.request.url).ok_or_else(|| {
            cx.log
                .error(format!("Unsupported URL: {}", self.request.url));
            Reply::CRITICAL_ERROR
        })
    }

    fn throttle(&mut self, cx: &HttpContext, host: &str, first: bool) -> Option<Reply> {
        let Some(delay) = cx.engine.throttler.get_throttle(host) else {
            if self.meta.sleeping {
                self.meta.sleeping = false;
                cx.layers.clock.touch();
            }
            return None;
        };
        if first {
            cx.log.status(format!(
                "Waiting {}s before contacting {host} again",
                delay.as_secs().max(1)
            ));
        }
        let events = cx.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ControlEvent::Resume);
        });
        self.meta.sleeping = true;
        self.state = State::WaitThrottle;
        Some(Reply::WOULDBLOCK)
    }

    fn connect(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        let target = match self.target(cx) {
            Ok(target) => target,
            Err(reply) => return reply,
        };
        if session.can_reuse(&target) {
            cx.log
                .log(MessageType::DebugInfo, "Reusing existing connection");
            self.state = State::SendHead;
            return Reply::CONTINUE;
        }
        if let Err(error) = session.open(target, cx) {
            cx.log.error(format!("Could not set up TLS: {error}"));
            return Reply::CRITICAL_ERROR;
        }
        self.exchanging = true;
        self.state = State::WaitConnect;
        session.expect(Waiting::Connect);
        Reply::WOULDBLOCK
    }

    fn on_tls(&mut self, established: Box<TlsEstablished>, cx: &mut HttpContext) -> Reply {
        let TlsEstablished { info, verification } = *established;
        cx.log.status(format!(
            "TLS connection established ({}, {})",
            info.protocol_version, info.cipher
        ));
        cx.post(Notification::Encryption(
            info.encryption_details(verification.as_ref()),
        ));
        if let Some(record) = verification.filter(|r| r.needs_confirmation()) {
            let chain = record
                .chain
                .iter()
                .filter_map(|der| certificate_info(der).ok())
                .collect();
            let target = Target::from_url(&self.request.url);
            self.state = State::WaitCertificate;
            let request = CertificateRequest {
                host: target.as_ref().map(|t| t.host.clone()).unwrap_or_default(),
                port: target.map(|t| t.port).unwrap_or_default(),
                chain,
                verification_error: record.error.clone(),
                protocol_version: info.protocol_version,
                cipher: info.cipher,
            };
            return cx.request(&mut self.meta, AsyncRequestKind::Certificate(request));
        }
        self.state = State::SendHead;
        Reply::CONTINUE
    }

    fn send_head(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        let body_length = match &self.request.body {
            Some(body) => {
                let Some(size) = body.size() else {
                    cx.log.error(format!("Cannot determine the size of {}", body.name()));
                    return Reply::CRITICAL_ERROR | ReplyFlags::INTERNALERROR;
                };
                match body.open(0, cx.pool()) {
                    Ok(reader) => self.reader = Some(reader),
                    Err(error) => {
                        cx.log
                            .error(format!("Could not open {} for reading: {error}", body.name()));
                        return Reply::CRITICAL_ERROR;
                    }
                }
                cx.status.init(size as i64, 0, false);
                cx.status.set_start_time();
                Some(size)
            }
            None => None,
        };
        self.parser = ResponseParser::new(self.request.method == Method::HEAD);
        self.response = None;
        self.complete = false;
        self.received = 0;
        self.exchanging = true;

        cx.log.log(
            self.meta.send_log_level,
            format!("{} {}", self.request.method, self.request.url),
        );
        if !session.send(cx, self.request.head(body_length)) {
            return Reply::ERROR | ReplyFlags::DISCONNECTED;
        }
        self.state = if self.reader.is_some() {
            State::SendBody
        } else {
            State::Read
        };
        Reply::CONTINUE
    }

    fn send_body(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        let waiter = session.waiter(cx);
        for _ in 0..MAX_ITERATIONS {
            let Some(reader) = self.reader.as_mut() else {
                break;
            };
            match reader.read(&waiter) {
                Aio::Ok(Some(buffer)) => {
                    cx.status.update(buffer.len() as i64);
                    if !session.send(cx, Bytes::copy_from_slice(&buffer)) {
                        return Reply::ERROR | ReplyFlags::DISCONNECTED;
                    }
                }
                Aio::Ok(None) => {
                    self.reader = None;
                }
                Aio::Wait => {
                    session.expect(Waiting::ReadBuffer);
                    return Reply::WOULDBLOCK;
                }
                Aio::Error(error) => {
                    cx.log.error(format!("Could not read local file: {error}"));
                    return Reply::CRITICAL_ERROR;
                }
            }
        }
        if self.reader.is_none() {
            self.state = State::Read;
            return Reply::CONTINUE;
        }
        let _ = cx.events.send(ControlEvent::Resume);
        Reply::WOULDBLOCK
    }

    fn read(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        let incoming = session.take_incoming();
        if !incoming.is_empty() {
            self.parser.feed(&incoming);
        }
        for _ in 0..MAX_ITERATIONS {
            match self.flush(session, cx) {
                Ok(true) => {}
                Ok(false) => {
                    session.expect(Waiting::WriteBuffer);
                    return Reply::WOULDBLOCK;
                }
                Err(reply) => return reply,
            }
            if self.complete {
                return self.complete_response(session, cx);
            }
            let event = match self.parser.next() {
                Ok(event) => event,
                Err(error) => {
                    cx.log.error(format!("Malformed response: {error}"));
                    return Reply::ERROR;
                }
            };
            match event {
                Some(ResponseEvent::Head(head)) => {
                    if let Some(reply) = self.on_head(head, cx) {
                        return reply;
                    }
                }
                Some(ResponseEvent::Body(data)) => {
                    self.received += data.len() as u64;
                    if self.writer.is_some() {
                        cx.status.update(data.len() as i64);
                        self.pending.push_back(data);
                    }
                }
                Some(ResponseEvent::Done) => self.complete = true,
                None if session.eof => {
                    if let Err(error) = self.parser.finish_at_eof() {
                        cx.log.error(format!("Malformed response: {error}"));
                        return Reply::ERROR;
                    }
                    self.complete = true;
                }
                None => {
                    session.expect(Waiting::Response);
                    return Reply::WOULDBLOCK;
                }
            }
        }
        session.expect(Waiting::Response);
        let _ = cx.events.send(ControlEvent::Resume);
        Reply::WOULDBLOCK
    }

    fn on_head(&mut self, head: HttpResponse, cx: &mut HttpContext) -> Option<Reply> {
        cx.log.log(
            MessageType::Response,
            format!("{:?} {}", head.version, head.status),
        );
        let status = head.status;
        if status.is_client_error() || status == StatusCode::SERVICE_UNAVAILABLE {
            if let (Some(delay), Some(host)) = (head.retry_after(Utc::now()), self.request.url.host_str()) {
                cx.log.status(format!(
                    "Server asked to wait {}s before the next request",
                    delay.as_secs()
                ));
                cx.engine.throttler.throttle(host, delay);
            }
        }

        if status == StatusCode::USE_PROXY {
            cx.log.error("Redirects through a proxy are not supported");
            return Some(Reply::ERROR);
        }
        if head.is_redirect() {
            let Some(location) = head.header(&LOCATION) else {
                cx.log.error("Redirect without a Location header");
                return Some(Reply::ERROR);
            };
            self.redirects += 1;
            let max = cx.options().get_int(OptionId::HttpMaxRedirects).max(0) as u32;
            if self.redirects >= max {
                cx.log.error("Too many redirects");
                return Some(Reply::ERROR);
            }
            match self.request.url.join(location) {
                Ok(url) if Target::from_url(&url).is_some() => self.redirect = Some(url),
                _ => {
                    cx.log.error(format!("Invalid redirect target: {location}"));
                    return Some(Reply::ERROR);
                }
            }
        } else if status.is_success() {
            if let Some(reply) = self.open_writer(&head, cx) {
                return Some(reply);
            }
        }
        self.response = Some(head);
        None
    }

    fn open_writer(&mut self, head: &HttpResponse, cx: &mut HttpContext) -> Option<Reply> {
        let BodyTarget::Writer { factory, offset } = &self.target else {
            return None;
        };
        let offset = if head.status == StatusCode::PARTIAL_CONTENT {
            match head.content_range_start() {
                Some(start) if start == *offset => start,
                start => {
                    cx.log.error(format!(
                        "Server returned range starting at {}, expected {offset}",
                        start.map(|s| s.to_string()).unwrap_or_else(|| "?".into())
                    ));
                    return Some(Reply::ERROR);
                }
            }
        } else {
            if *offset > 0 {
                cx.log
                    .status("Server does not support resuming, restarting from the beginning");
            }
            0
        };
        let length = match head.content_length() {
            Ok(length) => length,
            Err(error) => {
                cx.log.error(format!("Malformed response: {error}"));
                return Some(Reply::ERROR);
            }
        };
        match factory.ensure_parent_dir() {
            Ok(Some(created)) => cx.post(Notification::LocalDirCreated(created)),
            Ok(None) => {}
            Err(error) => {
                cx.log.error(format!("Could not create local directory: {error}"));
                return Some(Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED);
            }
        }
        let total = length.map(|l| l + offset);
        match factory.open(offset, total, cx.pool()) {
            Ok(writer) => self.writer = Some(writer),
            Err(error) => {
                cx.log
                    .error(format!("Could not open {} for writing: {error}", factory.name()));
                return Some(Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED);
            }
        }
        cx.status
            .init(total.map_or(-1, |t| t as i64), offset as i64, false);
        cx.status.set_start_time();
        None
    }

    /// Moves pending body data into the writer. `Ok(false)` if the writer
    /// asked to wait.
    fn flush(&mut self, session: &mut HttpSession, cx: &HttpContext) -> Result<bool, Reply> {
        let Some(writer) = self.writer.as_mut() else {
            self.pending.clear();
            return Ok(true);
        };
        let waiter = session.waiter(cx);
        while let Some(mut data) = self.pending.pop_front() {
            while !data.is_empty() {
                let mut lease = match self.lease.take() {
                    Some(lease) => lease,
                    None => match writer.get_buffer(&waiter) {
                        Aio::Ok(lease) => lease,
                        Aio::Wait => {
                            self.pending.push_front(data);
                            return Ok(false);
                        }
                        Aio::Error(error) => return Err(write_failed(cx, error)),
                    },
                };
                let n = lease.spare().min(data.len());
                lease.extend_from_slice(&data.split_to(n));
                if lease.spare() > 0 {
                    self.lease = Some(lease);
                    continue;
                }
                match writer.add_buffer(lease, &waiter) {
                    Aio::Ok(()) => {}
                    Aio::Wait => {
                        if !data.is_empty() {
                            self.pending.push_front(data);
                        }
                        return Ok(false);
                    }
                    Aio::Error(error) => return Err(write_failed(cx, error)),
                }
            }
        }
        Ok(true)
    }

    fn complete_response(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        if let Some(writer) = self.writer.as_mut() {
            let waiter = session.waiter(cx);
            if let Some(lease) = self.lease.take().filter(|l| !l.is_empty()) {
                match writer.add_buffer(lease, &waiter) {
                    Aio::Ok(()) => {}
                    Aio::Wait => {
                        session.expect(Waiting::WriteBuffer);
                        return Reply::WOULDBLOCK;
                    }
                    Aio::Error(error) => return write_failed(cx, error),
                }
            }
            match writer.finalize(&waiter) {
                Aio::Ok(()) => self.writer = None,
                Aio::Wait => {
                    session.expect(Waiting::WriteBuffer);
                    return Reply::WOULDBLOCK;
                }
                Aio::Error(error) => return write_failed(cx, error),
            }
        }

        session.finish_exchange(self.parser.reusable() && self.request.keep_alive());
        self.exchanging = false;

        if let Some(url) = self.redirect.take() {
            return self.follow(url, cx);
        }
        let Some(response) = &self.response else {
            return Reply::ERROR | ReplyFlags::INTERNALERROR;
        };
        if response.status.is_success() {
            Reply::OK
        } else {
            cx.log.error(format!("Request failed: {}", response.status));
            Reply::ERROR
        }
    }

    fn follow(&mut self, url: Url, cx: &HttpContext) -> Reply {
        cx.log
            .status(format!("Redirected to {url} (redirect {})", self.redirects));
        let see_other = self
            .response
            .as_ref()
            .is_some_and(|r| r.status == StatusCode::SEE_OTHER);
        if see_other && self.request.method != Method::GET && self.request.method != Method::HEAD {
            self.request.method = Method::GET;
            self.request.body = None;
        }
        self.request.url = url;
        self.response = None;
        self.state = State::Init;
        Reply::CONTINUE
    }
}

fn write_failed(cx: &HttpContext, error: FerryError) -> Reply {
    cx.log.error(format!("Could not write local file: {error}"));
    Reply::CRITICAL_ERROR | ReplyFlags::WRITEFAILED
}

impl Operation<HttpSession> for RequestOp {
    op_meta!();

    fn send(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        match self.state {
            State::Init | State::WaitThrottle => {
                let target = match self.target(cx) {
                    Ok(target) => target,
                    Err(reply) => return reply,
                };
                let first = self.state == State::Init;
                if let Some(reply) = self.throttle(cx, &target.host, first) {
                    return reply;
                }
                self.state = State::Connect;
                Reply::CONTINUE
            }
            State::Connect => self.connect(session, cx),
            State::WaitConnect => {
                if let Some(established) = session.tls_established.take() {
                    return self.on_tls(established, cx);
                }
                if session.is_ready() {
                    self.state = State::SendHead;
                    return Reply::CONTINUE;
                }
                Reply::WOULDBLOCK
            }
            State::WaitCertificate => Reply::WOULDBLOCK,
            State::SendHead => self.send_head(session, cx),
            State::SendBody => self.send_body(session, cx),
            State::Read => self.read(session, cx),
        }
    }

    fn parse_response(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        if self.state != State::Read {
            return Reply::WOULDBLOCK;
        }
        self.read(session, cx)
    }

    fn on_async_reply(
        &mut self,
        request: AsyncRequest,
        _session: &mut HttpSession,
        cx: &mut HttpContext,
    ) -> Reply {
        match (self.state, request.reply) {
            (State::WaitCertificate, Some(AsyncReply::Certificate { trust, always })) => {
                let AsyncRequestKind::Certificate(certificate) = &request.kind else {
                    return Reply::ERROR | ReplyFlags::INTERNALERROR;
                };
                if let Err(error) = cx
                    .engine
                    .trusted_certificates
                    .apply_answer(certificate, trust, always)
                {
                    cx.log.error(format!("Request refused: {error}"));
                    return Reply::CRITICAL_ERROR;
                }
                self.state = State::SendHead;
                Reply::CONTINUE
            }
            _ => Reply::ERROR | ReplyFlags::INTERNALERROR,
        }
    }

    fn reset(&mut self, result: Reply, session: &mut HttpSession, _cx: &mut HttpContext) -> Reply {
        if self.exchanging {
            session.drop_connection();
        }
        session.expect(Waiting::Nothing);
        result
    }
}
