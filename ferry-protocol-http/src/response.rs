//! Incremental parser for HTTP/1.x responses.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RETRY_AFTER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};

/// Longest status, header or chunk-size line accepted.
const MAX_LINE: usize = 64 * 1024;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("malformed status line: {0}")]
    StatusLine(String),
    #[error("malformed header line: {0}")]
    Header(String),
    #[error("line longer than 64 KiB")]
    LineTooLong,
    #[error("invalid Content-Length: {0}")]
    ContentLength(String),
    #[error("invalid chunk size: {0}")]
    ChunkSize(String),
    #[error("chunk data not followed by a line break")]
    ChunkTerminator,
    #[error("connection closed before the response was complete")]
    UnexpectedEof,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn has_token(&self, name: &HeaderName, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    /// The server is willing to serve another request on this connection.
    pub fn keep_alive(&self) -> bool {
        if self.has_token(&CONNECTION, "close") {
            return false;
        }
        self.version == Version::HTTP_11 || self.has_token(&CONNECTION, "keep-alive")
    }

    pub fn is_chunked(&self) -> bool {
        self.header(&TRANSFER_ENCODING).is_some_and(|value| {
            value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
        })
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpParseError> {
        let Some(value) = self.header(&CONTENT_LENGTH) else {
            return Ok(None);
        };
        // Repeated identical values were folded into one
        let mut values = value.split(',').map(str::trim);
        let first = values.next().unwrap_or_default();
        if values.any(|v| v != first) {
            return Err(HttpParseError::ContentLength(value.to_owned()));
        }
        first
            .parse()
            .map(Some)
            .map_err(|_| HttpParseError::ContentLength(value.to_owned()))
    }

    /// First byte position of a `206` answer.
    pub fn content_range_start(&self) -> Option<u64> {
        let value = self.header(&CONTENT_RANGE)?.trim();
        let range = value.strip_prefix("bytes")?.trim_start();
        let (start, _) = range.split_once('-')?;
        start.trim().parse().ok()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.header(&LAST_MODIFIED)?)
    }

    /// How long the server wants to be left alone, from a delay in
    /// seconds or an absolute date.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        let value = self.header(&RETRY_AFTER)?.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        let until = parse_http_date(value)?;
        (until - now).to_std().ok()
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Debug)]
pub enum ResponseEvent {
    Head(HttpResponse),
    Body(Bytes),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Length(u64),
    UntilClose,
    Chunked(Chunk),
    Done,
    Finished,
}

/// Turns the bytes of one response, fed in arbitrary pieces, into a head,
/// body pieces and an end marker. Informational `1xx` heads are skipped.
#[derive(Debug)]
pub struct ResponseParser {
    buf: BytesMut,
    state: State,
    /// The request was `HEAD`, no body follows whatever the headers say
    head_only: bool,
    head: Option<HttpResponse>,
    last_header: Option<HeaderName>,
    reusable: bool,
}

impl ResponseParser {
    pub fn new(head_only: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            state: State::StatusLine,
            head_only,
            head: None,
            last_header: None,
            reusable: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The response is complete and the connection may carry another one.
    pub fn reusable(&self) -> bool {
        self.state == State::Finished && self.reusable && self.buf.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    fn take_line(&mut self) -> Result<Option<String>, HttpParseError> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_LINE {
                return Err(HttpParseError::LineTooLong);
            }
            return Ok(None);
        };
        if end > MAX_LINE {
            return Err(HttpParseError::LineTooLong);
        }
        let raw = self.buf.split_to(end + 1);
        let line = &raw[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }

    fn take_body(&mut self, max: u64) -> Bytes {
        let n = usize::try_from(max).unwrap_or(usize::MAX).min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    pub fn next(&mut self) -> Result<Option<ResponseEvent>, HttpParseError> {
        loop {
            match self.state {
                State::StatusLine => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.head = Some(parse_status_line(&line)?);
                    self.last_header = None;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        if let Some(head) = self.end_of_head()? {
                            return Ok(Some(ResponseEvent::Head(head)));
                        }
                        continue;
                    }
                    self.header_line(&line)?;
                }
                State::Length(0) => self.state = State::Done,
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let data = self.take_body(remaining);
                    self.state = State::Length(remaining - data.len() as u64);
                    return Ok(Some(ResponseEvent::Body(data)));
                }
                State::UntilClose => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let data = self.buf.split().freeze();
                    return Ok(Some(ResponseEvent::Body(data)));
                }
                State::Chunked(chunk) => match self.next_chunked(chunk)? {
                    ChunkStep::Event(event) => return Ok(Some(event)),
                    ChunkStep::NeedMore => return Ok(None),
                    ChunkStep::Again => {}
                },
                State::Done => {
                    self.state = State::Finished;
                    return Ok(Some(ResponseEvent::Done));
                }
                State::Finished => return Ok(None),
            }
        }
    }

    /// Accepts the end of the connection as the end of the response where
    /// the framing allows it.
    pub fn finish_at_eof(&mut self) -> Result<(), HttpParseError> {
        match self.state {
            State::UntilClose | State::Done | State::Finished if self.buf.is_empty() => {
                self.state = State::Finished;
                Ok(())
            }
            _ => Err(HttpParseError::UnexpectedEof),
        }
    }

    fn header_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        let Some(head) = self.head.as_mut() else {
            return Err(HttpParseError::Header(line.to_owned()));
        };
        if line.starts_with([' ', '\t']) {
            // Obsolete line folding continues the previous header
            let Some(name) = &self.last_header else {
                return Err(HttpParseError::Header(line.to_owned()));
            };
            let previous = head
                .headers
                .get(name)
                .map(|v| v.as_bytes().to_vec())
                .unwrap_or_default();
            let mut joined = previous;
            joined.push(b' ');
            joined.extend_from_slice(line.trim().as_bytes());
            let value = HeaderValue::from_bytes(&joined)
                .map_err(|_| HttpParseError::Header(line.to_owned()))?;
            head.headers.insert(name.clone(), value);
            return Ok(());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpParseError::Header(line.to_owned()))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HttpParseError::Header(line.to_owned()))?;
        let value = value.trim();
        let joined = match head.headers.get(&name) {
            Some(existing) => {
                let mut joined = existing.as_bytes().to_vec();
                joined.extend_from_slice(b", ");
                joined.extend_from_slice(value.as_bytes());
                joined
            }
            None => value.as_bytes().to_vec(),
        };
        let value = HeaderValue::from_bytes(&joined)
            .map_err(|_| HttpParseError::Header(line.to_owned()))?;
        head.headers.insert(name.clone(), value);
        self.last_header = Some(name);
        Ok(())
    }

    fn end_of_head(&mut self) -> Result<Option<HttpResponse>, HttpParseError> {
        let Some(head) = self.head.take() else {
            return Err(HttpParseError::StatusLine(String::new()));
        };
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            self.state = State::StatusLine;
            return Ok(None);
        }
        self.reusable = head.keep_alive();
        let bodiless = self.head_only
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED;
        self.state = if bodiless {
            State::Done
        } else if head.is_chunked() {
            State::Chunked(Chunk::Size)
        } else if let Some(length) = head.content_length()? {
            State::Length(length)
        } else {
            self.reusable = false;
            State::UntilClose
        };
        Ok(Some(head))
    }

    fn next_chunked(&mut self, chunk: Chunk) -> Result<ChunkStep, HttpParseError> {
        match chunk {
            Chunk::Size => {
                let Some(line) = self.take_line()? else {
                    return Ok(ChunkStep::NeedMore);
                };
                let digits = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(digits, 16)
                    .map_err(|_| HttpParseError::ChunkSize(line.clone()))?;
                self.state = State::Chunked(if size == 0 {
                    Chunk::Trailer
                } else {
                    Chunk::Data(size)
                });
                Ok(ChunkStep::Again)
            }
            Chunk::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(ChunkStep::NeedMore);
                }
                let data = self.take_body(remaining);
                let left = remaining - data.len() as u64;
                self.state = State::Chunked(if left == 0 {
                    Chunk::DataEnd
                } else {
                    Chunk::Data(left)
                });
                Ok(ChunkStep::Event(ResponseEvent::Body(data)))
            }
            Chunk::DataEnd => {
                let Some(line) = self.take_line()? else {
                    return Ok(ChunkStep::NeedMore);
                };
                if !line.is_empty() {
                    return Err(HttpParseError::ChunkTerminator);
                }
                self.state = State::Chunked(Chunk::Size);
                Ok(ChunkStep::Again)
            }
            Chunk::Trailer => {
                let Some(line) = self.take_line()? else {
                    return Ok(ChunkStep::NeedMore);
                };
                if line.is_empty() {
                    self.state = State::Done;
                }
                Ok(ChunkStep::Again)
            }
        }
    }
}

enum ChunkStep {
    Event(ResponseEvent),
    NeedMore,
    Again,
}

fn parse_status_line(line: &str) -> Result<HttpResponse, HttpParseError> {
    let error = || HttpParseError::StatusLine(line.to_owned());
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(error()),
    };
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(error)?;
    Ok(HttpResponse {
        version,
        status,
        reason: parts.next().unwrap_or_default().trim().to_owned(),
        headers: HeaderMap::new(),
    })
}
