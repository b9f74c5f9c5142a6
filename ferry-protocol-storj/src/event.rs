//! Records of the Storj helper.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Reply,
    Done,
    Error,
    Verbose,
    Info,
    Status,
    Recv,
    Send,
    ListEntry,
    IoOpen,
    IoNextBuf,
    IoFinalize,
}

const KINDS: [EventKind; 12] = [
    EventKind::Reply,
    EventKind::Done,
    EventKind::Error,
    EventKind::Verbose,
    EventKind::Info,
    EventKind::Status,
    EventKind::Recv,
    EventKind::Send,
    EventKind::ListEntry,
    EventKind::IoOpen,
    EventKind::IoNextBuf,
    EventKind::IoFinalize,
];

pub fn line_count(code: u8) -> Option<usize> {
    let kind = KINDS.get(usize::from(code))?;
    Some(match kind {
        EventKind::ListEntry => 3,
        _ => 1,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorjEvent {
    Reply(String),
    Done(Outcome),
    /// A bucket, a prefix ending in `/` or an object
    ListEntry {
        name: String,
        size: Option<u64>,
        time: Option<DateTime<Utc>>,
    },
    IoOpen { size: Option<u64> },
    IoNextBuf(usize),
    IoFinalize(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Event(StorjEvent),
    Log { kind: EventKind, text: String },
    Traffic { received: bool, amount: u64 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown event type {0}")]
    UnknownType(u8),
    #[error("malformed {kind:?} event: {line:?}")]
    Malformed { kind: EventKind, line: String },
}

fn number<T: std::str::FromStr>(kind: EventKind, line: &str) -> Result<T, EventError> {
    line.trim().parse().map_err(|_| EventError::Malformed {
        kind,
        line: line.to_owned(),
    })
}

fn optional<T: std::str::FromStr>(kind: EventKind, line: &str) -> Result<Option<T>, EventError> {
    match line.trim() {
        "" | "-1" => Ok(None),
        value => number(kind, value).map(Some),
    }
}

impl Record {
    pub fn decode(code: u8, mut lines: Vec<String>) -> Result<Self, EventError> {
        let kind = *KINDS
            .get(usize::from(code))
            .ok_or(EventError::UnknownType(code))?;
        if Some(lines.len()) != line_count(code) {
            return Err(EventError::Malformed {
                kind,
                line: lines.join("\n"),
            });
        }
        let first = lines.remove(0);
        Ok(match kind {
            EventKind::Reply => Record::Event(StorjEvent::Reply(first)),
            EventKind::Done => Record::Event(StorjEvent::Done(match first.trim() {
                "1" => Outcome::Ok,
                "0" => Outcome::Error,
                "2" => Outcome::Critical,
                _ => return Err(EventError::Malformed { kind, line: first }),
            })),
            EventKind::Error | EventKind::Verbose | EventKind::Info | EventKind::Status => {
                Record::Log { kind, text: first }
            }
            EventKind::Recv | EventKind::Send => Record::Traffic {
                received: kind == EventKind::Recv,
                amount: number(kind, &first)?,
            },
            EventKind::ListEntry => {
                let secs: Option<i64> = optional(kind, &lines[1])?;
                Record::Event(StorjEvent::ListEntry {
                    name: first,
                    size: optional(kind, &lines[0])?,
                    time: secs.and_then(|s| DateTime::from_timestamp(s, 0)),
                })
            }
            EventKind::IoOpen => Record::Event(StorjEvent::IoOpen {
                size: optional(kind, &first)?,
            }),
            EventKind::IoNextBuf => Record::Event(StorjEvent::IoNextBuf(number(kind, &first)?)),
            EventKind::IoFinalize => Record::Event(StorjEvent::IoFinalize(number(kind, &first)?)),
        })
    }
}

/// Wraps an argument in double quotes, doubling embedded ones.
pub fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}
