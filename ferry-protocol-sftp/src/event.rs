//! Records the SFTP helper writes to its standard output.

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
    AskHostKey,
    AskHostKeyChanged,
    AskPassword,
    RequestPreamble,
    RequestInstruction,
    KexAlgorithm,
    KexHash,
    KexCurve,
    CipherClientToServer,
    CipherServerToClient,
    MacClientToServer,
    MacServerToClient,
    HostKey,
    IoOpen,
    IoNextBuf,
    IoFinalize,
}

const KINDS: [EventKind; 25] = [
    EventKind::Reply,
    EventKind::Done,
    EventKind::Error,
    EventKind::Verbose,
    EventKind::Info,
    EventKind::Status,
    EventKind::Recv,
    EventKind::Send,
    EventKind::ListEntry,
    EventKind::AskHostKey,
    EventKind::AskHostKeyChanged,
    EventKind::AskPassword,
    EventKind::RequestPreamble,
    EventKind::RequestInstruction,
    EventKind::KexAlgorithm,
    EventKind::KexHash,
    EventKind::KexCurve,
    EventKind::CipherClientToServer,
    EventKind::CipherServerToClient,
    EventKind::MacClientToServer,
    EventKind::MacServerToClient,
    EventKind::HostKey,
    EventKind::IoOpen,
    EventKind::IoNextBuf,
    EventKind::IoFinalize,
];

impl EventKind {
    pub fn from_code(code: u8) -> Option<Self> {
        KINDS.get(usize::from(code)).copied()
    }

    /// Lines following the type line.
    pub fn lines(self) -> usize {
        match self {
            EventKind::ListEntry => 3,
            EventKind::AskHostKey | EventKind::AskHostKeyChanged => 2,
            _ => 1,
        }
    }
}

/// Line table for [ferry_core::helper_process::EventParser].
pub fn line_count(code: u8) -> Option<usize> {
    EventKind::from_code(code).map(EventKind::lines)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
    Critical,
}

/// Records an operation has to look at. Informational records are handled
/// by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpEvent {
    Reply(String),
    Done(Outcome),
    ListEntry {
        /// `ls -l` style line
        line: String,
        time: Option<DateTime<Utc>>,
        name: String,
    },
    AskHostKey {
        host: String,
        port: u16,
        fingerprint: String,
        changed: bool,
    },
    AskPassword(String),
    IoOpen { size: Option<u64> },
    IoNextBuf(usize),
    IoFinalize(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Event(SftpEvent),
    Log { kind: EventKind, text: String },
    /// Bytes moved over the network, received when `true`
    Traffic { received: bool, amount: u64 },
    /// One piece of the negotiated encryption
    Algorithm { kind: EventKind, value: String },
    /// Text to show along with the next password prompt
    Prompt(String),
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

impl Record {
    pub fn decode(code: u8, mut lines: Vec<String>) -> Result<Self, EventError> {
        let kind = EventKind::from_code(code).ok_or(EventError::UnknownType(code))?;
        if lines.len() != kind.lines() {
            return Err(EventError::Malformed {
                kind,
                line: lines.join("\n"),
            });
        }
        let first = lines.remove(0);
        Ok(match kind {
            EventKind::Reply => Record::Event(SftpEvent::Reply(first)),
            EventKind::Done => Record::Event(SftpEvent::Done(match first.trim() {
                "1" => Outcome::Ok,
                "0" => Outcome::Error,
                "2" => Outcome::Critical,
                _ => {
                    return Err(EventError::Malformed { kind, line: first });
                }
            })),
            EventKind::Error | EventKind::Verbose | EventKind::Info | EventKind::Status => {
                Record::Log { kind, text: first }
            }
            EventKind::Recv | EventKind::Send => Record::Traffic {
                received: kind == EventKind::Recv,
                amount: number(kind, &first)?,
            },
            EventKind::ListEntry => {
                let time = match lines[0].trim() {
                    "" => None,
                    secs => DateTime::from_timestamp(number(kind, secs)?, 0),
                };
                Record::Event(SftpEvent::ListEntry {
                    line: first,
                    time,
                    name: lines.remove(1),
                })
            }
            EventKind::AskHostKey | EventKind::AskHostKeyChanged => {
                let (host, port) = first
                    .rsplit_once(' ')
                    .ok_or_else(|| EventError::Malformed {
                        kind,
                        line: first.clone(),
                    })?;
                Record::Event(SftpEvent::AskHostKey {
                    host: host.to_owned(),
                    port: number(kind, port)?,
                    fingerprint: lines.remove(0),
                    changed: kind == EventKind::AskHostKeyChanged,
                })
            }
            EventKind::AskPassword => Record::Event(SftpEvent::AskPassword(first)),
            EventKind::RequestPreamble | EventKind::RequestInstruction => Record::Prompt(first),
            EventKind::KexAlgorithm
            | EventKind::KexHash
            | EventKind::KexCurve
            | EventKind::CipherClientToServer
            | EventKind::CipherServerToClient
            | EventKind::MacClientToServer
            | EventKind::MacServerToClient
            | EventKind::HostKey => Record::Algorithm { kind, value: first },
            EventKind::IoOpen => Record::Event(SftpEvent::IoOpen {
                size: match first.trim() {
                    "" => None,
                    size => Some(number(kind, size)?),
                },
            }),
            EventKind::IoNextBuf => Record::Event(SftpEvent::IoNextBuf(number(kind, &first)?)),
            EventKind::IoFinalize => Record::Event(SftpEvent::IoFinalize(number(kind, &first)?)),
        })
    }
}

/// Wraps an argument in double quotes, doubling embedded ones.
pub fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(l: &[&str]) -> Vec<String> {
        l.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn table_matches_kinds() {
        assert_eq!(line_count(0), Some(1));
        assert_eq!(line_count(8), Some(3));
        assert_eq!(line_count(9), Some(2));
        assert_eq!(line_count(24), Some(1));
        assert_eq!(line_count(25), None);
    }

    #[test]
    fn list_entries() {
        let record = Record::decode(
            8,
            lines(&["-rw-r--r-- 1 u g 5 Jan 1 2024 a b", "1704067200", "a b"]),
        )
        .unwrap();
        let Record::Event(SftpEvent::ListEntry { time, name, .. }) = record else {
            panic!("unexpected {record:?}");
        };
        assert_eq!(name, "a b");
        assert_eq!(time.map(|t| t.timestamp()), Some(1704067200));
    }

    #[test]
    fn host_key_prompts() {
        assert_eq!(
            Record::decode(10, lines(&["example.com 2222", "SHA256:abc"])).unwrap(),
            Record::Event(SftpEvent::AskHostKey {
                host: "example.com".into(),
                port: 2222,
                fingerprint: "SHA256:abc".into(),
                changed: true,
            })
        );
    }

    #[test]
    fn done_and_io() {
        assert_eq!(
            Record::decode(1, lines(&["2"])).unwrap(),
            Record::Event(SftpEvent::Done(Outcome::Critical))
        );
        assert_eq!(
            Record::decode(22, lines(&[""])).unwrap(),
            Record::Event(SftpEvent::IoOpen { size: None })
        );
        assert!(matches!(
            Record::decode(23, lines(&["x"])),
            Err(EventError::Malformed {
                kind: EventKind::IoNextBuf,
                ..
            })
        ));
        assert_eq!(Record::decode(40, vec![]), Err(EventError::UnknownType(40)));
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("a \"b\""), "\"a \"\"b\"\"\"");
    }
}
