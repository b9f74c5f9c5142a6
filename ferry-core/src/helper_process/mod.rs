//! Helper subprocesses that implement a protocol on our behalf and talk
//! to us in text lines, with bulk data passed through a [SharedRegion].

use std::ffi::OsStr;
use std::os::fd::AsRawFd;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::control_socket::ControlEvent;

mod io;
mod parser;
mod shm;

pub use io::{HelperIo, IoStep};
pub use parser::{EventParser, LineTable};
pub use shm::{format_range, parse_range, SharedRegion};

/// Environment variables telling the helper where the shared region is.
pub const SHM_FD_ENV: &str = "FERRY_SHM_FD";
pub const SHM_SIZE_ENV: &str = "FERRY_SHM_SIZE";

#[derive(Error, Debug)]
pub enum HelperProcessError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown event type {0:?}")]
    UnknownEvent(char),
    #[error("malformed helper output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperEvent {
    Record { kind: u8, lines: Vec<String> },
    /// The helper wrote something we cannot parse and was abandoned
    Error(String),
    /// Standard output closed
    Exited,
}

pub struct HelperProcess {
    id: u64,
    child: Child,
    stdin: mpsc::UnboundedSender<String>,
    region: Option<SharedRegion>,
    tasks: Vec<JoinHandle<()>>,
}

impl HelperProcess {
    pub fn spawn<I, A>(
        program: &str,
        args: I,
        table: LineTable,
        region: Option<SharedRegion>,
        events: mpsc::UnboundedSender<ControlEvent>,
    ) -> Result<Self, HelperProcessError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let id = crate::connection::next_connection_id();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child_fd = region.as_ref().map(|r| r.inheritable_fd()).transpose()?;
        if let (Some(region), Some(fd)) = (&region, &child_fd) {
            command
                .env(SHM_FD_ENV, fd.as_raw_fd().to_string())
                .env(SHM_SIZE_ENV, region.size().to_string());
        }
        let mut child = command.spawn().map_err(|source| HelperProcessError::Spawn {
            program: program.to_owned(),
            source,
        })?;
        drop(child_fd);
        debug!(helper = id, %program, pid = ?child.id(), "Helper started");

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let mut tasks = vec![];
        if let Some(mut stdin) = child.stdin.take() {
            tasks.push(tokio::spawn(async move {
                while let Some(mut line) = stdin_rx.recv().await {
                    line.push('\n');
                    let result = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.flush().await
                    }
                    .await;
                    if let Err(error) = result {
                        debug!(helper = id, %error, "Helper stdin closed");
                        break;
                    }
                }
            }));
        }

        if let Some(stdout) = child.stdout.take() {
            tasks.push(tokio::spawn(async move {
                let emit = |event| {
                    let _ = events.send(ControlEvent::Helper { process: id, event });
                };
                let mut parser = EventParser::new(table);
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            match parser.feed(line.trim_end_matches('\r')) {
                                Ok(Some((kind, lines))) => {
                                    emit(HelperEvent::Record { kind, lines })
                                }
                                Ok(None) => {}
                                Err(error) => {
                                    emit(HelperEvent::Error(error.to_string()));
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            emit(HelperEvent::Error(error.to_string()));
                            return;
                        }
                    }
                }
                emit(HelperEvent::Exited);
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(helper = id, "{line}");
                }
            }));
        }

        Ok(Self {
            id,
            child,
            stdin: stdin_tx,
            region,
            tasks,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&self, line: impl Into<String>) -> bool {
        self.stdin.send(line.into()).is_ok()
    }

    pub fn region(&self) -> Option<&SharedRegion> {
        self.region.as_ref()
    }

    pub fn kill(&mut self) {
        if let Err(error) = self.child.start_kill() {
            debug!(helper = self.id, %error, "Helper already gone");
        }
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        self.kill();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(kind: u8) -> Option<usize> {
        match kind {
            0 => Some(1),
            1 => Some(2),
            _ => None,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ControlEvent>) -> HelperEvent {
        match rx.recv().await {
            Some(ControlEvent::Helper { event, .. }) => event,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn records_from_a_shell_helper() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = r#"read cmd; printf '0\n%s\n1\na\nb\n' "$cmd""#;
        let helper = HelperProcess::spawn("sh", ["-c", script], table, None, tx).unwrap();
        assert!(helper.send("hello"));

        assert_eq!(
            next(&mut rx).await,
            HelperEvent::Record {
                kind: 0,
                lines: vec!["hello".into()]
            }
        );
        assert_eq!(
            next(&mut rx).await,
            HelperEvent::Record {
                kind: 1,
                lines: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(next(&mut rx).await, HelperEvent::Exited);
    }

    #[tokio::test]
    async fn garbage_is_an_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _helper =
            HelperProcess::spawn("sh", ["-c", "echo 9"], table, None, tx).unwrap();
        assert!(matches!(next(&mut rx).await, HelperEvent::Error(_)));
    }

    #[tokio::test]
    async fn region_is_announced_to_the_child() {
        let pool = crate::buffer_pool::BufferPool::new(2, 8);
        let region = SharedRegion::for_pool(&pool).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = format!(r#"printf '0\n%s\n' "${SHM_SIZE_ENV}""#);
        let helper =
            HelperProcess::spawn("sh", ["-c", script.as_str()], table, Some(region), tx).unwrap();
        assert_eq!(
            next(&mut rx).await,
            HelperEvent::Record {
                kind: 0,
                lines: vec!["16".into()]
            }
        );
        assert_eq!(helper.region().map(|r| r.size()), Some(16));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = HelperProcess::spawn(
            "/nonexistent/ferry-helper",
            std::iter::empty::<&str>(),
            table,
            None,
            tx,
        );
        assert!(matches!(result, Err(HelperProcessError::Spawn { .. })));
    }
}
