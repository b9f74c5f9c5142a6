use std::collections::VecDeque;
use std::sync::Arc;

use ferry_common::{
    Command, EncryptionDetails, FerryError, MessageType, Protocol, Reply, ServerPath,
};
use ferry_core::buffer_pool::BufferWaiter;
use ferry_core::control_socket::{ControlEvent, ProtocolSession, SessionAction};
use ferry_core::helper_process::{
    HelperEvent, HelperIo, HelperProcess, HelperProcessError, IoStep, SharedRegion,
};
use ferry_core::operation::{OpContext, Operation};
use tracing::debug;

use crate::event::{line_count, EventKind, Record, SftpEvent};
use crate::ops;

pub type SftpContext = OpContext<SftpSession>;
pub type SftpOp = Box<dyn Operation<SftpSession>>;

/// The helper process of one SFTP connection and what we learned from it.
pub struct SftpSession {
    helper: Option<HelperProcess>,
    events: VecDeque<SftpEvent>,
    pub connected: bool,
    pub current_path: ServerPath,
    pub encryption: EncryptionDetails,
    /// Text of the last keyboard-interactive preamble or instruction
    pub prompt: Option<String>,
    io: Option<HelperIo>,
    waiter: Option<BufferWaiter>,
    /// A command was sent and its `Done` has not been taken yet
    busy: bool,
}

impl Default for SftpSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SftpSession {
    pub fn new() -> Self {
        Self {
            helper: None,
            events: VecDeque::new(),
            connected: false,
            current_path: ServerPath::default(),
            encryption: EncryptionDetails::default(),
            prompt: None,
            io: None,
            waiter: None,
            busy: false,
        }
    }

    pub fn start(&mut self, program: &str, cx: &SftpContext) -> Result<(), HelperProcessError> {
        self.stop();
        let region = SharedRegion::for_pool(cx.pool())?;
        let helper = HelperProcess::spawn(
            program,
            std::iter::empty::<&str>(),
            line_count,
            Some(region),
            cx.events.clone(),
        )?;
        self.helper = Some(helper);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            debug!(helper = helper.id(), "Stopping SFTP helper");
            helper.kill();
        }
        self.events.clear();
        self.busy = false;
        self.io = None;
        self.connected = false;
        self.current_path = ServerPath::default();
        self.encryption = EncryptionDetails::default();
    }

    /// Writes a command line, logging it at `level`. The command runs until
    /// the helper reports `Done`.
    pub fn send_command(&mut self, cx: &SftpContext, level: MessageType, line: &str) -> bool {
        self.send_command_shown_as(cx, level, line, line)
    }

    /// Like [SftpSession::send_command], but logs `shown` instead of a line
    /// carrying a secret.
    pub fn send_command_shown_as(
        &mut self,
        cx: &SftpContext,
        level: MessageType,
        line: &str,
        shown: &str,
    ) -> bool {
        let Some(helper) = &self.helper else {
            return false;
        };
        cx.log.log(level, shown);
        cx.layers.clock.touch();
        self.busy = helper.send(line);
        self.busy
    }

    /// Answers a question of the helper, e.g. a host key prompt.
    pub fn send_answer(&self, cx: &SftpContext, line: &str) -> bool {
        let Some(helper) = &self.helper else {
            return false;
        };
        cx.log.log(MessageType::DebugVerbose, line);
        cx.layers.clock.touch();
        helper.send(line)
    }

    /// Writes an answer the log must not show.
    pub fn send_secret(&self, cx: &SftpContext, line: &str) -> bool {
        cx.layers.clock.touch();
        self.helper.as_ref().is_some_and(|h| h.send(line))
    }

    pub fn next_event(&mut self) -> Option<SftpEvent> {
        let event = self.events.pop_front()?;
        if matches!(event, SftpEvent::Done(_)) {
            self.busy = false;
        }
        Some(event)
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    pub fn start_io(&mut self, io: HelperIo) {
        self.io = Some(io);
    }

    pub fn finish_io(&mut self) -> Option<HelperIo> {
        self.io.take()
    }

    pub fn io(&self) -> Option<&HelperIo> {
        self.io.as_ref()
    }

    /// A buffer request is parked until the local side is ready.
    pub fn io_waiting(&self) -> bool {
        self.io.as_ref().is_some_and(HelperIo::is_waiting)
    }

    fn waiter(&mut self, cx: &SftpContext) -> BufferWaiter {
        self.waiter
            .get_or_insert_with(|| {
                let events = cx.events.clone();
                Arc::new(move || {
                    let _ = events.send(ControlEvent::BufferAvailable);
                })
            })
            .clone()
    }

    /// Runs `f` on the transfer's buffer exchange and forwards an answer to
    /// the helper.
    pub fn with_io<F>(&mut self, cx: &SftpContext, f: F) -> Result<IoStep, FerryError>
    where
        F: FnOnce(&mut HelperIo, &SharedRegion, &BufferWaiter) -> Result<IoStep, FerryError>,
    {
        let waiter = self.waiter(cx);
        let (Some(helper), Some(io)) = (&self.helper, &mut self.io) else {
            return Err(FerryError::NotConnected);
        };
        let Some(region) = helper.region() else {
            return Err(FerryError::Other("helper has no shared region".into()));
        };
        let step = f(io, region, &waiter)?;
        if let IoStep::Answer(line) = &step {
            cx.log.log(MessageType::DebugDebug, line.as_str());
            helper.send(line.as_str());
        }
        Ok(step)
    }

    fn on_record(&mut self, record: Record, cx: &mut SftpContext) -> Option<SessionAction> {
        match record {
            Record::Event(event) => {
                cx.layers.clock.touch();
                self.events.push_back(event);
                Some(SessionAction::ParseResponse)
            }
            Record::Log { kind, text } => {
                let level = match kind {
                    EventKind::Error => MessageType::Error,
                    EventKind::Status => MessageType::Status,
                    EventKind::Info => MessageType::DebugInfo,
                    _ => MessageType::DebugVerbose,
                };
                cx.log.log(level, text);
                None
            }
            Record::Traffic { received, amount } => {
                cx.layers.clock.touch();
                if received {
                    cx.engine.activity.record_received(amount);
                } else {
                    cx.engine.activity.record_sent(amount);
                }
                None
            }
            Record::Algorithm { kind, value } => {
                let encryption = &mut self.encryption;
                encryption.protocol = "SSH".into();
                match kind {
                    EventKind::KexAlgorithm => encryption.key_exchange = value,
                    EventKind::KexCurve | EventKind::KexHash => {
                        if !encryption.key_exchange.is_empty() {
                            encryption.key_exchange.push_str(" / ");
                        }
                        encryption.key_exchange.push_str(&value);
                    }
                    EventKind::CipherClientToServer | EventKind::CipherServerToClient => {
                        merge(&mut encryption.cipher, value)
                    }
                    EventKind::MacClientToServer | EventKind::MacServerToClient => {
                        merge(&mut encryption.mac, value)
                    }
                    _ => encryption.host_key = Some(value),
                }
                None
            }
            Record::Prompt(text) => {
                match &mut self.prompt {
                    Some(prompt) => {
                        prompt.push('\n');
                        prompt.push_str(&text);
                    }
                    None => self.prompt = Some(text),
                }
                None
            }
        }
    }
}

/// Joins the two directions of an algorithm, once if they agree.
fn merge(field: &mut String, value: String) {
    if field.is_empty() {
        *field = value;
    } else if *field != value {
        field.push_str(", ");
        field.push_str(&value);
    }
}

impl ProtocolSession for SftpSession {
    fn create_operation(&mut self, command: Command, _cx: &mut SftpContext) -> Result<SftpOp, Reply> {
        ops::create(command)
    }

    fn handle_event(&mut self, event: ControlEvent, cx: &mut SftpContext) -> Option<SessionAction> {
        match event {
            ControlEvent::Helper { process, event } => {
                if self.helper.as_ref().map(HelperProcess::id) != Some(process) {
                    return None;
                }
                match event {
                    HelperEvent::Record { kind, lines } => match Record::decode(kind, lines) {
                        Ok(record) => self.on_record(record, cx),
                        Err(error) => {
                            cx.log.error(format!("Helper protocol error: {error}"));
                            self.stop();
                            Some(SessionAction::Disconnected(Reply::CRITICAL_ERROR))
                        }
                    },
                    HelperEvent::Error(error) => {
                        cx.log.error(format!("Helper protocol error: {error}"));
                        self.stop();
                        Some(SessionAction::Disconnected(Reply::CRITICAL_ERROR))
                    }
                    HelperEvent::Exited => {
                        cx.log.error("SFTP helper exited");
                        self.stop();
                        Some(SessionAction::Disconnected(Reply::ERROR))
                    }
                }
            }
            ControlEvent::BufferAvailable => {
                self.io_waiting().then_some(SessionAction::ParseResponse)
            }
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self, _cx: &mut SftpContext) {
        self.stop();
    }
}

/// The protocol the factory creates sessions for.
pub(crate) fn supports(protocol: Protocol) -> bool {
    protocol == Protocol::Sftp
}
