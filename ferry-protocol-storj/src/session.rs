use std::collections::VecDeque;
use std::sync::Arc;

use ferry_common::{Command, FerryError, MessageType, Protocol, Reply};
use ferry_core::buffer_pool::BufferWaiter;
use ferry_core::control_socket::{ControlEvent, ProtocolSession, SessionAction};
use ferry_core::helper_process::{
    HelperEvent, HelperIo, HelperProcess, HelperProcessError, IoStep, SharedRegion,
};
use ferry_core::operation::{OpContext, Operation};
use tracing::debug;

use crate::event::{line_count, EventKind, Record, StorjEvent};
use crate::ops;

pub type StorjContext = OpContext<StorjSession>;
pub type StorjOp = Box<dyn Operation<StorjSession>>;

/// The helper process of one Storj connection.
#[derive(Default)]
pub struct StorjSession {
    helper: Option<HelperProcess>,
    events: VecDeque<StorjEvent>,
    pub connected: bool,
    io: Option<HelperIo>,
    waiter: Option<BufferWaiter>,
    busy: bool,
}

impl StorjSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, program: &str, cx: &StorjContext) -> Result<(), HelperProcessError> {
        self.stop();
        let region = SharedRegion::for_pool(cx.pool())?;
        self.helper = Some(HelperProcess::spawn(
            program,
            std::iter::empty::<&str>(),
            line_count,
            Some(region),
            cx.events.clone(),
        )?);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut helper) = self.helper.take() {
            debug!(helper = helper.id(), "Stopping Storj helper");
            helper.kill();
        }
        self.events.clear();
        self.busy = false;
        self.io = None;
        self.connected = false;
    }

    /// Sends a command, logging `shown` in its place.
    pub fn send_command(
        &mut self,
        cx: &StorjContext,
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

    pub fn next_event(&mut self) -> Option<StorjEvent> {
        let event = self.events.pop_front()?;
        if matches!(event, StorjEvent::Done(_)) {
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

    pub fn io_waiting(&self) -> bool {
        self.io.as_ref().is_some_and(HelperIo::is_waiting)
    }

    pub fn with_io<F>(&mut self, cx: &StorjContext, f: F) -> Result<IoStep, FerryError>
    where
        F: FnOnce(&mut HelperIo, &SharedRegion, &BufferWaiter) -> Result<IoStep, FerryError>,
    {
        let events = cx.events.clone();
        let waiter = self
            .waiter
            .get_or_insert_with(|| {
                Arc::new(move || {
                    let _ = events.send(ControlEvent::BufferAvailable);
                })
            })
            .clone();
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

    fn on_record(&mut self, record: Record, cx: &mut StorjContext) -> Option<SessionAction> {
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
        }
    }

    fn abandon(&mut self, cx: &StorjContext, error: impl std::fmt::Display) -> Option<SessionAction> {
        cx.log.error(format!("Helper protocol error: {error}"));
        self.stop();
        Some(SessionAction::Disconnected(Reply::CRITICAL_ERROR))
    }
}

impl ProtocolSession for StorjSession {
    fn create_operation(
        &mut self,
        command: Command,
        _cx: &mut StorjContext,
    ) -> Result<StorjOp, Reply> {
        ops::create(command)
    }

    fn handle_event(&mut self, event: ControlEvent, cx: &mut StorjContext) -> Option<SessionAction> {
        match event {
            ControlEvent::Helper { process, event } => {
                if self.helper.as_ref().map(HelperProcess::id) != Some(process) {
                    return None;
                }
                match event {
                    HelperEvent::Record { kind, lines } => match Record::decode(kind, lines) {
                        Ok(record) => self.on_record(record, cx),
                        Err(error) => self.abandon(cx, error),
                    },
                    HelperEvent::Error(error) => self.abandon(cx, error),
                    HelperEvent::Exited => {
                        cx.log.error("Storj helper exited");
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

    fn close(&mut self, _cx: &mut StorjContext) {
        self.stop();
    }
}

pub(crate) fn supports(protocol: Protocol) -> bool {
    protocol == Protocol::Storj
}
