//! Command handlers.
//!
//! The handler owns the engine and turns commands into events. It knows
//! nothing about sockets: the runtime loop decides who receives what.

use crate::error::ServerError;
use fsmrun_core::{Engine, RuntimeEvent, StatusSnapshot};
use fsmrun_protocol::{Command, Event, NamedValue, StatusReport, TimerReport, VariableReport};
use std::time::Instant;
use tracing::{debug, info};

pub use fsmrun_protocol::HELP_TEXT;

/// What the connection that sent a command should do after its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Close the requesting connection.
    Close,
    /// Stop the whole runtime.
    Shutdown,
}

/// Result of handling one command.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    /// Events for the requesting connection only.
    pub to_sender: Vec<Event>,
    /// Events for every connection.
    pub broadcast: Vec<Event>,
    pub action: Option<SessionAction>,
}

impl Reply {
    fn to_sender(event: Event) -> Self {
        Self {
            to_sender: vec![event],
            ..Default::default()
        }
    }

    fn broadcast(events: Vec<Event>) -> Self {
        Self {
            broadcast: events,
            ..Default::default()
        }
    }

    fn error(error: &ServerError) -> Self {
        Self::to_sender(Event::error(error.error_code(), error.to_string()))
    }
}

/// Command handler.
pub struct CommandHandler {
    engine: Engine,
}

impl CommandHandler {
    /// Creates a new command handler. The engine is started by [`start`](Self::start).
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Enters the initial state, returning the events to broadcast.
    pub fn start(&mut self, now: Instant) -> Vec<Event> {
        convert_events(self.engine.start(now))
    }

    /// Handles a command and returns the events it produced.
    ///
    /// Failures become an `error` event for the sender; they never end the
    /// session.
    pub fn handle(&mut self, command: &Command, now: Instant) -> Reply {
        debug!("Handling {} command", command.type_name());
        match self.dispatch(command, now) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Command {} failed: {}", command.type_name(), e);
                Reply::error(&e)
            }
        }
    }

    fn dispatch(&mut self, command: &Command, now: Instant) -> Result<Reply, ServerError> {
        match command {
            Command::Set { name, value } => self.handle_set(name, value, now),
            Command::Call { name } => self.handle_call(name, now),
            Command::Status => Ok(self.handle_status(now)),
            Command::Help => Ok(Reply::to_sender(Event::Log {
                message: HELP_TEXT.to_string(),
            })),
            Command::RequestModel => Ok(Reply::to_sender(Event::Fsm {
                model: self.engine.model_xml(),
            })),
            Command::Reset => Ok(self.handle_reset(now)),
            Command::Disconnect => Ok(Reply {
                to_sender: vec![Event::Disconnect {
                    message: "bye".to_string(),
                }],
                broadcast: Vec::new(),
                action: Some(SessionAction::Close),
            }),
            Command::Shutdown => {
                info!("Shutdown requested by controller");
                Ok(Reply {
                    action: Some(SessionAction::Shutdown),
                    ..Default::default()
                })
            }
            Command::Pong => Ok(Reply::default()),
        }
    }

    fn handle_set(&mut self, name: &str, value: &str, now: Instant) -> Result<Reply, ServerError> {
        let events = self.engine.set(name, value, now)?;
        Ok(Reply::broadcast(convert_events(events)))
    }

    fn handle_call(&mut self, name: &str, now: Instant) -> Result<Reply, ServerError> {
        let events = self.engine.call(name, now)?;
        Ok(Reply::broadcast(convert_events(events)))
    }

    fn handle_status(&self, now: Instant) -> Reply {
        Reply::to_sender(Event::Status(status_report(self.engine.status(now))))
    }

    fn handle_reset(&mut self, now: Instant) -> Reply {
        let mut events = vec![Event::Log {
            message: format!("machine {} reset", self.engine.definition().name),
        }];
        events.extend(convert_events(self.engine.reset(now)));
        Reply::broadcast(events)
    }

    /// Fires every timer due at `now`, returning the events to broadcast.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Event> {
        convert_events(self.engine.fire_due_timers(now))
    }

    /// Earliest armed timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.engine.next_deadline()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

fn convert_events(events: Vec<RuntimeEvent>) -> Vec<Event> {
    events.into_iter().map(runtime_event).collect()
}

/// Maps an engine side effect to its wire event.
pub fn runtime_event(event: RuntimeEvent) -> Event {
    match event {
        RuntimeEvent::StateChanged { from, to } => Event::StateChange { name: to, from },
        RuntimeEvent::InputChanged { name, value } => Event::Input { name, value },
        RuntimeEvent::OutputChanged { name, value } => Event::Output { name, value },
        RuntimeEvent::VariableChanged { name, value } => Event::Variable { name, value },
        RuntimeEvent::TimerStarted { from, to, ms } => Event::TimerStart { from, to, ms },
        RuntimeEvent::TimerExpired { from, to } => Event::TimerExpired { from, to },
        RuntimeEvent::Log { message } => Event::Log { message },
    }
}

/// Maps an engine snapshot to the `status` event body.
pub fn status_report(snapshot: StatusSnapshot) -> StatusReport {
    let named = |pairs: Vec<(String, String)>| {
        pairs
            .into_iter()
            .map(|(name, value)| NamedValue { name, value })
            .collect()
    };

    StatusReport {
        state: snapshot.state,
        inputs: named(snapshot.inputs),
        outputs: named(snapshot.outputs),
        variables: snapshot
            .variables
            .into_iter()
            .map(|v| VariableReport {
                name: v.name,
                var_type: v.type_tag,
                value: v.value,
            })
            .collect(),
        timers: snapshot
            .timers
            .into_iter()
            .map(|t| TimerReport {
                from: t.from,
                to: t.to,
                ms: t.remaining_ms,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmrun_core::MachineDefinition;
    use fsmrun_protocol::ErrorCode;
    use std::time::Duration;

    const TIMER_OFF: &str = include_str!("../../models/timer_off.xml");

    fn started_handler() -> (CommandHandler, Instant) {
        let definition = MachineDefinition::from_xml(TIMER_OFF).unwrap();
        let mut handler = CommandHandler::new(Engine::new(definition));
        let now = Instant::now();
        let events = handler.start(now);
        assert_eq!(
            events[0],
            Event::StateChange {
                name: "IDLE".to_string(),
                from: None
            }
        );
        (handler, now)
    }

    fn set(name: &str, value: &str) -> Command {
        Command::Set {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_set_broadcasts_events() {
        let (mut handler, now) = started_handler();
        let reply = handler.handle(&set("in", "1"), now);

        assert!(reply.to_sender.is_empty());
        assert!(reply.action.is_none());
        assert!(reply.broadcast.contains(&Event::StateChange {
            name: "ACTIVE".to_string(),
            from: Some("IDLE".to_string()),
        }));
        assert!(reply.broadcast.contains(&Event::Output {
            name: "out".to_string(),
            value: "1".to_string(),
        }));
    }

    #[test]
    fn test_errors_go_to_sender() {
        let (mut handler, now) = started_handler();

        let reply = handler.handle(&set("nope", "1"), now);
        assert!(reply.broadcast.is_empty());
        match &reply.to_sender[..] {
            [Event::Error { code, .. }] => assert_eq!(*code, ErrorCode::UnknownName),
            other => panic!("unexpected reply: {:?}", other),
        }

        let reply = handler.handle(
            &Command::Call {
                name: "timeout".to_string(),
            },
            now,
        );
        match &reply.to_sender[..] {
            [Event::Error { code, .. }] => assert_eq!(*code, ErrorCode::NotAnInput),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_status_reports_timer() {
        let (mut handler, now) = started_handler();
        handler.handle(&set("in", "1"), now);
        handler.handle(&set("in", "0"), now);

        let reply = handler.handle(&Command::Status, now + Duration::from_millis(1500));
        let report = match &reply.to_sender[..] {
            [Event::Status(report)] => report.clone(),
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(report.state, "TIMING");
        assert_eq!(
            report.inputs,
            vec![NamedValue {
                name: "in".to_string(),
                value: "0".to_string()
            }]
        );
        assert_eq!(report.variables[0].name, "timeout");
        assert_eq!(report.variables[0].value, "5000");
        assert_eq!(report.timers.len(), 1);
        assert_eq!(report.timers[0].to, "IDLE");
        assert_eq!(report.timers[0].ms, 3500);
    }

    #[test]
    fn test_on_timer() {
        let (mut handler, now) = started_handler();
        handler.handle(&set("in", "1"), now);
        handler.handle(&set("in", "0"), now);

        let deadline = handler.next_deadline().unwrap();
        assert_eq!(deadline, now + Duration::from_millis(5000));
        assert!(handler.on_timer(deadline - Duration::from_millis(1)).is_empty());

        let events = handler.on_timer(deadline);
        assert_eq!(
            events[0],
            Event::TimerExpired {
                from: "TIMING".to_string(),
                to: "IDLE".to_string()
            }
        );
        assert_eq!(handler.engine().current_state(), "IDLE");
        assert!(handler.next_deadline().is_none());
    }

    #[test]
    fn test_session_commands() {
        let (mut handler, now) = started_handler();

        let reply = handler.handle(&Command::Help, now);
        assert!(matches!(&reply.to_sender[..], [Event::Log { message }] if message.contains("reqFSM")));

        let reply = handler.handle(&Command::RequestModel, now);
        match &reply.to_sender[..] {
            [Event::Fsm { model }] => {
                let reparsed = MachineDefinition::from_xml(model).unwrap();
                assert_eq!(reparsed.name, "TOF5s");
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        assert_eq!(handler.handle(&Command::Pong, now), Reply::default());

        let reply = handler.handle(&Command::Disconnect, now);
        assert_eq!(reply.action, Some(SessionAction::Close));
        assert!(matches!(&reply.to_sender[..], [Event::Disconnect { .. }]));

        let reply = handler.handle(&Command::Shutdown, now);
        assert_eq!(reply.action, Some(SessionAction::Shutdown));
    }

    #[test]
    fn test_reset() {
        let (mut handler, now) = started_handler();
        handler.handle(&set("in", "1"), now);

        let reply = handler.handle(&Command::Reset, now);
        assert!(matches!(&reply.broadcast[0], Event::Log { message } if message.contains("reset")));
        assert!(reply.broadcast.contains(&Event::StateChange {
            name: "IDLE".to_string(),
            from: None,
        }));
        assert_eq!(handler.engine().current_state(), "IDLE");
    }
}
