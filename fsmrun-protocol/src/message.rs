//! Command and event messages.
//!
//! Every message is one XML document. Controllers send `command` documents:
//!
//! ```xml
//! <command type="set"><name>in</name><value>1</value></command>
//! ```
//!
//! and the runtime answers or broadcasts `event` documents:
//!
//! ```xml
//! <event type="stateChange"><name>ACTIVE</name><from>IDLE</from></event>
//! ```

use crate::error::{ErrorCode, ProtocolError};
use crate::xml::Element;
use serde::Serialize;

/// A controller request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Writes an input or variable value.
    Set { name: String, value: String },
    /// Pulses an input, observable through `called(name)`.
    Call { name: String },
    /// Requests a snapshot of the running session.
    Status,
    /// Requests usage text.
    Help,
    /// Requests the model document.
    RequestModel,
    /// Closes the requesting connection.
    Disconnect,
    /// Stops the runtime.
    Shutdown,
    /// Answers a server `ping`.
    Pong,
    /// Recreates the session from the model's initial values.
    Reset,
}

impl Command {
    /// Returns the value of the `type` attribute for this command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Call { .. } => "call",
            Command::Status => "status",
            Command::Help => "help",
            Command::RequestModel => "reqFSM",
            Command::Disconnect => "disconnect",
            Command::Shutdown => "shutdown",
            Command::Pong => "pong",
            Command::Reset => "reset",
        }
    }

    pub fn to_element(&self) -> Element {
        let element = Element::new("command").with_attr("type", self.type_name());
        match self {
            Command::Set { name, value } => element
                .with_child(Element::leaf("name", name))
                .with_child(Element::leaf("value", value)),
            Command::Call { name } => element.with_child(Element::leaf("name", name)),
            _ => element,
        }
    }

    /// Serializes the command as a single line of XML (without the newline).
    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    /// Interprets a parsed document as a command.
    pub fn from_element(element: &Element) -> Result<Self, ProtocolError> {
        if element.name != "command" {
            return Err(ProtocolError::UnexpectedRoot {
                expected: "command",
                actual: element.name.clone(),
            });
        }

        let kind = element
            .attr("type")
            .ok_or_else(|| ProtocolError::MissingAttribute {
                element: "command".to_string(),
                attr: "type",
            })?;

        match kind {
            "set" => Ok(Command::Set {
                name: required_name(element)?,
                value: element
                    .child_text("value")
                    .ok_or(ProtocolError::MissingElement("value"))?
                    .to_string(),
            }),
            "call" => Ok(Command::Call {
                name: required_name(element)?,
            }),
            "status" => Ok(Command::Status),
            "help" => Ok(Command::Help),
            "reqFSM" => Ok(Command::RequestModel),
            "disconnect" => Ok(Command::Disconnect),
            "shutdown" => Ok(Command::Shutdown),
            "pong" => Ok(Command::Pong),
            "reset" => Ok(Command::Reset),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Parses one line of text as a command.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Self::from_element(&Element::parse(line)?)
    }
}

fn required_name(element: &Element) -> Result<String, ProtocolError> {
    let name = element
        .child_text("name")
        .ok_or(ProtocolError::MissingElement("name"))?
        .trim();
    if name.is_empty() {
        return Err(ProtocolError::InvalidValue {
            field: "name",
            value: String::new(),
        });
    }
    Ok(name.to_string())
}

/// A name/value pair reported in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedValue {
    pub name: String,
    pub value: String,
}

/// A variable reported in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableReport {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub value: String,
}

/// An armed timer reported in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerReport {
    pub from: String,
    pub to: String,
    /// Remaining milliseconds until expiry.
    pub ms: u64,
}

/// Full snapshot of a running session, sent in reply to `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub inputs: Vec<NamedValue>,
    pub outputs: Vec<NamedValue>,
    pub variables: Vec<VariableReport>,
    pub timers: Vec<TimerReport>,
}

impl StatusReport {
    pub fn to_element(&self) -> Element {
        let inputs = self
            .inputs
            .iter()
            .map(|i| Element::leaf("input", &i.value).with_attr("name", &i.name));
        let outputs = self
            .outputs
            .iter()
            .map(|o| Element::leaf("output", &o.value).with_attr("name", &o.name));
        let variables = self.variables.iter().map(|v| {
            Element::leaf("var", &v.value)
                .with_attr("name", &v.name)
                .with_attr("type", &v.var_type)
        });
        let timers = self.timers.iter().map(|t| {
            Element::new("timer")
                .with_child(Element::leaf("from", &t.from))
                .with_child(Element::leaf("to", &t.to))
                .with_child(Element::leaf("ms", t.ms.to_string()))
        });

        Element::new("status")
            .with_child(Element::leaf("state", &self.state))
            .with_child(Element::new("inputs").with_children(inputs))
            .with_child(Element::new("outputs").with_children(outputs))
            .with_child(Element::new("variables").with_children(variables))
            .with_child(Element::new("timers").with_children(timers))
    }

    pub fn from_element(element: &Element) -> Result<Self, ProtocolError> {
        let state = element
            .child_text("state")
            .ok_or(ProtocolError::MissingElement("state"))?
            .to_string();

        let named = |section: &str, item: &'static str| -> Result<Vec<NamedValue>, ProtocolError> {
            let Some(list) = element.child(section) else {
                return Ok(Vec::new());
            };
            list.children_named(item)
                .map(|el| -> Result<NamedValue, ProtocolError> {
                    Ok(NamedValue {
                        name: named_attr(el, "name")?,
                        value: el.text.clone(),
                    })
                })
                .collect()
        };

        let variables = match element.child("variables") {
            Some(list) => list
                .children_named("var")
                .map(|el| -> Result<VariableReport, ProtocolError> {
                    Ok(VariableReport {
                        name: named_attr(el, "name")?,
                        var_type: el.attr("type").unwrap_or_default().to_string(),
                        value: el.text.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let timers = match element.child("timers") {
            Some(list) => list
                .children_named("timer")
                .map(|el| -> Result<TimerReport, ProtocolError> {
                    Ok(TimerReport {
                        from: text_of(el, "from")?,
                        to: text_of(el, "to")?,
                        ms: parse_ms(el)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            state,
            inputs: named("inputs", "input")?,
            outputs: named("outputs", "output")?,
            variables,
            timers,
        })
    }
}

fn named_attr(element: &Element, attr: &'static str) -> Result<String, ProtocolError> {
    element
        .attr(attr)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::MissingAttribute {
            element: element.name.clone(),
            attr,
        })
}

fn text_of(element: &Element, child: &'static str) -> Result<String, ProtocolError> {
    element
        .child_text(child)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingElement(child))
}

fn parse_ms(element: &Element) -> Result<u64, ProtocolError> {
    let raw = text_of(element, "ms")?;
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidValue {
            field: "ms",
            value: raw,
        })
}

/// A runtime notification.
///
/// Most events are broadcast to every connected controller; `status`, `fsm`,
/// `error` and `disconnect` go only to the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    StateChange {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Output {
        name: String,
        value: String,
    },
    Input {
        name: String,
        value: String,
    },
    Variable {
        name: String,
        value: String,
    },
    TimerStart {
        from: String,
        to: String,
        ms: u64,
    },
    TimerExpired {
        from: String,
        to: String,
    },
    Fsm {
        model: String,
    },
    Log {
        message: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Status(StatusReport),
    Ping,
    Shutdown {
        message: String,
    },
    Disconnect {
        message: String,
    },
}

impl Event {
    /// Returns the value of the `type` attribute for this event.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::StateChange { .. } => "stateChange",
            Event::Output { .. } => "output",
            Event::Input { .. } => "input",
            Event::Variable { .. } => "variable",
            Event::TimerStart { .. } => "timerStart",
            Event::TimerExpired { .. } => "timerExpired",
            Event::Fsm { .. } => "fsm",
            Event::Log { .. } => "log",
            Event::Error { .. } => "error",
            Event::Status(_) => "status",
            Event::Ping => "ping",
            Event::Shutdown { .. } => "shutdown",
            Event::Disconnect { .. } => "disconnect",
        }
    }

    /// Builds an `error` event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Event::Error {
            code,
            message: message.into(),
        }
    }

    pub fn to_element(&self) -> Element {
        let element = Element::new("event").with_attr("type", self.type_name());
        match self {
            Event::StateChange { name, from } => {
                let element = element.with_child(Element::leaf("name", name));
                match from {
                    Some(from) => element.with_child(Element::leaf("from", from)),
                    None => element,
                }
            }
            Event::Output { name, value }
            | Event::Input { name, value }
            | Event::Variable { name, value } => element
                .with_child(Element::leaf("name", name))
                .with_child(Element::leaf("value", value)),
            Event::TimerStart { from, to, ms } => element
                .with_child(Element::leaf("from", from))
                .with_child(Element::leaf("to", to))
                .with_child(Element::leaf("ms", ms.to_string())),
            Event::TimerExpired { from, to } => element
                .with_child(Element::leaf("from", from))
                .with_child(Element::leaf("to", to)),
            Event::Fsm { model } => element.with_child(Element::leaf("model", model)),
            Event::Log { message } | Event::Shutdown { message } | Event::Disconnect { message } => {
                element.with_child(Element::leaf("message", message))
            }
            Event::Error { code, message } => element
                .with_child(Element::leaf("code", code.as_str()))
                .with_child(Element::leaf("message", message)),
            Event::Status(report) => element.with_child(report.to_element()),
            Event::Ping => element,
        }
    }

    /// Serializes the event as a single line of XML (without the newline).
    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    /// Interprets a parsed document as an event.
    pub fn from_element(element: &Element) -> Result<Self, ProtocolError> {
        if element.name != "event" {
            return Err(ProtocolError::UnexpectedRoot {
                expected: "event",
                actual: element.name.clone(),
            });
        }

        let kind = element
            .attr("type")
            .ok_or_else(|| ProtocolError::MissingAttribute {
                element: "event".to_string(),
                attr: "type",
            })?;

        let event = match kind {
            "stateChange" => Event::StateChange {
                name: text_of(element, "name")?,
                from: element.child_text("from").map(str::to_string),
            },
            "output" => Event::Output {
                name: text_of(element, "name")?,
                value: text_of(element, "value")?,
            },
            "input" => Event::Input {
                name: text_of(element, "name")?,
                value: text_of(element, "value")?,
            },
            "variable" => Event::Variable {
                name: text_of(element, "name")?,
                value: text_of(element, "value")?,
            },
            "timerStart" => Event::TimerStart {
                from: text_of(element, "from")?,
                to: text_of(element, "to")?,
                ms: parse_ms(element)?,
            },
            "timerExpired" => Event::TimerExpired {
                from: text_of(element, "from")?,
                to: text_of(element, "to")?,
            },
            "fsm" => Event::Fsm {
                model: text_of(element, "model")?,
            },
            "log" => Event::Log {
                message: text_of(element, "message")?,
            },
            "error" => Event::Error {
                code: text_of(element, "code")?.trim().parse()?,
                message: text_of(element, "message")?,
            },
            "status" => Event::Status(StatusReport::from_element(
                element
                    .child("status")
                    .ok_or(ProtocolError::MissingElement("status"))?,
            )?),
            "ping" => Event::Ping,
            "shutdown" => Event::Shutdown {
                message: element.child_text("message").unwrap_or_default().to_string(),
            },
            "disconnect" => Event::Disconnect {
                message: element.child_text("message").unwrap_or_default().to_string(),
            },
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };

        Ok(event)
    }

    /// Parses one line of text as an event.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Self::from_element(&Element::parse(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd = Command::Set {
            name: "in".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(
            cmd.to_xml(),
            r#"<command type="set"><name>in</name><value>1</value></command>"#
        );
        assert_eq!(Command::parse(&cmd.to_xml()).unwrap(), cmd);

        assert_eq!(
            Command::parse(r#"<command type="status"></command>"#).unwrap(),
            Command::Status
        );
        assert_eq!(
            Command::parse(r#"<command type="reqFSM"/>"#).unwrap(),
            Command::RequestModel
        );
    }

    #[test]
    fn test_command_errors() {
        let err = Command::parse(r#"<command type="fly"/>"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(ref t) if t == "fly"));
        assert_eq!(err.error_code(), ErrorCode::UnknownCommand);

        let err = Command::parse("<command/>").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingAttribute { .. }));

        let err = Command::parse(r#"<event type="ping"/>"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedRoot { .. }));

        let err = Command::parse(r#"<command type="set"><name>in</name></command>"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingElement("value")));

        let err = Command::parse(r#"<command type="call"><name> </name></command>"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { field: "name", .. }));

        assert!(Command::parse("<command").unwrap_err().is_malformed());
    }

    #[test]
    fn test_state_change_event() {
        let event = Event::StateChange {
            name: "ACTIVE".to_string(),
            from: Some("IDLE".to_string()),
        };
        let xml = event.to_xml();
        assert_eq!(
            xml,
            r#"<event type="stateChange"><name>ACTIVE</name><from>IDLE</from></event>"#
        );
        assert_eq!(Event::parse(&xml).unwrap(), event);
    }

    #[test]
    fn test_fsm_event_carries_escaped_model() {
        let model = "<automaton name=\"a\">\n<states/>\n</automaton>";
        let event = Event::Fsm {
            model: model.to_string(),
        };
        let xml = event.to_xml();
        assert!(!xml.contains('\n'));
        match Event::parse(&xml).unwrap() {
            Event::Fsm { model: parsed } => assert_eq!(parsed, model),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_status_event() {
        let report = StatusReport {
            state: "TIMING".to_string(),
            inputs: vec![NamedValue {
                name: "in".to_string(),
                value: "0".to_string(),
            }],
            outputs: vec![NamedValue {
                name: "out".to_string(),
                value: "1".to_string(),
            }],
            variables: vec![VariableReport {
                name: "timeout".to_string(),
                var_type: "int".to_string(),
                value: "5000".to_string(),
            }],
            timers: vec![TimerReport {
                from: "TIMING".to_string(),
                to: "IDLE".to_string(),
                ms: 4200,
            }],
        };
        let xml = Event::Status(report.clone()).to_xml();
        assert!(xml.contains(r#"<var name="timeout" type="int">5000</var>"#));
        assert!(xml.contains("<timer><from>TIMING</from><to>IDLE</to><ms>4200</ms></timer>"));

        match Event::parse(&xml).unwrap() {
            Event::Status(parsed) => assert_eq!(parsed, report),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_error_event() {
        let event = Event::error(ErrorCode::UnknownName, "no input or variable named 'x'");
        let xml = event.to_xml();
        assert!(xml.contains("<code>UNKNOWN_NAME</code>"));
        assert_eq!(Event::parse(&xml).unwrap(), event);
    }

    #[test]
    fn test_unknown_event() {
        let err = Event::parse(r#"<event type="teleport"/>"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(_)));
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::TimerStart {
            from: "TIMING".to_string(),
            to: "IDLE".to_string(),
            ms: 5000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timerStart");
        assert_eq!(json["ms"], 5000);
    }
}
