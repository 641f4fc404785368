//! Machine definition types.
//!
//! Models are XML documents:
//!
//! ```xml
//! <automaton name="TOF5s">
//!   <comment>Timer to off</comment>
//!   <inputs><input name="in"/></inputs>
//!   <outputs><output name="out"/></outputs>
//!   <variables><variable name="timeout" type="int" value="5000"/></variables>
//!   <states>
//!     <state name="IDLE" initial="true"><code>output("out", 0);</code></state>
//!     <state name="ACTIVE"><code>output("out", 1);</code></state>
//!     <state name="TIMING"/>
//!   </states>
//!   <transitions>
//!     <transition from="IDLE" to="ACTIVE">
//!       <condition event="in">atoi_safe(valueof("in")) == 1</condition>
//!     </transition>
//!     <transition from="TIMING" to="IDLE"><delay>timeout</delay></transition>
//!   </transitions>
//! </automaton>
//! ```
//!
//! A definition is validated as a whole before it is returned; nothing is
//! handed out for a document that fails any check.

use crate::error::CoreError;
use crate::expr::{Expr, Program};
use crate::value::{Value, VarType};
use fsmrun_protocol::Element;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// A declared variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Type tag as written in the model, e.g. `int`.
    pub type_tag: String,
    pub var_type: VarType,
    /// Value the variable holds when a session starts.
    pub initial: Value,
}

/// A state and its entry action.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,
    /// Entry action source.
    pub code: String,
    pub initial: bool,
    pub action: Program,
}

/// How long a delayed transition waits after its source state is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delay {
    Millis(u64),
    /// Read from an integer variable at state entry.
    Variable(String),
}

/// A transition between two states.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// Input whose `set`/`call` triggers the transition.
    pub event: Option<String>,
    /// Guard source.
    pub condition: Option<String>,
    pub delay: Option<Delay>,
    pub guard: Option<Expr>,
}

impl Transition {
    /// Short description used in errors and logs.
    pub fn describe(&self) -> String {
        format!("{} -> {}", self.from, self.to)
    }
}

/// Validated machine definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineDefinition {
    pub name: String,
    pub comment: String,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub variables: BTreeMap<String, Variable>,
    pub states: BTreeMap<String, State>,
    /// In declaration order, which is also firing priority.
    pub transitions: Vec<Transition>,
    pub initial: String,
}

impl MachineDefinition {
    /// Parses and validates a model document.
    pub fn from_xml(xml: &str) -> Result<Self, CoreError> {
        let root = Element::parse(xml)?;
        Self::from_element(&root)
    }

    /// Reads and validates a model document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml(&xml)
    }

    pub fn from_element(root: &Element) -> Result<Self, CoreError> {
        if root.name != "automaton" {
            return Err(CoreError::definition(format!(
                "root element must be <automaton>, got <{}>",
                root.name
            )));
        }
        let name = required_attr(root, "name")?;

        let comment = root
            .child_text("comment")
            .or_else(|| root.attr("comment"))
            .unwrap_or_default()
            .to_string();

        let mut declared: HashSet<String> = HashSet::new();
        let mut declare = |name: &str, kind: &str| -> Result<(), CoreError> {
            if name.is_empty() {
                return Err(CoreError::definition(format!("{} with empty name", kind)));
            }
            if !declared.insert(name.to_string()) {
                return Err(CoreError::definition(format!(
                    "name '{}' declared more than once",
                    name
                )));
            }
            Ok(())
        };

        let mut inputs = BTreeSet::new();
        for el in section(root, "inputs", "input") {
            let input = required_attr(el, "name")?;
            declare(&input, "input")?;
            inputs.insert(input);
        }

        let mut outputs = BTreeSet::new();
        for el in section(root, "outputs", "output") {
            let output = required_attr(el, "name")?;
            declare(&output, "output")?;
            outputs.insert(output);
        }

        let mut variables = BTreeMap::new();
        // Int variables whose initial value is a well-formed integer.
        let mut integral = BTreeSet::new();
        for el in section(root, "variables", "variable") {
            let var_name = required_attr(el, "name")?;
            declare(&var_name, "variable")?;
            let type_tag = required_attr(el, "type")?;
            let var_type = VarType::from_tag(&type_tag);
            let text = el.attr("value").unwrap_or_default();
            if var_type == VarType::Int && text.trim().parse::<i64>().is_ok() {
                integral.insert(var_name.clone());
            }
            let initial = Value::parse_as(text, var_type);
            variables.insert(
                var_name.clone(),
                Variable {
                    name: var_name,
                    type_tag,
                    var_type,
                    initial,
                },
            );
        }

        let mut states = BTreeMap::new();
        let mut initial = None;
        for el in section(root, "states", "state") {
            let state_name = required_attr(el, "name")?;
            if state_name.is_empty() {
                return Err(CoreError::definition("state with empty name"));
            }
            let is_initial = el
                .attr("initial")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            let code = el.child_text("code").unwrap_or_default().to_string();
            let action = Program::parse(&code).map_err(|e| {
                in_context(e, &format!("entry action of state '{}'", state_name))
            })?;

            if is_initial {
                if let Some(previous) = &initial {
                    return Err(CoreError::definition(format!(
                        "multiple initial states: '{}' and '{}'",
                        previous, state_name
                    )));
                }
                initial = Some(state_name.clone());
            }

            let state = State {
                name: state_name.clone(),
                code,
                initial: is_initial,
                action,
            };
            if states.insert(state_name.clone(), state).is_some() {
                return Err(CoreError::definition(format!(
                    "state '{}' declared more than once",
                    state_name
                )));
            }
        }

        let initial = initial.ok_or_else(|| CoreError::definition("no initial state"))?;

        let mut transitions = Vec::new();
        for el in section(root, "transitions", "transition") {
            let transition = parse_transition(el, &states, &inputs, &variables, &integral)?;
            transitions.push(transition);
        }

        Ok(Self {
            name,
            comment,
            inputs,
            outputs,
            variables,
            states,
            transitions,
            initial,
        })
    }

    /// Serializes the definition back into a model document.
    pub fn to_element(&self) -> Element {
        let mut root = Element::new("automaton").with_attr("name", &self.name);
        if !self.comment.is_empty() {
            root = root.with_child(Element::leaf("comment", &self.comment));
        }

        let inputs = self
            .inputs
            .iter()
            .map(|i| Element::new("input").with_attr("name", i));
        let outputs = self
            .outputs
            .iter()
            .map(|o| Element::new("output").with_attr("name", o));
        let variables = self.variables.values().map(|v| {
            Element::new("variable")
                .with_attr("name", &v.name)
                .with_attr("type", &v.type_tag)
                .with_attr("value", v.initial.to_string())
        });
        let states = self.states.values().map(|s| {
            let mut el = Element::new("state").with_attr("name", &s.name);
            if s.initial {
                el = el.with_attr("initial", "true");
            }
            if !s.code.is_empty() {
                el = el.with_child(Element::leaf("code", &s.code));
            }
            el
        });
        let transitions = self.transitions.iter().map(|t| {
            let mut el = Element::new("transition")
                .with_attr("from", &t.from)
                .with_attr("to", &t.to);
            if t.event.is_some() || t.condition.is_some() {
                let mut condition =
                    Element::new("condition").with_text(t.condition.clone().unwrap_or_default());
                if let Some(event) = &t.event {
                    condition = condition.with_attr("event", event);
                }
                el = el.with_child(condition);
            }
            match &t.delay {
                Some(Delay::Millis(ms)) => el.with_child(Element::leaf("delay", ms.to_string())),
                Some(Delay::Variable(var)) => el.with_child(Element::leaf("delay", var)),
                None => el,
            }
        });

        root.with_child(Element::new("inputs").with_children(inputs))
            .with_child(Element::new("outputs").with_children(outputs))
            .with_child(Element::new("variables").with_children(variables))
            .with_child(Element::new("states").with_children(states))
            .with_child(Element::new("transitions").with_children(transitions))
    }

    /// Serializes the definition as a single-line model document.
    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    /// Outgoing transitions of a state with their declaration index.
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = (usize, &'a Transition)> + 'a {
        self.transitions
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.from == state)
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.contains(name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.contains(name)
    }
}

fn required_attr(element: &Element, attr: &str) -> Result<String, CoreError> {
    element
        .attr(attr)
        .map(|v| v.trim().to_string())
        .ok_or_else(|| {
            CoreError::definition(format!(
                "<{}> is missing the '{}' attribute",
                element.name, attr
            ))
        })
}

/// Items of a list section such as `<inputs><input/>...</inputs>`.
fn section<'a>(root: &'a Element, list: &str, item: &'a str) -> impl Iterator<Item = &'a Element> {
    root.child(list)
        .into_iter()
        .flat_map(move |l| l.children_named(item))
}

fn in_context(err: CoreError, what: &str) -> CoreError {
    match err {
        CoreError::InvalidExpression { reason } => {
            CoreError::expression(format!("{}: {}", what, reason))
        }
        other => other,
    }
}

fn parse_transition(
    el: &Element,
    states: &BTreeMap<String, State>,
    inputs: &BTreeSet<String>,
    variables: &BTreeMap<String, Variable>,
    integral: &BTreeSet<String>,
) -> Result<Transition, CoreError> {
    let from = required_attr(el, "from")?;
    let to = required_attr(el, "to")?;
    let label = format!("{} -> {}", from, to);

    for endpoint in [&from, &to] {
        if !states.contains_key(endpoint.as_str()) {
            return Err(CoreError::definition(format!(
                "transition {} refers to unknown state '{}'",
                label, endpoint
            )));
        }
    }

    let (event, condition) = match el.child("condition") {
        Some(cond) => {
            let event = cond
                .attr("event")
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string);
            let text = cond.text.trim();
            let condition = (!text.is_empty()).then(|| text.to_string());
            (event, condition)
        }
        None => (None, None),
    };

    if let Some(event) = &event {
        if !inputs.contains(event) {
            return Err(CoreError::definition(format!(
                "transition {} is triggered by '{}', which is not a declared input",
                label, event
            )));
        }
    }

    let guard = condition
        .as_deref()
        .map(Expr::parse)
        .transpose()
        .map_err(|e| in_context(e, &format!("guard of transition {}", label)))?;

    let delay = match el.child_text("delay").map(str::trim) {
        Some("") | None => None,
        Some(text) => Some(parse_delay(text, &label, variables, integral)?),
    };

    if event.is_none() && guard.is_none() && delay.is_none() {
        return Err(CoreError::definition(format!(
            "transition {} has no trigger, guard or delay",
            label
        )));
    }
    if event.is_some() && delay.is_some() {
        return Err(CoreError::definition(format!(
            "transition {} has both a trigger and a delay",
            label
        )));
    }

    Ok(Transition {
        from,
        to,
        event,
        condition,
        delay,
        guard,
    })
}

fn parse_delay(
    text: &str,
    label: &str,
    variables: &BTreeMap<String, Variable>,
    integral: &BTreeSet<String>,
) -> Result<Delay, CoreError> {
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(Delay::Millis(ms.max(0) as u64));
    }

    let Some(variable) = variables.get(text) else {
        return Err(CoreError::definition(format!(
            "delay of transition {} refers to unknown variable '{}'",
            label, text
        )));
    };
    if variable.var_type != VarType::Int {
        return Err(CoreError::definition(format!(
            "delay variable '{}' of transition {} must be an integer, not '{}'",
            text, label, variable.type_tag
        )));
    }
    if !integral.contains(text) {
        return Err(CoreError::definition(format!(
            "delay variable '{}' of transition {} has a non-integer initial value",
            text, label
        )));
    }
    Ok(Delay::Variable(text.to_string()))
}
