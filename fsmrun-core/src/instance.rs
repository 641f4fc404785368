//! Runtime session state.

use crate::definition::{Delay, MachineDefinition};
use crate::engine::RuntimeEvent;
use crate::expr::{Context, Expr};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A timer armed for one delayed transition of the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTimer {
    /// Index of the owning transition in the definition.
    pub transition: usize,
    pub from: String,
    pub to: String,
    pub ms: u64,
    pub deadline: Instant,
    /// Arming order, used to bound a single expiry pass.
    pub(crate) seq: u64,
}

/// An armed timer as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub from: String,
    pub to: String,
    pub remaining_ms: u64,
}

/// A variable as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSnapshot {
    pub name: String,
    pub type_tag: String,
    pub value: String,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: String,
    /// Inputs that have been set at least once.
    pub inputs: Vec<(String, String)>,
    /// Every declared output; empty text until first written.
    pub outputs: Vec<(String, String)>,
    pub variables: Vec<VariableSnapshot>,
    /// Ordered by deadline, then declaration order.
    pub timers: Vec<TimerSnapshot>,
}

/// Mutable state of one running machine.
#[derive(Debug)]
pub struct Instance {
    definition: Arc<MachineDefinition>,
    state: String,
    started: bool,
    entered_at: Instant,
    /// Evaluation time of the action or guard currently running.
    now: Instant,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
    variables: BTreeMap<String, Value>,
    pending_calls: BTreeSet<String>,
    timers: Vec<ArmedTimer>,
    events: Vec<RuntimeEvent>,
    next_seq: u64,
}

impl Instance {
    /// Creates a session positioned on the initial state, not yet entered.
    pub fn new(definition: Arc<MachineDefinition>, now: Instant) -> Self {
        let variables = definition
            .variables
            .values()
            .map(|v| (v.name.clone(), v.initial.clone()))
            .collect();

        Self {
            state: definition.initial.clone(),
            definition,
            started: false,
            entered_at: now,
            now,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            variables,
            pending_calls: BTreeSet::new(),
            timers: Vec::new(),
            events: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn has_pending_call(&self, name: &str) -> bool {
        self.pending_calls.contains(name)
    }

    pub fn timers(&self) -> &[ArmedTimer] {
        &self.timers
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn set_input(&mut self, name: &str, value: &str) {
        self.inputs
            .insert(name.to_string(), Value::Str(value.to_string()));
        self.events.push(RuntimeEvent::InputChanged {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Stores a variable, coerced to its declared type.
    pub(crate) fn set_variable(&mut self, name: &str, value: Value) -> bool {
        let Some(variable) = self.definition.variables.get(name) else {
            return false;
        };
        let value = value.coerce(variable.var_type);
        let text = value.to_string();
        self.variables.insert(name.to_string(), value);
        self.events.push(RuntimeEvent::VariableChanged {
            name: name.to_string(),
            value: text,
        });
        true
    }

    pub(crate) fn mark_called(&mut self, name: &str) {
        self.pending_calls.insert(name.to_string());
    }

    pub(crate) fn push_event(&mut self, event: RuntimeEvent) {
        self.events.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<RuntimeEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn evaluate_guard(&mut self, guard: &Expr, now: Instant) -> bool {
        self.now = now;
        guard.evaluate(self).is_truthy()
    }

    pub(crate) fn cancel_timers(&mut self) {
        if !self.timers.is_empty() {
            debug!("Cancelling {} timer(s) of state {}", self.timers.len(), self.state);
        }
        self.timers.clear();
    }

    /// Removes the timer armed with the given sequence number.
    pub(crate) fn remove_timer(&mut self, seq: u64) -> Option<ArmedTimer> {
        let pos = self.timers.iter().position(|t| t.seq == seq)?;
        Some(self.timers.remove(pos))
    }

    /// Enters `state`: records the entry, runs its entry action and arms its
    /// delayed transitions.
    pub(crate) fn enter(&mut self, state: &str, from: Option<String>, now: Instant) {
        let definition = Arc::clone(&self.definition);

        self.state = state.to_string();
        self.started = true;
        self.entered_at = now;
        self.now = now;
        self.events.push(RuntimeEvent::StateChanged {
            from,
            to: state.to_string(),
        });

        if let Some(target) = definition.states.get(state) {
            target.action.execute(self);
        }

        for (index, transition) in definition.transitions_from(state) {
            let Some(delay) = &transition.delay else {
                continue;
            };
            let ms = match delay {
                Delay::Millis(ms) => *ms,
                Delay::Variable(name) => self
                    .variables
                    .get(name)
                    .map(|v| v.as_i64().max(0) as u64)
                    .unwrap_or(0),
            };

            self.timers.push(ArmedTimer {
                transition: index,
                from: transition.from.clone(),
                to: transition.to.clone(),
                ms,
                deadline: now + Duration::from_millis(ms),
                seq: self.next_seq,
            });
            self.next_seq += 1;
            self.events.push(RuntimeEvent::TimerStarted {
                from: transition.from.clone(),
                to: transition.to.clone(),
                ms,
            });
        }
    }

    pub fn status(&self, now: Instant) -> StatusSnapshot {
        let inputs = self
            .inputs
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();

        let outputs = self
            .definition
            .outputs
            .iter()
            .map(|name| {
                let value = self
                    .outputs
                    .get(name)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                (name.clone(), value)
            })
            .collect();

        let variables = self
            .definition
            .variables
            .values()
            .map(|v| VariableSnapshot {
                name: v.name.clone(),
                type_tag: v.type_tag.clone(),
                value: self
                    .variables
                    .get(&v.name)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            })
            .collect();

        let mut armed: Vec<&ArmedTimer> = self.timers.iter().collect();
        armed.sort_by_key(|t| (t.deadline, t.transition));
        let timers = armed
            .into_iter()
            .map(|t| TimerSnapshot {
                from: t.from.clone(),
                to: t.to.clone(),
                remaining_ms: t.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();

        StatusSnapshot {
            state: self.state.clone(),
            inputs,
            outputs,
            variables,
            timers,
        }
    }
}

impl Context for Instance {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.variables
            .get(name)
            .or_else(|| self.inputs.get(name))
            .or_else(|| self.outputs.get(name))
            .cloned()
    }

    fn is_defined(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
            || self.outputs.contains_key(name)
            || self.variables.contains_key(name)
    }

    fn take_call(&mut self, name: &str) -> bool {
        self.pending_calls.remove(name)
    }

    fn set_output(&mut self, name: &str, value: Value) {
        if !self.definition.is_output(name) {
            warn!("Ignoring write to undeclared output '{}'", name);
            return;
        }
        let text = value.to_string();
        self.outputs.insert(name.to_string(), value);
        self.events.push(RuntimeEvent::OutputChanged {
            name: name.to_string(),
            value: text,
        });
    }

    fn assign(&mut self, name: &str, value: Value) -> bool {
        self.set_variable(name, value)
    }

    fn elapsed_ms(&self) -> i64 {
        self.now.saturating_duration_since(self.entered_at).as_millis() as i64
    }

    fn log(&mut self, message: String) {
        debug!("Entry action log: {}", message);
        self.events.push(RuntimeEvent::Log { message });
    }
}
