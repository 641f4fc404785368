//! Transition engine - drives one instance of a machine definition.
//!
//! Every mutating call takes the current time and returns the events it
//! produced, in order. Transitions of the current state are scanned in
//! declaration order and the first eligible one whose guard holds fires:
//!
//! - a triggered transition is eligible when its input is set or called
//! - a guard-only transition is eligible on every input or variable change
//! - a delayed transition is eligible only when its own timer expires
//!
//! Entering a state does not cascade; the new state's guard-only transitions
//! are evaluated on the next stimulus.

use crate::definition::MachineDefinition;
use crate::error::CoreError;
use crate::instance::{Instance, StatusSnapshot};
use crate::value::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A side effect of driving the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// `from` is `None` on the initial entry.
    StateChanged { from: Option<String>, to: String },
    InputChanged { name: String, value: String },
    OutputChanged { name: String, value: String },
    VariableChanged { name: String, value: String },
    TimerStarted { from: String, to: String, ms: u64 },
    TimerExpired { from: String, to: String },
    Log { message: String },
}

/// What caused a transition scan.
#[derive(Debug, Clone, Copy)]
enum Stimulus<'a> {
    /// An input or variable changed.
    Name(&'a str),
    /// The timer of the transition with this index expired.
    Timer(usize),
}

/// The automaton engine.
pub struct Engine {
    definition: Arc<MachineDefinition>,
    instance: Instance,
}

impl Engine {
    pub fn new(definition: impl Into<Arc<MachineDefinition>>) -> Self {
        let definition = definition.into();
        let instance = Instance::new(Arc::clone(&definition), Instant::now());
        Self {
            definition,
            instance,
        }
    }

    /// Enters the initial state. Calling it again has no effect.
    pub fn start(&mut self, now: Instant) -> Vec<RuntimeEvent> {
        if self.instance.is_started() {
            return Vec::new();
        }
        let initial = self.definition.initial.clone();
        info!("Starting machine {} in state {}", self.definition.name, initial);
        self.instance.enter(&initial, None, now);
        self.instance.take_events()
    }

    /// Writes an input or variable and re-scans the current state's transitions.
    pub fn set(
        &mut self,
        name: &str,
        value: &str,
        now: Instant,
    ) -> Result<Vec<RuntimeEvent>, CoreError> {
        self.ensure_started()?;

        if self.definition.is_input(name) {
            self.instance.set_input(name, value);
        } else if self.definition.variables.contains_key(name) {
            self.instance
                .set_variable(name, Value::Str(value.to_string()));
        } else {
            return Err(CoreError::UnknownName {
                name: name.to_string(),
            });
        }

        self.scan(Stimulus::Name(name), now);
        Ok(self.instance.take_events())
    }

    /// Pulses an input so the next `called(name)` reads true, then re-scans.
    pub fn call(&mut self, name: &str, now: Instant) -> Result<Vec<RuntimeEvent>, CoreError> {
        self.ensure_started()?;

        if !self.definition.is_input(name) {
            return Err(CoreError::NotAnInput {
                name: name.to_string(),
            });
        }

        self.instance.mark_called(name);
        self.scan(Stimulus::Name(name), now);
        Ok(self.instance.take_events())
    }

    /// Expires every timer due at `now`, earliest first.
    ///
    /// Timers armed while this call runs (by a transition it fired) are left
    /// for a later call even if already due.
    pub fn fire_due_timers(&mut self, now: Instant) -> Vec<RuntimeEvent> {
        let limit = self.instance.next_seq();

        loop {
            let due = self
                .instance
                .timers()
                .iter()
                .filter(|t| t.seq < limit && t.deadline <= now)
                .min_by_key(|t| (t.deadline, t.transition))
                .map(|t| t.seq);

            let Some(timer) = due.and_then(|seq| self.instance.remove_timer(seq)) else {
                break;
            };

            debug!("Timer expired: {} -> {} after {}ms", timer.from, timer.to, timer.ms);
            self.instance.push_event(RuntimeEvent::TimerExpired {
                from: timer.from,
                to: timer.to,
            });
            self.scan(Stimulus::Timer(timer.transition), now);
        }

        self.instance.take_events()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.instance.next_deadline()
    }

    pub fn status(&self, now: Instant) -> StatusSnapshot {
        self.instance.status(now)
    }

    pub fn current_state(&self) -> &str {
        self.instance.state()
    }

    pub fn is_started(&self) -> bool {
        self.instance.is_started()
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn definition(&self) -> &Arc<MachineDefinition> {
        &self.definition
    }

    /// Serialized model document.
    pub fn model_xml(&self) -> String {
        self.definition.to_xml()
    }

    /// Discards the session and starts a fresh one from the same definition.
    pub fn reset(&mut self, now: Instant) -> Vec<RuntimeEvent> {
        info!("Resetting machine {}", self.definition.name);
        self.instance = Instance::new(Arc::clone(&self.definition), now);
        self.start(now)
    }

    fn ensure_started(&self) -> Result<(), CoreError> {
        if self.instance.is_started() {
            Ok(())
        } else {
            Err(CoreError::NotStarted)
        }
    }

    /// Fires the first eligible transition whose guard holds.
    fn scan(&mut self, stimulus: Stimulus<'_>, now: Instant) -> bool {
        let definition = Arc::clone(&self.definition);
        let current = self.instance.state().to_string();

        for (index, transition) in definition.transitions_from(&current) {
            let eligible = match stimulus {
                Stimulus::Name(name) => {
                    transition.delay.is_none()
                        && transition.event.as_deref().map_or(true, |e| e == name)
                }
                Stimulus::Timer(timer) => timer == index,
            };
            if !eligible {
                continue;
            }

            let passes = match &transition.guard {
                Some(guard) => self.instance.evaluate_guard(guard, now),
                None => true,
            };
            if !passes {
                debug!("Guard of {} is false", transition.describe());
                continue;
            }

            info!("State change: {} -> {}", current, transition.to);
            self.instance.cancel_timers();
            self.instance.enter(&transition.to, Some(current.clone()), now);
            return true;
        }

        false
    }
}
