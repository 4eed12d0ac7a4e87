//! Replicated state machine binding.
//!
//! Keeps one local [`Interpreter`] in lock-step with the `(state, version)`
//! pair stored on a shared game record. There is no sequencer: every peer
//! writes `version + 1` when its interpreter reaches a new node, and every
//! peer adopts a stored state whose node and version both differ from what
//! it last saw.
//!
//! ```text
//!  local event ──► Interpreter::send ──► node changed? ──► record.store(state, v+1)
//!                                                               │
//!                                                     (document broadcast)
//!                                                               │
//!  remote update ──► reconcile(record) ◄────────────────────────┘
//!        │
//!        ├─ same node as local interpreter ──► ignore
//!        ├─ version == last observed        ──► ignore
//!        └─ otherwise: stop, force state, start, advance cursor
//! ```
//!
//! Persistence is a step of [`SharedMachine::send`] and
//! [`SharedMachine::advance_timers`], not a listener on the interpreter, so a
//! forced restart cannot lose it.

use std::time::Instant;

use crate::machine::{
    DuelEvent, DuelMachine, DuelState, Interpreter, ListenerId, MachineSnapshot, Transition,
};

/// The two fields of a game record the binding reads.
///
/// Implemented by the yrs-backed views in [`crate::registry`]; tests can
/// supply their own.
pub trait RecordView {
    /// Raw serialized machine state, if any.
    fn stored_state(&self) -> Option<String>;
    /// Stored version, 0 when absent.
    fn stored_version(&self) -> u64;
}

/// A record the binding can also write to.
pub trait SharedRecord: RecordView {
    /// Write both fields in one mutation.
    fn store(&mut self, state: String, version: u64);
}

/// One game's interpreter bound to its shared record.
#[derive(Debug)]
pub struct SharedMachine {
    interpreter: Interpreter,
    /// Node most recently written to, or adopted from, the record.
    persisted: DuelState,
    /// Version cursor: last version adopted from the record.
    observed_version: u64,
}

impl SharedMachine {
    /// Mount a binding on `record`: start from its stored state when it
    /// parses, from `waiting` otherwise.
    pub fn mount<R: RecordView + ?Sized>(machine: DuelMachine, record: &R) -> Self {
        let stored = record.stored_state().and_then(|raw| MachineSnapshot::parse(&raw));
        let observed_version = if stored.is_some() { record.stored_version() } else { 0 };

        let mut interpreter = Interpreter::new(machine);
        interpreter.start(stored);
        let persisted = interpreter.state().value;

        log::debug!(
            "Mounted machine for game {} at {persisted} (v{observed_version})",
            interpreter.state().context.game_id
        );

        Self {
            interpreter,
            persisted,
            observed_version,
        }
    }

    /// Feed a local event and persist the result if the node changed.
    pub fn send<R: SharedRecord + ?Sized>(&mut self, event: DuelEvent, record: &mut R) -> Transition {
        let transition = self.interpreter.send(event);
        self.persist(&transition, record);
        transition
    }

    /// Fire the `playing` timeout if due and persist the result.
    pub fn advance_timers<R: SharedRecord + ?Sized>(
        &mut self,
        now: Instant,
        record: &mut R,
    ) -> Option<Transition> {
        let transition = self.interpreter.advance(now)?;
        self.persist(&transition, record);
        Some(transition)
    }

    fn persist<R: SharedRecord + ?Sized>(&mut self, transition: &Transition, record: &mut R) {
        let value = transition.snapshot.value;
        if value == self.persisted {
            return;
        }

        let payload = match transition.snapshot.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to serialize machine state: {e}");
                return;
            }
        };
        let version = record.stored_version() + 1;
        record.store(payload, version);
        self.persisted = value;

        log::debug!(
            "Game {} persisted {value} at v{version}",
            transition.snapshot.context.game_id
        );
    }

    /// Adopt the record's state if it is authoritative for this peer.
    ///
    /// Returns `true` when the interpreter was forced into the stored state.
    pub fn reconcile<R: RecordView + ?Sized>(&mut self, record: &R) -> bool {
        let Some(incoming) = record.stored_state().and_then(|raw| MachineSnapshot::parse(&raw)) else {
            return false;
        };
        if incoming.same_path(self.interpreter.state()) {
            return false;
        }
        let version = record.stored_version();
        if version == self.observed_version {
            return false;
        }

        log::debug!(
            "Game {} resync {} -> {} (v{} -> v{version})",
            incoming.context.game_id,
            self.interpreter.state().value,
            incoming.value,
            self.observed_version
        );

        self.observed_version = version;
        self.persisted = incoming.value;
        self.interpreter.stop();
        self.interpreter.start(Some(incoming));
        true
    }

    /// Stop the interpreter, e.g. when the game left the registry.
    pub fn stop(&mut self) {
        self.interpreter.stop();
    }

    pub fn state(&self) -> &MachineSnapshot {
        self.interpreter.state()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.interpreter.matches(name)
    }

    pub fn observed_version(&self) -> u64 {
        self.observed_version
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.interpreter.next_deadline()
    }

    /// Observe transitions of the bound interpreter (local and forced).
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Transition) + Send + 'static,
    {
        self.interpreter.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.interpreter.unsubscribe(id)
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }
}
