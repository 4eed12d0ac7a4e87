//! Duel lifecycle state machine and its interpreter.
//!
//! ```text
//!            JOIN            START             after 2000ms
//! waiting ─────────► ready ─────────► playing ─────────────► done
//!                      ▲                                       │
//!                      └────────────────  RESTART  ────────────┘
//!
//! any state: LOG (log only), DELETE (deletion side effect)
//! ```
//!
//! The interpreter never reads a clock on its own for delayed transitions:
//! entering `playing` records a deadline, and the owner calls
//! [`Interpreter::advance`] once that deadline has passed. This keeps the
//! timer deterministic under test and lets one event loop drive every game.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::LobbyError;

/// Default time spent in `playing` before the machine moves to `done`.
pub const PLAYING_DURATION: Duration = Duration::from_millis(2000);

/// State nodes of the duel machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuelState {
    #[default]
    Waiting,
    Ready,
    Playing,
    Done,
}

impl DuelState {
    /// State path name, the identity used for replication.
    pub fn name(&self) -> &'static str {
        match self {
            DuelState::Waiting => "waiting",
            DuelState::Ready => "ready",
            DuelState::Playing => "playing",
            DuelState::Done => "done",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "waiting" => Some(DuelState::Waiting),
            "ready" => Some(DuelState::Ready),
            "playing" => Some(DuelState::Playing),
            "done" => Some(DuelState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for DuelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events accepted by the duel machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuelEvent {
    Join,
    Start,
    Restart,
    Log,
    Delete,
    /// Internal: the `playing` timeout elapsed.
    #[serde(rename = "xstate.after")]
    Elapsed,
    /// Internal: the interpreter was (re)started.
    #[serde(rename = "xstate.init")]
    Init,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAction {
    /// Write the machine context to the log.
    Log,
    /// The owning game should be removed from the registry.
    Delete,
}

/// Data carried alongside the state node. Never part of state-path equality.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineContext {
    pub doc_id: String,
    pub game_id: String,
}

/// Serializable machine state, stored as JSON on the game record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub value: DuelState,
    pub context: MachineContext,
    /// Event that produced this state.
    pub event: DuelEvent,
    /// Whether that event moved the machine to a different node.
    #[serde(default)]
    pub changed: bool,
}

impl MachineSnapshot {
    pub fn initial(context: MachineContext) -> Self {
        Self {
            value: DuelState::Waiting,
            context,
            event: DuelEvent::Init,
            changed: false,
        }
    }

    /// State-path equality: same node, context ignored.
    pub fn same_path(&self, other: &MachineSnapshot) -> bool {
        self.value == other.value
    }

    pub fn matches(&self, name: &str) -> bool {
        self.value.name() == name
    }

    pub fn to_json(&self) -> Result<String, LobbyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, LobbyError> {
        serde_json::from_str(raw).map_err(|e| LobbyError::MalformedState(e.to_string()))
    }

    /// Parse a stored payload; empty or malformed payloads count as absent.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match Self::from_json(raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("Ignoring stored machine state: {e}");
                None
            }
        }
    }
}

/// Result of feeding one event to the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub snapshot: MachineSnapshot,
    pub actions: Vec<MachineAction>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.snapshot.changed
    }
}

// ───────────────────────────────────────────────────────────────────
// Machine definition
// ───────────────────────────────────────────────────────────────────

/// Pure duel machine: a transition table plus the playing duration.
#[derive(Debug, Clone, PartialEq)]
pub struct DuelMachine {
    context: MachineContext,
    playing_duration: Duration,
}

impl DuelMachine {
    pub fn new(doc_id: impl Into<String>, game_id: impl Into<String>) -> Self {
        Self {
            context: MachineContext {
                doc_id: doc_id.into(),
                game_id: game_id.into(),
            },
            playing_duration: PLAYING_DURATION,
        }
    }

    pub fn with_playing_duration(mut self, duration: Duration) -> Self {
        self.playing_duration = duration;
        self
    }

    pub fn playing_duration(&self) -> Duration {
        self.playing_duration
    }

    pub fn context(&self) -> &MachineContext {
        &self.context
    }

    pub fn initial_state(&self) -> MachineSnapshot {
        MachineSnapshot::initial(self.context.clone())
    }

    /// Compute the next state. Unhandled events leave the node unchanged.
    pub fn transition(&self, from: &MachineSnapshot, event: DuelEvent) -> Transition {
        let (target, actions) = match (from.value, event) {
            (_, DuelEvent::Log) => (None, vec![MachineAction::Log]),
            (_, DuelEvent::Delete) => (None, vec![MachineAction::Delete]),
            (DuelState::Waiting, DuelEvent::Join) => (Some(DuelState::Ready), Vec::new()),
            (DuelState::Ready, DuelEvent::Start) => (Some(DuelState::Playing), Vec::new()),
            (DuelState::Playing, DuelEvent::Elapsed) => (Some(DuelState::Done), Vec::new()),
            (DuelState::Done, DuelEvent::Restart) => (Some(DuelState::Ready), Vec::new()),
            _ => (None, Vec::new()),
        };

        let snapshot = MachineSnapshot {
            value: target.unwrap_or(from.value),
            context: from.context.clone(),
            event,
            changed: target.is_some(),
        };
        Transition { snapshot, actions }
    }
}

// ───────────────────────────────────────────────────────────────────
// Interpreter
// ───────────────────────────────────────────────────────────────────

/// Lifecycle of an [`Interpreter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterStatus {
    NotStarted,
    Running,
    Stopped,
}

/// Handle returned by [`Interpreter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&Transition) + Send>;

/// Runs a [`DuelMachine`]: holds the current state, the pending
/// `playing` deadline and the transition listeners.
///
/// Listeners survive `stop()`/`start()` cycles.
pub struct Interpreter {
    machine: DuelMachine,
    state: MachineSnapshot,
    status: InterpreterStatus,
    deadline: Option<Instant>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl Interpreter {
    pub fn new(machine: DuelMachine) -> Self {
        let state = machine.initial_state();
        Self {
            machine,
            state,
            status: InterpreterStatus::NotStarted,
            deadline: None,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Start from `from`, or from the machine's initial state.
    ///
    /// Entering `playing` schedules the delayed transition from now.
    pub fn start(&mut self, from: Option<MachineSnapshot>) {
        self.state = from.unwrap_or_else(|| self.machine.initial_state());
        self.status = InterpreterStatus::Running;
        self.deadline = self.entry_deadline(self.state.value, Instant::now());
    }

    /// Stop processing events and cancel the pending timer.
    pub fn stop(&mut self) {
        self.status = InterpreterStatus::Stopped;
        self.deadline = None;
    }

    /// Feed an event. A stopped interpreter ignores it and reports its
    /// current state unchanged.
    pub fn send(&mut self, event: DuelEvent) -> Transition {
        if self.status != InterpreterStatus::Running {
            log::warn!(
                "Event {event:?} sent to game {} while interpreter is {:?}",
                self.machine.context.game_id,
                self.status
            );
            return Transition {
                snapshot: MachineSnapshot {
                    changed: false,
                    ..self.state.clone()
                },
                actions: Vec::new(),
            };
        }
        self.apply(event, Instant::now())
    }

    /// Fire the delayed transition if its deadline is at or before `now`.
    pub fn advance(&mut self, now: Instant) -> Option<Transition> {
        match self.deadline {
            Some(deadline) if deadline <= now && self.status == InterpreterStatus::Running => {
                self.deadline = None;
                Some(self.apply(DuelEvent::Elapsed, now))
            }
            _ => None,
        }
    }

    fn apply(&mut self, event: DuelEvent, now: Instant) -> Transition {
        let transition = self.machine.transition(&self.state, event);
        if transition.changed() {
            self.deadline = self.entry_deadline(transition.snapshot.value, now);
        }
        self.state = transition.snapshot.clone();

        for (_, listener) in self.listeners.iter_mut() {
            listener(&transition);
        }
        transition
    }

    fn entry_deadline(&self, state: DuelState, now: Instant) -> Option<Instant> {
        (state == DuelState::Playing).then(|| now + self.machine.playing_duration)
    }

    /// Register a transition listener.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Transition) + Send + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn matches(&self, name: &str) -> bool {
        self.state.matches(name)
    }

    pub fn state(&self) -> &MachineSnapshot {
        &self.state
    }

    pub fn status(&self) -> InterpreterStatus {
        self.status
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn machine(&self) -> &DuelMachine {
        &self.machine
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("state", &self.state.value)
            .field("status", &self.status)
            .field("deadline", &self.deadline)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn running() -> Interpreter {
        let mut interpreter = Interpreter::new(DuelMachine::new("rpsApp", "g1"));
        interpreter.start(None);
        interpreter
    }

    #[test]
    fn test_initial_state_is_waiting() {
        let interpreter = running();
        assert!(interpreter.matches("waiting"));
        assert_eq!(interpreter.state().context.game_id, "g1");
        assert!(interpreter.next_deadline().is_none());
    }

    #[test]
    fn test_full_cycle() {
        let mut interpreter = running();
        assert_eq!(interpreter.send(DuelEvent::Join).snapshot.value, DuelState::Ready);
        assert_eq!(interpreter.send(DuelEvent::Start).snapshot.value, DuelState::Playing);

        let deadline = interpreter.next_deadline().expect("playing schedules a timeout");
        let fired = interpreter.advance(deadline).expect("timeout due");
        assert_eq!(fired.snapshot.value, DuelState::Done);
        assert_eq!(fired.snapshot.event, DuelEvent::Elapsed);
        assert!(interpreter.next_deadline().is_none());

        assert_eq!(interpreter.send(DuelEvent::Restart).snapshot.value, DuelState::Ready);
    }

    #[test]
    fn test_unhandled_event_keeps_state() {
        let mut interpreter = running();
        let t = interpreter.send(DuelEvent::Start);
        assert!(!t.changed());
        assert!(interpreter.matches("waiting"));

        let t = interpreter.send(DuelEvent::Restart);
        assert!(!t.changed());
    }

    #[test]
    fn test_global_events_emit_actions_without_moving() {
        let mut interpreter = running();
        interpreter.send(DuelEvent::Join);

        let log = interpreter.send(DuelEvent::Log);
        assert_eq!(log.actions, vec![MachineAction::Log]);
        assert!(!log.changed());

        let delete = interpreter.send(DuelEvent::Delete);
        assert_eq!(delete.actions, vec![MachineAction::Delete]);
        assert!(interpreter.matches("ready"));
    }

    #[test]
    fn test_timer_not_due_before_deadline() {
        let mut interpreter = running();
        interpreter.send(DuelEvent::Join);
        interpreter.send(DuelEvent::Start);
        let deadline = interpreter.next_deadline().unwrap();
        assert!(interpreter.advance(deadline - Duration::from_millis(1)).is_none());
        assert!(interpreter.matches("playing"));
    }

    #[test]
    fn test_custom_playing_duration() {
        let machine = DuelMachine::new("d", "g").with_playing_duration(Duration::from_millis(50));
        let mut interpreter = Interpreter::new(machine);
        interpreter.start(None);
        interpreter.send(DuelEvent::Join);
        let before = Instant::now();
        interpreter.send(DuelEvent::Start);
        let deadline = interpreter.next_deadline().unwrap();
        assert!(deadline >= before + Duration::from_millis(50));
        assert!(deadline <= Instant::now() + Duration::from_millis(50));
    }

    #[test]
    fn test_stop_cancels_timer_and_ignores_events() {
        let mut interpreter = running();
        interpreter.send(DuelEvent::Join);
        interpreter.send(DuelEvent::Start);
        interpreter.stop();

        assert!(interpreter.next_deadline().is_none());
        let t = interpreter.send(DuelEvent::Restart);
        assert!(!t.changed());
        assert_eq!(interpreter.status(), InterpreterStatus::Stopped);
        assert!(interpreter.advance(Instant::now() + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_not_started_ignores_events() {
        let mut interpreter = Interpreter::new(DuelMachine::new("d", "g"));
        let t = interpreter.send(DuelEvent::Join);
        assert!(!t.changed());
        assert!(interpreter.matches("waiting"));
    }

    #[test]
    fn test_start_from_playing_schedules_timer() {
        let machine = DuelMachine::new("d", "g");
        let from = MachineSnapshot {
            value: DuelState::Playing,
            context: machine.context().clone(),
            event: DuelEvent::Start,
            changed: true,
        };
        let mut interpreter = Interpreter::new(machine);
        interpreter.start(Some(from));
        assert!(interpreter.matches("playing"));
        assert!(interpreter.next_deadline().is_some());
    }

    #[test]
    fn test_listeners_survive_restart() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut interpreter = running();
        interpreter.subscribe(move |t| sink.lock().unwrap().push(t.snapshot.value));

        interpreter.send(DuelEvent::Join);
        interpreter.stop();
        interpreter.start(None);
        interpreter.send(DuelEvent::Join);

        assert_eq!(*seen.lock().unwrap(), vec![DuelState::Ready, DuelState::Ready]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let mut interpreter = running();
        let id = interpreter.subscribe(move |_| *sink.lock().unwrap() += 1);

        interpreter.send(DuelEvent::Log);
        assert!(interpreter.unsubscribe(id));
        assert!(!interpreter.unsubscribe(id));
        interpreter.send(DuelEvent::Log);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut interpreter = running();
        let t = interpreter.send(DuelEvent::Join);
        let json = t.snapshot.to_json().unwrap();
        assert!(json.contains("\"value\":\"ready\""));
        assert!(json.contains("\"event\":\"JOIN\""));
        assert!(json.contains("\"gameId\":\"g1\""));
        assert!(json.contains("\"docId\":\"rpsApp\""));

        let parsed = MachineSnapshot::parse(&json).unwrap();
        assert_eq!(parsed, t.snapshot);
    }

    #[test]
    fn test_parse_malformed_is_absent() {
        assert!(MachineSnapshot::parse("").is_none());
        assert!(MachineSnapshot::parse("{not json").is_none());
        assert!(MachineSnapshot::parse(r#"{"value":"exploded","context":{},"event":"JOIN"}"#).is_none());
        assert!(MachineSnapshot::from_json("[]").is_err());
    }

    #[test]
    fn test_same_path_ignores_context() {
        let a = MachineSnapshot::initial(MachineContext {
            doc_id: "a".into(),
            game_id: "1".into(),
        });
        let b = MachineSnapshot::initial(MachineContext {
            doc_id: "b".into(),
            game_id: "2".into(),
        });
        assert!(a.same_path(&b));
    }

    #[test]
    fn test_state_names_roundtrip() {
        for state in [DuelState::Waiting, DuelState::Ready, DuelState::Playing, DuelState::Done] {
            assert_eq!(DuelState::from_name(state.name()), Some(state));
        }
        assert_eq!(DuelState::from_name("idle"), None);
    }
}
