//! Call-time accounting for one profiling session.
//!
//! The session owns a frozen [`Registry`] plus, under a single mutex, a LIFO
//! stack of entry timestamps per `(target, thread)` and the completed
//! durations per target. Entry events for unregistered code are rejected with
//! one hash lookup before the lock is touched.
//!
//! Exits pop the most recent entry of the same target on the same thread, so
//! recursion pairs each exit with its own entry and calls on different threads
//! never steal each other's timestamps. An exit with nothing to pop is counted
//! and otherwise ignored. Entries still open when the session is drained are
//! counted and dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Instant;

use crate::code::{Code, CodeId};
use crate::registry::{Registry, TargetRecord};

/// Completed call durations of one target.
#[derive(Debug, Clone)]
pub struct CallTimes {
    record: TargetRecord,
    durations: Vec<u64>,
}

impl CallTimes {
    pub(crate) fn new(record: TargetRecord, durations: Vec<u64>) -> Self {
        Self { record, durations }
    }

    pub fn id(&self) -> CodeId {
        self.record.id()
    }

    pub fn label(&self) -> &str {
        self.record.label()
    }

    pub fn code(&self) -> &'static Code {
        self.record.code()
    }

    /// Elapsed nanoseconds per completed call, in completion order.
    pub fn durations(&self) -> &[u64] {
        &self.durations
    }

    pub fn calls(&self) -> usize {
        self.durations.len()
    }

    pub fn total(&self) -> u64 {
        self.durations.iter().sum()
    }
}

/// Everything one region measured, in target registration order.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    label: Option<String>,
    entries: Vec<CallTimes>,
    unmatched_exits: u64,
    discarded_entries: u64,
}

impl Aggregate {
    pub(crate) fn new(label: Option<String>, entries: Vec<CallTimes>) -> Self {
        Self {
            label,
            entries,
            ..Self::default()
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn entries(&self) -> &[CallTimes] {
        &self.entries
    }

    pub fn get(&self, id: CodeId) -> Option<&CallTimes> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    /// Exit events that found no open entry to pair with.
    pub fn unmatched_exits(&self) -> u64 {
        self.unmatched_exits
    }

    /// Entries that were still open when the region closed.
    pub fn discarded_entries(&self) -> u64 {
        self.discarded_entries
    }
}

struct State {
    stacks: HashMap<(usize, ThreadId), Vec<Instant>>,
    durations: Vec<Vec<u64>>,
    unmatched_exits: u64,
}

impl State {
    fn new(targets: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            durations: vec![Vec::new(); targets],
            unmatched_exits: 0,
        }
    }
}

pub(crate) struct Session {
    registry: Registry,
    state: Mutex<State>,
}

impl Session {
    pub(crate) fn new(registry: Registry) -> Self {
        let state = Mutex::new(State::new(registry.len()));
        Self { registry, state }
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn on_start(&self, code: &'static Code) {
        let Some(index) = self.registry.index_of(code.id()) else {
            return;
        };
        let thread = std::thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .stacks
            .entry((index, thread))
            .or_default()
            .push(Instant::now());
    }

    /// Shared by normal returns and unwinds: both are timed the same way.
    pub(crate) fn on_exit(&self, code: &'static Code) {
        let now = Instant::now();
        let Some(index) = self.registry.index_of(code.id()) else {
            return;
        };
        let thread = std::thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.stacks.get_mut(&(index, thread)).and_then(Vec::pop) {
            Some(start) => {
                let elapsed = now.saturating_duration_since(start).as_nanos() as u64;
                state.durations[index].push(elapsed);
            }
            None => {
                state.unmatched_exits += 1;
                tracing::debug!(
                    target_label = self.registry.records()[index].label(),
                    "exit without matching entry ignored"
                );
            }
        }
    }

    /// Take everything recorded so far, leaving the session empty.
    pub(crate) fn drain(&self, label: Option<String>) -> Aggregate {
        let state = {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, State::new(self.registry.len()))
        };

        let discarded_entries: u64 = state.stacks.values().map(|stack| stack.len() as u64).sum();
        if discarded_entries > 0 {
            tracing::debug!(discarded_entries, "open entries discarded at region close");
        }

        let entries = self
            .registry
            .records()
            .iter()
            .cloned()
            .zip(state.durations)
            .map(|(record, durations)| CallTimes::new(record, durations))
            .collect();

        Aggregate {
            label,
            entries,
            unmatched_exits: state.unmatched_exits,
            discarded_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{register, SymbolTable, Target};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    static OUTER: Code = Code::new("collector_tests", "outer");
    static INNER: Code = Code::new("collector_tests", "inner");
    static STRANGER: Code = Code::new("collector_tests", "stranger");

    fn session(targets: &[&'static Code]) -> Session {
        let targets: Vec<Target> = targets.iter().map(|&code| Target::from(code)).collect();
        Session::new(register(&targets, &SymbolTable::new()).unwrap())
    }

    #[test]
    fn nested_calls_pair_innermost_first() {
        let session = session(&[&OUTER]);
        session.on_start(&OUTER);
        thread::sleep(Duration::from_millis(2));
        session.on_start(&OUTER);
        thread::sleep(Duration::from_millis(1));
        session.on_exit(&OUTER);
        session.on_exit(&OUTER);

        let aggregate = session.drain(None);
        let durations = aggregate.entries()[0].durations();
        assert_eq!(durations.len(), 2);
        assert!(durations[0] <= durations[1], "{durations:?}");
        assert!(durations[1] >= 3_000_000, "{durations:?}");
    }

    #[test]
    fn unregistered_code_is_ignored() {
        let session = session(&[&OUTER]);
        session.on_start(&STRANGER);
        session.on_exit(&STRANGER);

        let aggregate = session.drain(None);
        assert_eq!(aggregate.entries().len(), 1);
        assert_eq!(aggregate.entries()[0].calls(), 0);
        assert_eq!(aggregate.unmatched_exits(), 0);
    }

    #[test]
    fn unmatched_exit_is_counted_without_touching_others() {
        let session = session(&[&OUTER, &INNER]);
        session.on_start(&OUTER);
        session.on_exit(&INNER);
        session.on_exit(&OUTER);

        let aggregate = session.drain(Some("edge".into()));
        assert_eq!(aggregate.label(), Some("edge"));
        assert_eq!(aggregate.unmatched_exits(), 1);
        assert_eq!(aggregate.get(OUTER.id()).unwrap().calls(), 1);
        assert_eq!(aggregate.get(INNER.id()).unwrap().calls(), 0);
    }

    #[test]
    fn open_entries_are_discarded_on_drain() {
        let session = session(&[&OUTER]);
        session.on_start(&OUTER);
        session.on_start(&OUTER);
        session.on_exit(&OUTER);

        let aggregate = session.drain(None);
        assert_eq!(aggregate.entries()[0].calls(), 1);
        assert_eq!(aggregate.discarded_entries(), 1);
    }

    #[test]
    fn drain_leaves_session_empty() {
        let session = session(&[&OUTER]);
        session.on_start(&OUTER);
        session.on_exit(&OUTER);
        assert_eq!(session.drain(None).entries()[0].calls(), 1);

        let again = session.drain(None);
        assert_eq!(again.entries().len(), 1);
        assert_eq!(again.entries()[0].calls(), 0);
    }

    #[test]
    fn threads_keep_separate_stacks() {
        let session = Arc::new(session(&[&OUTER]));
        session.on_start(&OUTER);

        let worker = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                // No entry on this thread: must not pop the main thread's.
                session.on_exit(&OUTER);
                session.on_start(&OUTER);
                session.on_exit(&OUTER);
            })
        };
        worker.join().unwrap();
        session.on_exit(&OUTER);

        let aggregate = session.drain(None);
        assert_eq!(aggregate.entries()[0].calls(), 2);
        assert_eq!(aggregate.unmatched_exits(), 1);
        assert_eq!(aggregate.discarded_entries(), 0);
    }
}
