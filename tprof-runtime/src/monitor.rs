//! Process-wide instrumentation facility.
//!
//! Instrumented functions report `Start` on entry and `Return` or `Unwind` on
//! exit. Subscribers ("tools") claim one of a fixed set of slots, attach a
//! callback per event, and then enable the events they want. Events fire for
//! every instrumented function in the process; filtering is up to the tool.
//!
//! When no tool listens for an event, firing it costs one relaxed atomic load.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::code::Code;
use crate::error::Error;

/// A subscriber slot.
///
/// Other tools in the same process claim their own slots, so a debugger or
/// coverage recorder can watch frames while a profiling region is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToolId(u8);

impl ToolId {
    pub const DEBUGGER: ToolId = ToolId(0);
    pub const COVERAGE: ToolId = ToolId(1);
    /// Reserved for the call-time profiler.
    pub const PROFILER: ToolId = ToolId(2);

    /// Number of slots.
    pub const COUNT: usize = 6;

    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < Self::COUNT).then_some(ToolId(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// An instrumented function was entered.
    Start,
    /// An instrumented function returned normally.
    Return,
    /// An instrumented function is being unwound by a panic.
    Unwind,
}

impl Event {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Event::Start => 0,
            Event::Return => 1,
            Event::Unwind => 2,
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Event::Start => 1,
            Event::Return => 1 << 1,
            Event::Unwind => 1 << 2,
        }
    }
}

/// A set of [`Event`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);
    pub const ALL: EventSet =
        EventSet(Event::Start.bit() | Event::Return.bit() | Event::Unwind.bit());

    #[must_use]
    pub const fn with(self, event: Event) -> Self {
        EventSet(self.0 | event.bit())
    }

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        iter.into_iter().fold(EventSet::EMPTY, EventSet::with)
    }
}

pub type Callback = Arc<dyn Fn(&'static Code) + Send + Sync>;

struct Slot {
    holder: Option<String>,
    events: EventSet,
    callbacks: [Option<Callback>; Event::COUNT],
}

const VACANT: Slot = Slot {
    holder: None,
    events: EventSet::EMPTY,
    callbacks: [None, None, None],
};

static SLOTS: RwLock<[Slot; ToolId::COUNT]> = RwLock::new([VACANT; ToolId::COUNT]);

/// Union of the enabled events of every slot.
static ACTIVE: AtomicU8 = AtomicU8::new(0);

fn refresh_active(slots: &[Slot; ToolId::COUNT]) {
    let mask = slots.iter().fold(0, |mask, slot| mask | slot.events.0);
    ACTIVE.store(mask, Ordering::Release);
}

pub(crate) fn active_events() -> EventSet {
    EventSet(ACTIVE.load(Ordering::Acquire))
}

/// Name of the tool currently holding `id`, if any.
pub fn tool_holder(id: ToolId) -> Option<String> {
    let slots = SLOTS.read().unwrap_or_else(|e| e.into_inner());
    slots[id.0 as usize].holder.clone()
}

/// Claim slot `id` for the tool called `name`.
///
/// The slot stays taken until the returned lease is dropped.
pub fn use_tool_id(id: ToolId, name: &str) -> Result<ToolLease, Error> {
    let mut slots = SLOTS.write().unwrap_or_else(|e| e.into_inner());
    let slot = &mut slots[id.0 as usize];
    if let Some(holder) = &slot.holder {
        return Err(Error::ToolInUse {
            id: id.0,
            holder: holder.clone(),
        });
    }
    slot.holder = Some(name.to_owned());
    tracing::trace!(tool = id.0, name, "tool id acquired");
    Ok(ToolLease { id })
}

/// Exclusive hold on one subscriber slot.
///
/// Dropping the lease disables its events, unregisters its callbacks and frees
/// the slot, in that order.
#[must_use = "dropping the lease frees the tool id immediately"]
#[derive(Debug)]
pub struct ToolLease {
    id: ToolId,
}

impl ToolLease {
    pub fn id(&self) -> ToolId {
        self.id
    }

    /// Attach `callback` to `event`, returning the one it replaces.
    /// `None` unregisters.
    pub fn register_callback(&self, event: Event, callback: Option<Callback>) -> Option<Callback> {
        let mut slots = SLOTS.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(
            &mut slots[self.id.0 as usize].callbacks[event.index()],
            callback,
        )
    }

    pub fn set_events(&self, events: EventSet) {
        let mut slots = SLOTS.write().unwrap_or_else(|e| e.into_inner());
        slots[self.id.0 as usize].events = events;
        refresh_active(&slots);
    }

    pub fn events(&self) -> EventSet {
        let slots = SLOTS.read().unwrap_or_else(|e| e.into_inner());
        slots[self.id.0 as usize].events
    }
}

impl Drop for ToolLease {
    fn drop(&mut self) {
        let mut slots = SLOTS.write().unwrap_or_else(|e| e.into_inner());
        slots[self.id.0 as usize].events = EventSet::EMPTY;
        refresh_active(&slots);
        let slot = &mut slots[self.id.0 as usize];
        slot.callbacks = [None, None, None];
        slot.holder = None;
        tracing::trace!(tool = self.id.0, "tool id released");
    }
}

fn fire(event: Event, code: &'static Code) {
    if ACTIVE.load(Ordering::Relaxed) & event.bit() == 0 {
        return;
    }
    // Callbacks run outside the lock so they may touch the facility themselves.
    let callbacks: [Option<Callback>; ToolId::COUNT] = {
        let slots = SLOTS.read().unwrap_or_else(|e| e.into_inner());
        std::array::from_fn(|i| {
            let slot = &slots[i];
            if slot.events.contains(event) {
                slot.callbacks[event.index()].clone()
            } else {
                None
            }
        })
    };
    for callback in callbacks.iter().flatten() {
        callback(code);
    }
}

/// An open call of an instrumented function.
///
/// Dropping the frame reports the exit: `Unwind` while the thread is
/// panicking, `Return` otherwise.
#[must_use = "dropping the frame immediately records an empty call; bind it with `let _frame = ...`"]
pub struct Frame {
    code: &'static Code,
}

impl Drop for Frame {
    fn drop(&mut self) {
        let event = if std::thread::panicking() {
            Event::Unwind
        } else {
            Event::Return
        };
        fire(event, self.code);
    }
}

/// Report entry into `code`.
pub fn enter(code: &'static Code) -> Frame {
    fire(Event::Start, code);
    Frame { code }
}

/// Run `f` as a call of `code`.
pub fn call<R>(code: &'static Code, f: impl FnOnce() -> R) -> R {
    let _frame = enter(code);
    f()
}
