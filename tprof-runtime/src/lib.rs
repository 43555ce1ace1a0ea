//! Runtime for tprof: call-time profiling of selected functions.
//!
//! Instrumented functions open a [`Frame`] with [`enter`] on a `static`
//! [`Code`]. A [`profile`] region resolves its targets, subscribes to the
//! entry and exit events of those functions, and on [`Region::finish`] prints
//! a per-target table of call counts and timings (or hands the raw durations
//! to a callback).

mod code;
mod collector;
mod error;
pub mod monitor;
mod region;
mod registry;
pub mod report;

pub use code::{Code, CodeId};
pub use collector::{Aggregate, CallTimes};
pub use error::{Error, ErrorKind};
pub use monitor::{call, enter, Frame};
pub use region::{profile, Outcome, Profile, Region, ResultCallback, TOOL_NAME};
pub use registry::{
    extract_code, register, CallOperator, Function, Method, Object, Registry, SymbolTable, Target,
    TargetRecord, UNKNOWN_MODULE,
};
