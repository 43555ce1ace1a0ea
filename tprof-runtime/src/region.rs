//! Scoped profiling regions.
//!
//! ```
//! use tprof_runtime::{call, profile, Code};
//!
//! static WORK: Code = Code::new("demo", "work");
//!
//! fn work() -> u64 {
//!     call(&WORK, || (0..1_000u64).sum())
//! }
//!
//! let (_, aggregate) = profile([&WORK])
//!     .on_results(|_, _| {})
//!     .run(|| {
//!         work();
//!         work();
//!     })
//!     .unwrap();
//! assert_eq!(aggregate.entries()[0].calls(), 2);
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use crate::collector::{Aggregate, CallTimes, Session};
use crate::error::Error;
use crate::monitor::{self, Callback, Event, EventSet, ToolId, ToolLease};
use crate::registry::{self, SymbolTable, Target};
use crate::report::{self, Colourizer};

/// Name this tool registers its subscriber slot under.
pub const TOOL_NAME: &str = "tprof";

/// Receives the region label and the per-target durations instead of the
/// rendered report.
pub type ResultCallback = Box<dyn FnOnce(Option<&str>, &[CallTimes]) + Send>;

/// Start configuring a region that watches `targets`.
pub fn profile<I, T>(targets: I) -> Profile
where
    I: IntoIterator<Item = T>,
    T: Into<Target>,
{
    Profile {
        targets: targets.into_iter().map(Into::into).collect(),
        label: None,
        compare: false,
        on_results: None,
        symbols: SymbolTable::new(),
    }
}

/// Builder for a profiling [`Region`].
#[must_use]
pub struct Profile {
    targets: Vec<Target>,
    label: Option<String>,
    compare: bool,
    on_results: Option<ResultCallback>,
    symbols: SymbolTable,
}

impl Profile {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Add a delta column comparing every target's mean to the first one's.
    pub fn compare(mut self, compare: bool) -> Self {
        self.compare = compare;
        self
    }

    pub fn on_results(
        mut self,
        callback: impl FnOnce(Option<&str>, &[CallTimes]) + Send + 'static,
    ) -> Self {
        self.on_results = Some(Box::new(callback));
        self
    }

    /// Table used to resolve [`Target::Name`] targets.
    pub fn symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = symbols;
        self
    }

    /// Resolve the targets and start listening.
    ///
    /// Nothing is installed when this fails.
    pub fn start(self) -> Result<Region, Error> {
        let registry = registry::register(&self.targets, &self.symbols)?;
        let lease = monitor::use_tool_id(ToolId::PROFILER, TOOL_NAME)?;
        let session = Arc::new(Session::new(registry));

        let on_start: Callback = {
            let session = Arc::clone(&session);
            Arc::new(move |code| session.on_start(code))
        };
        let on_exit: Callback = {
            let session = Arc::clone(&session);
            Arc::new(move |code| session.on_exit(code))
        };
        lease.register_callback(Event::Start, Some(on_start));
        lease.register_callback(Event::Return, Some(Arc::clone(&on_exit)));
        lease.register_callback(Event::Unwind, Some(on_exit));
        lease.set_events(EventSet::ALL);

        tracing::debug!(targets = session.len(), label = ?self.label, "profiling region opened");
        Ok(Region {
            lease: Some(lease),
            session,
            label: self.label,
            compare: self.compare,
            on_results: self.on_results,
        })
    }

    /// Run `body` inside a region and report when it returns.
    ///
    /// If `body` panics the region is torn down, nothing is reported and the
    /// panic continues.
    pub fn run<R>(self, body: impl FnOnce() -> R) -> Result<(R, Aggregate), Error> {
        let region = self.start()?;
        let value = body();
        Ok((value, region.finish()))
    }

    /// Like [`run`](Self::run), but an `Err` from `body` skips the report and
    /// is returned as is.
    pub fn try_run<T, E>(self, body: impl FnOnce() -> Result<T, E>) -> Result<(T, Aggregate), E>
    where
        E: From<Error>,
    {
        let region = self.start()?;
        let value = body()?;
        Ok((value, region.finish()))
    }
}

/// An active profiling region.
///
/// Only one region can be active in the process at a time. Dropping it without
/// calling [`finish`](Region::finish) stops profiling and discards the data.
#[must_use = "dropping the region stops profiling without a report"]
pub struct Region {
    lease: Option<ToolLease>,
    session: Arc<Session>,
    label: Option<String>,
    compare: bool,
    on_results: Option<ResultCallback>,
}

impl Region {
    /// Stop profiling and hand the results to the callback, or print the
    /// report to stderr when there is none.
    pub fn finish(mut self) -> Aggregate {
        let aggregate = self.close();
        match self.on_results.take() {
            Some(callback) => callback(aggregate.label(), aggregate.entries()),
            None => {
                let table = report::render(&aggregate, self.compare, &Colourizer::new(true));
                anstream::eprint!("{table}");
            }
        }
        aggregate
    }

    fn close(&mut self) -> Aggregate {
        // Releasing the lease detaches the handlers before the data is taken.
        drop(self.lease.take());
        let aggregate = self.session.drain(self.label.clone());
        tracing::debug!(
            unmatched_exits = aggregate.unmatched_exits(),
            discarded_entries = aggregate.discarded_entries(),
            "profiling region closed"
        );
        aggregate
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.lease.is_some() {
            self.close();
            tracing::debug!("report skipped");
        }
    }
}

/// Whether a `main`-style return value counts as a successful run.
pub trait Outcome {
    fn succeeded(&self) -> bool;
}

impl Outcome for () {
    fn succeeded(&self) -> bool {
        true
    }
}

impl Outcome for ExitCode {
    fn succeeded(&self) -> bool {
        true
    }
}

impl<T, E> Outcome for Result<T, E> {
    fn succeeded(&self) -> bool {
        self.is_ok()
    }
}
