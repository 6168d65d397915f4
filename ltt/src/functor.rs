//! Pluggable functors.
//!
//! Optional modules hook into the tracer through three fixed slots:
//!
//! | Slot             | Called                                | Default        |
//! |------------------|---------------------------------------|----------------|
//! | `RunFilter`      | for every event, per active trace     | accept all     |
//! | `FilterControl`  | by [`filter_control`] administration  | `NoModule`     |
//! | `StateDump`      | once when a trace starts              | no-op          |
//!
//! Each slot always holds a functor, so callers never branch on "installed".
//! Callers load the slot without locking; unregistering swaps the default back
//! in and waits until no caller still holds the old functor.
//!
//! [`filter_control`]: crate::registry::TraceRegistry::filter_control

use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, info};
use spin::Mutex;

use crate::error::{TraceError, TraceResult};
use crate::trace::Trace;

/// Requests understood by a filter-control functor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOp {
    /// Events not matched by any rule are logged.
    DefaultAccept,
    /// Events not matched by any rule are dropped.
    DefaultReject,
}

/// Decides per event whether `trace` records it. Runs on the logging path:
/// must not block or allocate.
pub trait RunFilter: Send + Sync {
    fn run_filter(&self, trace: &Trace, facility_id: u8, event_id: u8) -> bool;
}

/// Administrative control of a filter.
pub trait FilterControl: Send + Sync {
    fn filter_control(&self, op: FilterOp, trace: &Trace) -> TraceResult<()>;
}

/// Writes a snapshot of system state into a trace that just started.
pub trait StateDump: Send + Sync {
    fn state_dump(&self, trace: &Trace) -> TraceResult<()>;
}

/// Slot identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctorSlot {
    RunFilter,
    FilterControl,
    StateDump,
}

impl FunctorSlot {
    pub const fn name(&self) -> &'static str {
        match self {
            FunctorSlot::RunFilter => "run_filter",
            FunctorSlot::FilterControl => "filter_control",
            FunctorSlot::StateDump => "state_dump",
        }
    }
}

/// A functor ready to be installed in its slot.
#[derive(Clone)]
pub enum Functor {
    RunFilter(Arc<dyn RunFilter>),
    FilterControl(Arc<dyn FilterControl>),
    StateDump(Arc<dyn StateDump>),
}

impl Functor {
    pub fn slot(&self) -> FunctorSlot {
        match self {
            Functor::RunFilter(_) => FunctorSlot::RunFilter,
            Functor::FilterControl(_) => FunctorSlot::FilterControl,
            Functor::StateDump(_) => FunctorSlot::StateDump,
        }
    }
}

// =============================================================================
// Defaults
// =============================================================================

struct AcceptAll;

impl RunFilter for AcceptAll {
    #[inline(always)]
    fn run_filter(&self, _trace: &Trace, _facility_id: u8, _event_id: u8) -> bool {
        true
    }
}

struct NoFilterModule;

impl FilterControl for NoFilterModule {
    fn filter_control(&self, _op: FilterOp, _trace: &Trace) -> TraceResult<()> {
        Err(TraceError::NoModule)
    }
}

struct NoStateDump;

impl StateDump for NoStateDump {
    fn state_dump(&self, _trace: &Trace) -> TraceResult<()> {
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Contents of a slot. `owner` is `None` for the default.
struct Installed<T: ?Sized> {
    functor: Arc<T>,
    owner: Option<String>,
}

impl<T: ?Sized> Installed<T> {
    fn default_of(functor: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            functor,
            owner: None,
        })
    }
}

/// Swap the default into `slot` and wait for callers of the old functor.
fn restore_default<T: ?Sized>(slot: &ArcSwap<Installed<T>>, default: Arc<T>) -> TraceResult<String> {
    let current = slot.load();
    if current.owner.is_none() {
        return Err(TraceError::NotFound);
    }
    drop(current);

    let old = slot.swap(Installed::default_of(default));
    // `swap` settles every outstanding lightweight load of the old value, so
    // the strong count covers all in-flight callers.
    while Arc::strong_count(&old) > 1 {
        std::thread::yield_now();
    }
    Ok(old.owner.clone().unwrap_or_default())
}

/// The three functor slots.
pub struct FunctorRegistry {
    run_filter: ArcSwap<Installed<dyn RunFilter>>,
    filter_control: ArcSwap<Installed<dyn FilterControl>>,
    state_dump: ArcSwap<Installed<dyn StateDump>>,
    /// Serializes register/unregister.
    admin: Mutex<()>,
}

impl Default for FunctorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctorRegistry {
    pub fn new() -> Self {
        Self {
            run_filter: ArcSwap::new(Installed::default_of(Arc::new(AcceptAll) as Arc<dyn RunFilter>)),
            filter_control: ArcSwap::new(Installed::default_of(
                Arc::new(NoFilterModule) as Arc<dyn FilterControl>
            )),
            state_dump: ArcSwap::new(Installed::default_of(Arc::new(NoStateDump) as Arc<dyn StateDump>)),
            admin: Mutex::new(()),
        }
    }

    /// Install `functor` in its slot on behalf of `owner`.
    ///
    /// Fails with `AlreadyExists` if another module holds the slot.
    pub fn register(&self, functor: Functor, owner: &str) -> TraceResult<()> {
        let _admin = self.admin.lock();
        let slot = functor.slot();
        let occupied = match slot {
            FunctorSlot::RunFilter => self.run_filter.load().owner.is_some(),
            FunctorSlot::FilterControl => self.filter_control.load().owner.is_some(),
            FunctorSlot::StateDump => self.state_dump.load().owner.is_some(),
        };
        if occupied {
            return Err(TraceError::AlreadyExists);
        }

        let owner = Some(owner.to_string());
        match functor {
            Functor::RunFilter(functor) => self.run_filter.store(Arc::new(Installed { functor, owner })),
            Functor::FilterControl(functor) => self
                .filter_control
                .store(Arc::new(Installed { functor, owner })),
            Functor::StateDump(functor) => self.state_dump.store(Arc::new(Installed { functor, owner })),
        }
        info!("LTT: functor {} registered", slot.name());
        Ok(())
    }

    /// Restore the default of `slot`.
    ///
    /// Blocks until no caller still runs the functor being removed, so the
    /// owner may free its state afterwards. `NotFound` if the slot already
    /// holds its default.
    pub fn unregister(&self, slot: FunctorSlot) -> TraceResult<()> {
        let _admin = self.admin.lock();
        let owner = match slot {
            FunctorSlot::RunFilter => restore_default(&self.run_filter, Arc::new(AcceptAll) as Arc<dyn RunFilter>)?,
            FunctorSlot::FilterControl => {
                restore_default(&self.filter_control, Arc::new(NoFilterModule) as Arc<dyn FilterControl>)?
            }
            FunctorSlot::StateDump => {
                restore_default(&self.state_dump, Arc::new(NoStateDump) as Arc<dyn StateDump>)?
            }
        };
        info!("LTT: functor {} unregistered (owner {})", slot.name(), owner);
        Ok(())
    }

    /// Owner of `slot`, `None` while it holds the default.
    pub fn owner(&self, slot: FunctorSlot) -> Option<String> {
        match slot {
            FunctorSlot::RunFilter => self.run_filter.load().owner.clone(),
            FunctorSlot::FilterControl => self.filter_control.load().owner.clone(),
            FunctorSlot::StateDump => self.state_dump.load().owner.clone(),
        }
    }

    /// Run the installed event filter.
    #[inline]
    pub fn run_filter(&self, trace: &Trace, facility_id: u8, event_id: u8) -> bool {
        let installed = self.run_filter.load_full();
        installed.functor.run_filter(trace, facility_id, event_id)
    }

    pub fn filter_control(&self, op: FilterOp, trace: &Trace) -> TraceResult<()> {
        let installed = self.filter_control.load_full();
        installed.functor.filter_control(op, trace)
    }

    pub fn state_dump(&self, trace: &Trace) -> TraceResult<()> {
        let installed = self.state_dump.load_full();
        debug!("LTT: state dump for trace {}", trace.name());
        installed.functor.state_dump(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelSizing, RegistryConfig, TraceConfig};
    use crate::transport::RelayTransport;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn trace() -> Trace {
        let config = TraceConfig::default()
            .num_cpus(1)
            .all_channels(ChannelSizing::new(512, 2));
        Trace::create("functor-test", &config, &RegistryConfig::default(), Arc::new(RelayTransport::new()))
            .unwrap()
    }

    struct OnlyFacility(u8);

    impl RunFilter for OnlyFacility {
        fn run_filter(&self, _trace: &Trace, facility_id: u8, _event_id: u8) -> bool {
            facility_id == self.0
        }
    }

    struct CountingDump(AtomicUsize);

    impl StateDump for CountingDump {
        fn state_dump(&self, _trace: &Trace) -> TraceResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_defaults() {
        let functors = FunctorRegistry::new();
        let t = trace();
        assert!(functors.run_filter(&t, 9, 9));
        assert_eq!(
            functors.filter_control(FilterOp::DefaultReject, &t),
            Err(TraceError::NoModule)
        );
        assert!(functors.state_dump(&t).is_ok());
        assert_eq!(functors.owner(FunctorSlot::RunFilter), None);
    }

    #[test]
    fn test_register_occupies_slot() {
        let functors = FunctorRegistry::new();
        let t = trace();
        functors
            .register(Functor::RunFilter(Arc::new(OnlyFacility(2))), "mod_a")
            .unwrap();
        assert_eq!(functors.owner(FunctorSlot::RunFilter).as_deref(), Some("mod_a"));
        assert!(functors.run_filter(&t, 2, 0));
        assert!(!functors.run_filter(&t, 3, 0));

        let again = functors.register(Functor::RunFilter(Arc::new(OnlyFacility(3))), "mod_b");
        assert_eq!(again, Err(TraceError::AlreadyExists));
        assert!(!functors.run_filter(&t, 3, 0));
    }

    #[test]
    fn test_unregister_restores_default() {
        let functors = FunctorRegistry::new();
        let t = trace();
        let dump = Arc::new(CountingDump(AtomicUsize::new(0)));
        functors.register(Functor::StateDump(dump.clone()), "dumper").unwrap();
        functors.state_dump(&t).unwrap();
        assert_eq!(dump.0.load(Ordering::SeqCst), 1);

        functors.unregister(FunctorSlot::StateDump).unwrap();
        functors.state_dump(&t).unwrap();
        assert_eq!(dump.0.load(Ordering::SeqCst), 1);
        // The registry no longer holds a reference.
        assert_eq!(Arc::strong_count(&dump), 1);

        assert_eq!(functors.unregister(FunctorSlot::StateDump), Err(TraceError::NotFound));
    }
}
