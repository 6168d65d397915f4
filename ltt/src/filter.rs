//! Facility filter module.
//!
//! An optional module that plugs into the run-filter and filter-control
//! slots. Facilities in its mask are always logged; everything else follows
//! the per-trace default set through [`FilterOp`].

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::TraceResult;
use crate::functor::{FilterControl, FilterOp, Functor, FunctorRegistry, FunctorSlot, RunFilter};
use crate::trace::Trace;

/// Owner name used when installing the filter.
pub const FILTER_MODULE: &str = "ltt-filter";

#[derive(Default)]
pub struct FacilityFilter {
    /// Bit N set: facility id N always passes.
    always: [AtomicU64; 4],
}

impl FacilityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let every event of `facility_id` through regardless of the default.
    pub fn allow_facility(&self, facility_id: u8) {
        self.always[facility_id as usize / 64].fetch_or(1u64 << (facility_id % 64), Ordering::Release);
    }

    pub fn clear_facility(&self, facility_id: u8) {
        self.always[facility_id as usize / 64].fetch_and(!(1u64 << (facility_id % 64)), Ordering::Release);
    }

    #[inline(always)]
    pub fn is_allowed(&self, facility_id: u8) -> bool {
        self.always[facility_id as usize / 64].load(Ordering::Relaxed) & (1u64 << (facility_id % 64)) != 0
    }

    /// Install `filter` in both slots. On failure neither slot is taken.
    pub fn install(filter: &Arc<FacilityFilter>, functors: &FunctorRegistry) -> TraceResult<()> {
        functors.register(Functor::RunFilter(filter.clone()), FILTER_MODULE)?;
        if let Err(err) = functors.register(Functor::FilterControl(filter.clone()), FILTER_MODULE) {
            let _ = functors.unregister(FunctorSlot::RunFilter);
            return Err(err);
        }
        Ok(())
    }

    /// Remove the filter from both slots, waiting for in-flight callers.
    pub fn uninstall(functors: &FunctorRegistry) -> TraceResult<()> {
        functors.unregister(FunctorSlot::FilterControl)?;
        functors.unregister(FunctorSlot::RunFilter)
    }
}

impl RunFilter for FacilityFilter {
    #[inline(always)]
    fn run_filter(&self, trace: &Trace, facility_id: u8, _event_id: u8) -> bool {
        self.is_allowed(facility_id) || trace.filter_accepts()
    }
}

impl FilterControl for FacilityFilter {
    fn filter_control(&self, op: FilterOp, trace: &Trace) -> TraceResult<()> {
        trace.set_filter_accept(op == FilterOp::DefaultAccept);
        log::debug!("LTT: trace {} filter default {:?}", trace.name(), op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelSizing, RegistryConfig, TraceConfig};
    use crate::error::TraceError;
    use crate::transport::RelayTransport;

    fn trace() -> Trace {
        let config = TraceConfig::default()
            .num_cpus(1)
            .all_channels(ChannelSizing::new(512, 2));
        Trace::create("filter-test", &config, &RegistryConfig::default(), Arc::new(RelayTransport::new()))
            .unwrap()
    }

    #[test]
    fn test_default_reject_keeps_allowed_facilities() {
        let functors = FunctorRegistry::new();
        let filter = Arc::new(FacilityFilter::new());
        FacilityFilter::install(&filter, &functors).unwrap();
        filter.allow_facility(1);

        let t = trace();
        assert!(functors.run_filter(&t, 2, 0));
        functors.filter_control(FilterOp::DefaultReject, &t).unwrap();
        assert!(!functors.run_filter(&t, 2, 0));
        assert!(functors.run_filter(&t, 1, 0));

        functors.filter_control(FilterOp::DefaultAccept, &t).unwrap();
        assert!(functors.run_filter(&t, 2, 0));
    }

    #[test]
    fn test_install_is_all_or_nothing() {
        let functors = FunctorRegistry::new();
        let first = Arc::new(FacilityFilter::new());
        FacilityFilter::install(&first, &functors).unwrap();

        let second = Arc::new(FacilityFilter::new());
        assert_eq!(
            FacilityFilter::install(&second, &functors),
            Err(TraceError::AlreadyExists)
        );

        FacilityFilter::uninstall(&functors).unwrap();
        assert!(functors.owner(FunctorSlot::RunFilter).is_none());
        assert!(functors.owner(FunctorSlot::FilterControl).is_none());
    }

    #[test]
    fn test_mask_bits() {
        let filter = FacilityFilter::new();
        filter.allow_facility(200);
        assert!(filter.is_allowed(200));
        assert!(!filter.is_allowed(199));
        filter.clear_facility(200);
        assert!(!filter.is_allowed(200));
    }
}
