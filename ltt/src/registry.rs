//! Trace registry.
//!
//! The registry owns every trace, the transports and the functor slots.
//!
//! # Concurrency
//!
//! The logging path walks an immutable snapshot of the trace list loaded from
//! an [`ArcSwap`]; it never locks. Administrative calls serialize on one
//! mutex, publish a new snapshot, and (for destroy) wait outside the mutex
//! until no traversal still holds a snapshot listing the trace before
//! tearing it down.
//!
//! ```text
//! log_event ──load──▶ [Arc<Trace>, ...] ──▶ run_filter ──▶ channel ──▶ cpu buffer
//!                          ▲
//! create/destroy ──swap────┘  (admin mutex)
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{info, warn};

use crate::channel::ChannelKind;
use crate::config::{RegistryConfig, TraceConfig, DEFAULT_TRANSPORT};
use crate::error::{TraceError, TraceResult};
use crate::facilities::tracer;
use crate::facility::Facility;
use crate::functor::{FilterOp, Functor, FunctorRegistry, FunctorSlot};
use crate::header::{event_layout, Field};
use crate::heartbeat;
use crate::output::{self, TraceStats};
use crate::reader::ChannelReader;
use crate::timer::DeliveryTimer;
use crate::timestamp;
use crate::trace::Trace;
use crate::transport::{RelayTransport, Transport};

/// Administrative operations accepted by [`TraceRegistry::control`].
#[derive(Clone, Debug)]
pub enum ControlOp {
    Create(TraceConfig),
    Start,
    Stop,
    Destroy,
}

/// State read by the logging path and the delivery timer.
struct Shared {
    traces: ArcSwap<Vec<Arc<Trace>>>,
    functors: FunctorRegistry,
    config: RegistryConfig,
}

/// State changed only under the admin mutex.
///
/// A blocking mutex: holders allocate channel memory and spawn the timer.
struct Admin {
    transports: BTreeMap<String, Arc<dyn Transport>>,
    active: usize,
    timer: Option<DeliveryTimer>,
}

pub struct TraceRegistry {
    shared: Arc<Shared>,
    admin: Mutex<Admin>,
    /// Serializes user-space writes.
    user_write: Mutex<()>,
    relay: Arc<RelayTransport>,
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl TraceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        timestamp::init();
        crate::facilities::init();

        let wrap = Duration::from_nanos(heartbeat::wrap_period_nanos());
        let period = config.tick.checked_mul(config.heartbeat_ticks);
        if period.map_or(true, |period| period >= wrap) {
            warn!(
                "LTT: heartbeat period {:?} x {} exceeds the compact timestamp wrap {:?}",
                config.tick, config.heartbeat_ticks, wrap
            );
        }

        let relay = Arc::new(RelayTransport::new());
        let mut transports: BTreeMap<String, Arc<dyn Transport>> = BTreeMap::new();
        transports.insert(DEFAULT_TRANSPORT.to_string(), relay.clone());

        Self {
            shared: Arc::new(Shared {
                traces: ArcSwap::from_pointee(Vec::new()),
                functors: FunctorRegistry::new(),
                config,
            }),
            admin: Mutex::new(Admin {
                transports,
                active: 0,
                timer: None,
            }),
            user_write: Mutex::new(()),
            relay,
        }
    }

    fn admin(&self) -> MutexGuard<'_, Admin> {
        self.admin.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// The built-in `"relay"` transport.
    pub fn relay(&self) -> &Arc<RelayTransport> {
        &self.relay
    }

    pub fn functors(&self) -> &FunctorRegistry {
        &self.shared.functors
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn trace(&self, name: &str) -> Option<Arc<Trace>> {
        self.shared.traces.load().iter().find(|t| t.name() == name).cloned()
    }

    fn find(&self, name: &str) -> TraceResult<Arc<Trace>> {
        self.trace(name).ok_or(TraceError::NotFound)
    }

    /// Names of all traces, in creation order.
    pub fn list(&self) -> Vec<String> {
        self.shared
            .traces
            .load()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn stats(&self, name: &str) -> TraceResult<TraceStats> {
        Ok(self.find(name)?.stats())
    }

    pub fn active_count(&self) -> usize {
        self.admin().active
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Dispatch an administrative operation on trace `name`.
    pub fn control(&self, name: &str, op: ControlOp) -> TraceResult<()> {
        match op {
            ControlOp::Create(config) => self.create(name, &config),
            ControlOp::Start => self.start(name),
            ControlOp::Stop => self.stop(name),
            ControlOp::Destroy => self.destroy(name).map(|_| ()),
        }
    }

    /// Create an inactive trace.
    ///
    /// Errors leave the registry and the transport exactly as they were.
    pub fn create(&self, name: &str, config: &TraceConfig) -> TraceResult<()> {
        let admin = self.admin();
        if self.shared.traces.load().iter().any(|t| t.name() == name) {
            return Err(TraceError::AlreadyExists);
        }
        let transport = admin
            .transports
            .get(&config.transport)
            .cloned()
            .ok_or(TraceError::NoTransport)?;

        let trace = Arc::new(Trace::create(name, config, &self.shared.config, transport)?);
        let mut traces = Vec::clone(&self.shared.traces.load());
        traces.push(trace);
        self.shared.traces.store(Arc::new(traces));
        drop(admin);

        info!(
            "LTT: trace {} created (mode {}, transport {})",
            name,
            config.mode.name(),
            config.transport
        );
        Ok(())
    }

    /// Activate a trace. Starting an active trace only warns.
    ///
    /// The first active trace arms the delivery timer. Once active, the trace
    /// receives the facility list and the state dump.
    pub fn start(&self, name: &str) -> TraceResult<()> {
        let mut admin = self.admin();
        let trace = self.find(name)?;
        if trace.set_active(true) {
            warn!("LTT: trace {} already started", name);
            return Ok(());
        }
        admin.active += 1;
        if admin.timer.is_none() {
            let shared = self.shared.clone();
            match DeliveryTimer::arm(shared.config.tick, move || tick(&shared)) {
                Ok(timer) => admin.timer = Some(timer),
                Err(err) => {
                    trace.set_active(false);
                    admin.active -= 1;
                    return Err(err);
                }
            }
        }
        drop(admin);

        info!("LTT: trace {} started", name);
        let facilities = tracer::dump_facilities(&trace);
        log::debug!("LTT: trace {}: {} facilities described", name, facilities);
        tracer::state_dump_marker(&trace, true);
        if let Err(err) = self.shared.functors.state_dump(&trace) {
            warn!("LTT: state dump for trace {} failed: {}", name, err);
        }
        tracer::state_dump_marker(&trace, false);
        Ok(())
    }

    /// Deactivate a trace, flush its partial sub-buffers and wake readers.
    /// Stopping an inactive trace only warns.
    pub fn stop(&self, name: &str) -> TraceResult<()> {
        let mut admin = self.admin();
        let trace = self.find(name)?;
        if !trace.set_active(false) {
            warn!("LTT: trace {} already stopped", name);
            return Ok(());
        }
        admin.active -= 1;
        let timer = if admin.active == 0 {
            admin.timer.take()
        } else {
            None
        };
        drop(admin);

        if let Some(timer) = timer {
            timer.disarm();
        }
        trace.flush();
        trace.deliver();
        info!("LTT: trace {} stopped", name);
        Ok(())
    }

    /// Remove an inactive trace and release its channels.
    ///
    /// Waits until nothing else holds the trace, then closes the channels
    /// (open readers can still drain them) and reports its losses. Writers
    /// on any snapshot that still lists the trace, including snapshots older
    /// than the one swapped out here, finish before the final flush. A caller
    /// holding an `Arc<Trace>` from [`trace`](Self::trace) delays destroy
    /// until it drops it.
    pub fn destroy(&self, name: &str) -> TraceResult<TraceStats> {
        let admin = self.admin();
        let trace = self.find(name)?;
        if trace.is_active() {
            return Err(TraceError::Busy);
        }
        let remaining: Vec<Arc<Trace>> = self
            .shared
            .traces
            .load()
            .iter()
            .filter(|t| !Arc::ptr_eq(t, &trace))
            .cloned()
            .collect();
        drop(self.shared.traces.swap(Arc::new(remaining)));
        drop(admin);

        // `swap` turned outstanding cheap loads into full references, so every
        // snapshot still in use counts here until its traversal finishes.
        while Arc::strong_count(&trace) > 1 {
            std::thread::yield_now();
        }
        let readers = trace.active_readers();
        if readers > 0 {
            info!("LTT: trace {} destroyed with {} readers attached", name, readers);
        }

        trace.flush();
        trace.deliver();
        trace.teardown();
        let stats = trace.stats();
        output::log_summary(&stats);
        info!("LTT: trace {} destroyed", name);
        Ok(stats)
    }

    /// Stop and destroy every trace.
    pub fn shutdown(&self) {
        for name in self.list() {
            if let Err(err) = self.stop(&name).and_then(|_| self.destroy(&name).map(|_| ())) {
                warn!("LTT: shutdown of trace {} failed: {}", name, err);
            }
        }
    }

    // =========================================================================
    // Modules and transports
    // =========================================================================

    /// Forward a filter request for trace `name` to the filter module.
    pub fn filter_control(&self, op: FilterOp, name: &str) -> TraceResult<()> {
        let trace = self.find(name)?;
        self.shared.functors.filter_control(op, &trace)
    }

    pub fn module_register(&self, functor: Functor, owner: &str) -> TraceResult<()> {
        self.shared.functors.register(functor, owner)
    }

    /// Restore the default functor; returns once no caller runs the old one.
    pub fn module_unregister(&self, slot: FunctorSlot) -> TraceResult<()> {
        self.shared.functors.unregister(slot)
    }

    pub fn transport_register(&self, transport: Arc<dyn Transport>) -> TraceResult<()> {
        let mut admin = self.admin();
        let name = transport.name().to_string();
        if admin.transports.contains_key(&name) {
            return Err(TraceError::AlreadyExists);
        }
        info!("LTT: transport {} registered", name);
        admin.transports.insert(name, transport);
        Ok(())
    }

    /// Remove a transport. `Busy` while a trace still uses it.
    pub fn transport_unregister(&self, name: &str) -> TraceResult<()> {
        let mut admin = self.admin();
        if !admin.transports.contains_key(name) {
            return Err(TraceError::NotFound);
        }
        if self
            .shared
            .traces
            .load()
            .iter()
            .any(|t| t.transport_name() == name)
        {
            return Err(TraceError::Busy);
        }
        admin.transports.remove(name);
        info!("LTT: transport {} unregistered", name);
        Ok(())
    }

    pub fn transports(&self) -> Vec<String> {
        self.admin().transports.keys().cloned().collect()
    }

    // =========================================================================
    // Logging
    // =========================================================================

    /// Log an event to every active trace.
    ///
    /// Never blocks, allocates or locks. A full buffer only bumps its
    /// `events_lost` counter.
    #[inline]
    pub fn log_event(&self, facility: &Facility, event_id: u8, fields: &[Field<'_>]) {
        if !facility.is_event_enabled(event_id) {
            return;
        }
        self.log_event_on(facility.channel, facility.id, event_id, fields);
    }

    /// Log an event to channel `kind` of every active trace, bypassing the
    /// facility enable bits.
    pub fn log_event_on(&self, kind: ChannelKind, facility_id: u8, event_id: u8, fields: &[Field<'_>]) {
        let traces = self.shared.traces.load();
        for trace in traces.iter() {
            if !trace.is_active() {
                continue;
            }
            if !self.shared.functors.run_filter(trace, facility_id, event_id) {
                continue;
            }
            let _ = trace.write_event(kind, facility_id, event_id, fields);
        }
    }

    /// Write an opaque payload on behalf of an external writer.
    ///
    /// Unlike [`log_event`](Self::log_event) this may sleep: it waits up to
    /// the configured timeout for room in a non-overwriting buffer. Writes to
    /// an inactive trace are dropped.
    pub fn user_write(
        &self,
        name: &str,
        kind: ChannelKind,
        facility_id: u8,
        event_id: u8,
        payload: &[u8],
    ) -> TraceResult<()> {
        let trace = self.find(name)?;
        if !trace.is_active() {
            return Ok(());
        }
        let _serial = self.user_write.lock().unwrap_or_else(|e| e.into_inner());

        let fields = [Field::bytes(payload)];
        let buffer = trace.channel(kind).current_buffer();
        // Worst case: the header lands on the least aligned offset.
        let size = event_layout(1, trace.format(), &fields).slot_size;
        if size + crate::format::SUBBUF_HEADER_SIZE > buffer.subbuf_size() {
            return Err(TraceError::InvalidArgument);
        }

        let deadline = Instant::now() + self.shared.config.user_write_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let admitted = trace.transport().user_blocking(buffer, size, remaining);
            let reserved = admitted.and_then(|_| trace.transport().try_reserve_slot(buffer, &fields));
            match reserved {
                Ok(slot) => {
                    buffer.write_slot(&slot, facility_id, event_id, &fields);
                    trace.transport().commit_slot(buffer, slot);
                    return Ok(());
                }
                Err(TraceError::NoSpace) if Instant::now() < deadline => continue,
                Err(TraceError::NoSpace) | Err(TraceError::Timeout) => {
                    // Retries are not losses; giving up is one.
                    buffer.record_lost();
                    return Err(TraceError::Timeout);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Attach a reader to CPU `cpu` of channel `kind` of trace `name`.
    pub fn open_reader(&self, name: &str, kind: ChannelKind, cpu: usize) -> TraceResult<ChannelReader> {
        let trace = self.find(name)?;
        ChannelReader::new(trace.channel(kind).clone(), cpu)
    }
}

impl Drop for TraceRegistry {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(timer) = self.admin().timer.take() {
            timer.disarm();
        }
    }
}

/// One delivery timer period: heartbeats, then reader wakeups.
fn tick(shared: &Shared) {
    let traces = shared.traces.load_full();
    for trace in traces.iter() {
        if trace.format().heartbeat
            && trace.is_active()
            && trace.heartbeat_due(shared.config.heartbeat_ticks)
        {
            heartbeat::emit(trace);
        }
        trace.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelSizing, TraceMode};

    fn small() -> TraceConfig {
        TraceConfig::new(TraceMode::Normal)
            .num_cpus(1)
            .all_channels(ChannelSizing::new(1024, 2))
    }

    #[test]
    fn test_duplicate_create_leaves_registry_unchanged() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        assert_eq!(registry.create("a", &small()), Err(TraceError::AlreadyExists));
        assert_eq!(registry.list(), vec!["a".to_string()]);
        assert_eq!(registry.relay().directories(), vec!["a".to_string()]);
    }

    #[test]
    fn test_unknown_transport() {
        let registry = TraceRegistry::default();
        let config = small().transport("disk");
        assert_eq!(registry.create("a", &config), Err(TraceError::NoTransport));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_start_stop_warn_but_succeed() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        assert_eq!(registry.start("missing"), Err(TraceError::NotFound));

        registry.stop("a").unwrap();
        registry.start("a").unwrap();
        registry.start("a").unwrap();
        assert_eq!(registry.active_count(), 1);
        registry.stop("a").unwrap();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_destroy_active_is_busy() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        registry.start("a").unwrap();
        assert_eq!(registry.destroy("a").unwrap_err(), TraceError::Busy);
        assert_eq!(registry.list().len(), 1);

        registry.stop("a").unwrap();
        registry.destroy("a").unwrap();
        assert!(registry.list().is_empty());
        assert!(registry.relay().directories().is_empty());
        assert_eq!(registry.destroy("a").unwrap_err(), TraceError::NotFound);
    }

    #[test]
    fn test_start_writes_facility_list() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        registry.start("a").unwrap();
        let stats = registry.stats("a").unwrap();
        assert!(stats.channel(ChannelKind::Facilities).unwrap().committed() > 0);
        registry.stop("a").unwrap();
    }

    #[test]
    fn test_filter_control_without_module() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        assert_eq!(
            registry.filter_control(FilterOp::DefaultReject, "a"),
            Err(TraceError::NoModule)
        );
        assert_eq!(
            registry.filter_control(FilterOp::DefaultReject, "b"),
            Err(TraceError::NotFound)
        );
    }

    #[test]
    fn test_transport_in_use_cannot_be_removed() {
        let registry = TraceRegistry::default();
        registry.create("a", &small()).unwrap();
        assert_eq!(registry.transport_unregister("relay"), Err(TraceError::Busy));
        assert_eq!(registry.transport_unregister("nfs"), Err(TraceError::NotFound));
        registry.destroy("a").unwrap();
        registry.transport_unregister("relay").unwrap();
        assert!(registry.transports().is_empty());
    }

    #[test]
    fn test_destroy_waits_for_older_snapshots() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(TraceRegistry::default());
        registry.create("a", &small()).unwrap();
        // A traversal that loaded the list before "b" existed.
        let stale = registry.shared.traces.load_full();
        registry.create("b", &small()).unwrap();

        let destroyed = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = registry.clone();
            let destroyed = destroyed.clone();
            std::thread::spawn(move || {
                registry.destroy("a").unwrap();
                destroyed.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!destroyed.load(Ordering::SeqCst));
        assert_eq!(registry.list(), vec!["b".to_string()]);

        drop(stale);
        handle.join().unwrap();
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_creates() {
        let registry = Arc::new(TraceRegistry::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let config = small().all_channels(ChannelSizing::new(64 * 1024, 4));
                    registry.create(&format!("t{}", i), &config)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(registry.list().len(), 4);
        assert_eq!(registry.relay().directories().len(), 4);
    }
}
