//! Linux Trace Toolkit tracer core.
//!
//! Probes log binary events into per-CPU ring buffers grouped in six channels
//! per trace. Writers reserve space with a lock-free compare-and-swap on the
//! buffer's write offset and commit with an atomic add; readers consume whole
//! sub-buffers once every byte in them has been committed.
//!
//! ```rust,ignore
//! let registry = ltt::init().ok_or(TraceError::NoMemory)?;
//! registry.create("t0", &TraceConfig::new(TraceMode::Normal))?;
//! registry.start("t0")?;
//! ltt::ltt_event!(ltt::facilities::SCHED_FACILITY, sched::WAKEUP, pid, cpu);
//! registry.stop("t0")?;
//! ```

#[macro_use]
mod macros;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod facilities;
pub mod facility;
pub mod filter;
pub mod format;
pub mod functor;
pub mod header;
pub mod heartbeat;
pub mod output;
pub mod percpu;
pub mod reader;
pub mod registry;
pub mod timer;
pub mod timestamp;
pub mod trace;
pub mod transport;

use conquer_once::spin::OnceCell;

pub use buffer::{RingBuffer, Slot};
pub use channel::{Channel, ChannelKind, CHANNEL_COUNT};
pub use config::{ChannelSizing, RegistryConfig, TraceConfig, TraceMode, TrafficClass};
pub use error::{TraceError, TraceResult};
pub use facility::{register_facility, unregister_facility, Facility};
pub use filter::FacilityFilter;
pub use functor::{FilterControl, FilterOp, Functor, FunctorSlot, RunFilter, StateDump};
pub use header::{EventHeader, Field, HeaderFormat};
pub use output::{BufferStats, ChannelStats, TraceStats};
pub use reader::{ChannelReader, RawEvent, Subbuffer};
pub use registry::{ControlOp, TraceRegistry};
pub use trace::Trace;
pub use transport::{RelayTransport, Transport};

static REGISTRY: OnceCell<TraceRegistry> = OnceCell::uninit();

/// Initialize the global registry with default settings.
pub fn init() -> Option<&'static TraceRegistry> {
    init_with(RegistryConfig::default())
}

/// Initialize the global registry. Later calls return the first registry and
/// ignore `config`.
///
/// `None` only if a previous initialization panicked.
pub fn init_with(config: RegistryConfig) -> Option<&'static TraceRegistry> {
    if REGISTRY
        .try_init_once(|| TraceRegistry::new(config))
        .is_ok()
    {
        log::info!("LTT: tracer initialized");
    }
    REGISTRY.get()
}

/// The global registry, if initialized.
#[inline]
pub fn registry() -> Option<&'static TraceRegistry> {
    REGISTRY.try_get().ok()
}

/// Log an event to every active trace of the global registry.
///
/// Does nothing before [`init`].
#[inline]
pub fn log_event(facility: &Facility, event_id: u8, fields: &[Field<'_>]) {
    if let Ok(registry) = REGISTRY.try_get() {
        registry.log_event(facility, event_id, fields);
    }
}
