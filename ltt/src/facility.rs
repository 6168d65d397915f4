//! Facilities: named groups of events.
//!
//! A facility is a subsystem that emits events (interrupts, scheduler,
//! processes...). Each one has a facility id stored in every event header,
//! the channel its events go to, and a 256-bit enable bitmap with one bit per
//! event id.
//!
//! # Usage
//!
//! ```rust,ignore
//! pub static DISK: Facility = Facility::new("disk", 0x20, ChannelKind::Modules, &["read", "write"]);
//!
//! ltt::register_facility(&DISK);
//! if DISK.is_event_enabled(0) {
//!     ltt::log_event(&DISK, 0, &[Field::scalar(&sector)]);
//! }
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::channel::ChannelKind;

/// Number of event ids per facility.
pub const MAX_EVENTS: usize = 256;

const WORDS: usize = MAX_EVENTS / 64;

/// Maximum number of registered facilities.
pub const MAX_FACILITIES: usize = 64;

/// An event provider.
pub struct Facility {
    pub name: &'static str,
    pub id: u8,
    /// Channel that carries this facility's events.
    pub channel: ChannelKind,
    /// Names of the events, indexed by event id.
    pub events: &'static [&'static str],
    /// Bit N enables event id N. Everything starts enabled.
    enabled: [AtomicU64; WORDS],
}

impl Facility {
    pub const fn new(
        name: &'static str,
        id: u8,
        channel: ChannelKind,
        events: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            id,
            channel,
            events,
            enabled: [
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
                AtomicU64::new(u64::MAX),
            ],
        }
    }

    #[inline(always)]
    pub fn is_event_enabled(&self, event_id: u8) -> bool {
        let word = &self.enabled[event_id as usize / 64];
        word.load(Ordering::Relaxed) & (1u64 << (event_id % 64)) != 0
    }

    /// Whether any event is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.iter().any(|w| w.load(Ordering::Relaxed) != 0)
    }

    pub fn enable_event(&self, event_id: u8) {
        self.enabled[event_id as usize / 64].fetch_or(1u64 << (event_id % 64), Ordering::Release);
    }

    pub fn disable_event(&self, event_id: u8) {
        self.enabled[event_id as usize / 64].fetch_and(!(1u64 << (event_id % 64)), Ordering::Release);
    }

    pub fn enable_all(&self) {
        for word in &self.enabled {
            word.store(u64::MAX, Ordering::Release);
        }
    }

    pub fn disable_all(&self) {
        for word in &self.enabled {
            word.store(0, Ordering::Release);
        }
    }

    /// Name of `event_id`, or `"unknown"`.
    pub fn event_name(&self, event_id: u8) -> &'static str {
        self.events.get(event_id as usize).copied().unwrap_or("unknown")
    }
}

impl core::fmt::Debug for Facility {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Facility")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

// =============================================================================
// Global Facility List
// =============================================================================

static FACILITIES: Mutex<Vec<&'static Facility>> = Mutex::new(Vec::new());

/// Add a facility to the list dumped at every trace start.
///
/// Returns `false` if a facility with the same id is already registered or
/// the list is full.
pub fn register_facility(facility: &'static Facility) -> bool {
    let mut list = FACILITIES.lock();
    if list.len() >= MAX_FACILITIES || list.iter().any(|f| f.id == facility.id) {
        return false;
    }
    list.push(facility);
    true
}

/// Remove a facility by id.
pub fn unregister_facility(id: u8) -> bool {
    let mut list = FACILITIES.lock();
    let before = list.len();
    list.retain(|f| f.id != id);
    list.len() != before
}

pub fn get_facility(id: u8) -> Option<&'static Facility> {
    FACILITIES.lock().iter().copied().find(|f| f.id == id)
}

/// Snapshot of the registered facilities.
pub fn facilities() -> Vec<&'static Facility> {
    FACILITIES.lock().clone()
}
