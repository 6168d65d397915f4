//! Heartbeat events.
//!
//! Traces created with `heartbeat` store only the low 32 bits of the cycle
//! counter in each event header. At 1 GHz those wrap every ~4.3 seconds, so
//! the delivery timer periodically writes a `core.heartbeat` event carrying the
//! full counter into every CPU buffer of every channel. Readers extend each
//! compact timestamp from the event before it, so no buffer may go a full
//! wrap period without an event, however quiet its channel. Each sub-buffer
//! header also records a full begin timestamp, which seeds the extension.

use crate::channel::ChannelKind;
use crate::facilities::tracer::{FACILITY_ID, HEARTBEAT};
use crate::header::Field;
use crate::timestamp;
use crate::trace::Trace;

/// Write a heartbeat into each CPU buffer of every channel of `trace`.
///
/// Returns the number of buffers that took the event.
pub fn emit(trace: &Trace) -> usize {
    let tsc = timestamp::trace_timestamp();
    let fields = [Field::scalar(&tsc)];
    let mut written = 0;
    for kind in ChannelKind::ALL {
        let cpus = trace.channel(kind).num_cpus();
        written += (0..cpus)
            .filter(|&cpu| {
                trace
                    .write_event_on(kind, cpu, FACILITY_ID, HEARTBEAT, &fields)
                    .is_ok()
            })
            .count();
    }
    written
}

/// Time for the low 32 bits of the cycle counter to wrap, in nanoseconds.
pub fn wrap_period_nanos() -> u64 {
    timestamp::timestamp_to_nanos(1u64 << 32)
}

/// Extend a 32-bit timestamp using the last full timestamp seen before it.
///
/// Assumes less than one wrap period separates the two.
#[inline]
pub fn extend_timestamp(previous: u64, low: u32) -> u64 {
    let candidate = (previous & !0xFFFF_FFFF) | u64::from(low);
    if candidate < previous {
        candidate + (1u64 << 32)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{ChannelSizing, RegistryConfig, TraceConfig, TraceMode};
    use crate::transport::RelayTransport;

    #[test]
    fn test_emit_reaches_every_channel() {
        let config = TraceConfig::new(TraceMode::Normal)
            .num_cpus(2)
            .heartbeat(true)
            .all_channels(ChannelSizing::new(512, 2));
        let relay = Arc::new(RelayTransport::new());
        let trace = Trace::create("hb", &config, &RegistryConfig::default(), relay).unwrap();

        assert_eq!(emit(&trace), ChannelKind::ALL.len() * 2);
        for kind in ChannelKind::ALL {
            for buffer in trace.channel(kind).buffers() {
                assert!(buffer.stats().committed > 0, "{:?} cpu {}", kind, buffer.cpu());
            }
        }
    }

    #[test]
    fn test_wrap_period() {
        assert_eq!(wrap_period_nanos(), 4_294_967_296);
    }

    #[test]
    fn test_extend_timestamp() {
        assert_eq!(extend_timestamp(0x1_0000_0010, 0x20), 0x1_0000_0020);
        // low bits wrapped since `previous`
        assert_eq!(extend_timestamp(0x1_FFFF_FFF0, 0x05), 0x2_0000_0005);
        assert_eq!(extend_timestamp(7, 7), 7);
    }
}
