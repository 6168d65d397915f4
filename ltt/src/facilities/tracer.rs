//! The tracer's own facility (`core`).
//!
//! # Events
//!
//! - `FACILITY_LOAD` (0): facility id u8, channel u8, event count u16, name bytes
//! - `HEARTBEAT` (1): full 64-bit cycle counter
//! - `STATE_DUMP_BEGIN` (2) / `STATE_DUMP_END` (3): no payload
//! - `USER_EVENT` (4): opaque bytes written from outside the process

use crate::channel::ChannelKind;
use crate::facility::{facilities, register_facility, Facility};
use crate::header::Field;
use crate::trace::Trace;

pub const FACILITY_ID: u8 = 0x00;

pub static CORE_FACILITY: Facility = Facility::new(
    "core",
    FACILITY_ID,
    ChannelKind::Facilities,
    &[
        "facility_load",
        "heartbeat",
        "state_dump_begin",
        "state_dump_end",
        "user_event",
    ],
);

pub const FACILITY_LOAD: u8 = 0;
pub const HEARTBEAT: u8 = 1;
pub const STATE_DUMP_BEGIN: u8 = 2;
pub const STATE_DUMP_END: u8 = 3;
pub const USER_EVENT: u8 = 4;

pub fn init() {
    register_facility(&CORE_FACILITY);
}

/// Write one `FACILITY_LOAD` event per registered facility into `trace`'s
/// `facilities` channel, so a reader can name every facility id it meets.
///
/// Returns the number of events written.
pub fn dump_facilities(trace: &Trace) -> usize {
    let mut written = 0;
    for facility in facilities() {
        let channel = facility.channel.index() as u8;
        let count = facility.events.len() as u16;
        let fields = [
            Field::scalar(&facility.id),
            Field::scalar(&channel),
            Field::scalar(&count),
            Field::bytes(facility.name.as_bytes()),
        ];
        if trace
            .write_event(ChannelKind::Facilities, FACILITY_ID, FACILITY_LOAD, &fields)
            .is_ok()
        {
            written += 1;
        }
    }
    written
}

/// Bracket a state dump in `trace`.
pub fn state_dump_marker(trace: &Trace, begin: bool) {
    let event = if begin { STATE_DUMP_BEGIN } else { STATE_DUMP_END };
    let _ = trace.write_event(ChannelKind::Facilities, FACILITY_ID, event, &[]);
}
