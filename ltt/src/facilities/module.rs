//! Module load/unload facility.

use crate::channel::ChannelKind;
use crate::facility::{register_facility, Facility};
use crate::header::Field;

pub const FACILITY_ID: u8 = 0x04;

pub static MODULE_FACILITY: Facility =
    Facility::new("module", FACILITY_ID, ChannelKind::Modules, &["load", "free"]);

/// Payload: module size u64, name bytes.
pub const LOAD: u8 = 0;
/// Payload: name bytes.
pub const FREE: u8 = 1;

pub fn init() {
    register_facility(&MODULE_FACILITY);
}

pub fn trace_load(name: &str, size: u64) {
    crate::log_event(
        &MODULE_FACILITY,
        LOAD,
        &[Field::scalar(&size), Field::bytes(name.as_bytes())],
    );
}

pub fn trace_free(name: &str) {
    crate::log_event(&MODULE_FACILITY, FREE, &[Field::bytes(name.as_bytes())]);
}
