//! Network facility.
//!
//! # Events
//!
//! - `DEV_XMIT` (0): packet id u64, protocol u16, length u32
//! - `DEV_RECEIVE` (1): packet id u64, protocol u16, length u32

use crate::channel::ChannelKind;
use crate::facility::{register_facility, Facility};
use crate::header::Field;

pub const FACILITY_ID: u8 = 0x05;

pub static NET_FACILITY: Facility = Facility::new(
    "net",
    FACILITY_ID,
    ChannelKind::Network,
    &["dev_xmit", "dev_receive"],
);

pub const DEV_XMIT: u8 = 0;
pub const DEV_RECEIVE: u8 = 1;

pub fn init() {
    register_facility(&NET_FACILITY);
}

#[inline(always)]
fn trace_packet(event: u8, packet: u64, protocol: u16, len: u32) {
    crate::log_event(
        &NET_FACILITY,
        event,
        &[Field::scalar(&packet), Field::scalar(&protocol), Field::scalar(&len)],
    );
}

pub fn trace_dev_xmit(packet: u64, protocol: u16, len: u32) {
    trace_packet(DEV_XMIT, packet, protocol, len);
}

pub fn trace_dev_receive(packet: u64, protocol: u16, len: u32) {
    trace_packet(DEV_RECEIVE, packet, protocol, len);
}
