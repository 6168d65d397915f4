//! Scheduler facility. High rate; logged to the `cpu` channel.
//!
//! # Events
//!
//! - `SCHED_SWITCH` (0): previous pid u32, next pid u32, previous state u32
//! - `WAKEUP` (1): pid u32, target cpu u32
//! - `IDLE` (2): no payload

use crate::channel::ChannelKind;
use crate::facility::{register_facility, Facility};
use crate::header::Field;

pub const FACILITY_ID: u8 = 0x02;

pub static SCHED_FACILITY: Facility = Facility::new(
    "sched",
    FACILITY_ID,
    ChannelKind::Cpu,
    &["sched_switch", "wakeup", "idle"],
);

pub const SCHED_SWITCH: u8 = 0;
pub const WAKEUP: u8 = 1;
pub const IDLE: u8 = 2;

pub fn init() {
    register_facility(&SCHED_FACILITY);
}

#[inline(always)]
pub fn trace_sched_switch(prev_pid: u32, next_pid: u32, prev_state: u32) {
    crate::log_event(
        &SCHED_FACILITY,
        SCHED_SWITCH,
        &[
            Field::scalar(&prev_pid),
            Field::scalar(&next_pid),
            Field::scalar(&prev_state),
        ],
    );
}

#[inline(always)]
pub fn trace_wakeup(pid: u32, cpu: u32) {
    crate::log_event(&SCHED_FACILITY, WAKEUP, &[Field::scalar(&pid), Field::scalar(&cpu)]);
}

#[inline(always)]
pub fn trace_idle() {
    crate::log_event(&SCHED_FACILITY, IDLE, &[]);
}
