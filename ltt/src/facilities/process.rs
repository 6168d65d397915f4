//! Process lifecycle facility.
//!
//! # Events
//!
//! - `FORK` (0): parent pid u32, child pid u32
//! - `EXIT` (1): pid u32, exit code i32
//! - `EXEC` (2): pid u32, file name bytes

use crate::channel::ChannelKind;
use crate::facility::{register_facility, Facility};
use crate::header::Field;

pub const FACILITY_ID: u8 = 0x03;

pub static PROCESS_FACILITY: Facility = Facility::new(
    "process",
    FACILITY_ID,
    ChannelKind::Processes,
    &["fork", "exit", "exec"],
);

pub const FORK: u8 = 0;
pub const EXIT: u8 = 1;
pub const EXEC: u8 = 2;

pub fn init() {
    register_facility(&PROCESS_FACILITY);
}

#[inline(always)]
pub fn trace_fork(parent_pid: u32, child_pid: u32) {
    crate::log_event(
        &PROCESS_FACILITY,
        FORK,
        &[Field::scalar(&parent_pid), Field::scalar(&child_pid)],
    );
}

#[inline(always)]
pub fn trace_exit(pid: u32, code: i32) {
    crate::log_event(&PROCESS_FACILITY, EXIT, &[Field::scalar(&pid), Field::scalar(&code)]);
}

#[inline(always)]
pub fn trace_exec(pid: u32, filename: &str) {
    crate::log_event(
        &PROCESS_FACILITY,
        EXEC,
        &[Field::scalar(&pid), Field::bytes(filename.as_bytes())],
    );
}
