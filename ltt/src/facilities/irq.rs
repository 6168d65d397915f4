//! Interrupt facility.
//!
//! # Events
//!
//! - `IRQ_ENTRY` (0): irq number u32, kernel mode u8
//! - `IRQ_EXIT` (1): irq number u32
//! - `SOFTIRQ_ENTRY` (2): softirq number u32
//! - `SOFTIRQ_EXIT` (3): softirq number u32
//! - `TIMER_TICK` (4): tick count u64

use crate::channel::ChannelKind;
use crate::facility::{register_facility, Facility};
use crate::header::Field;

pub const FACILITY_ID: u8 = 0x01;

pub static IRQ_FACILITY: Facility = Facility::new(
    "irq",
    FACILITY_ID,
    ChannelKind::Interrupts,
    &["irq_entry", "irq_exit", "softirq_entry", "softirq_exit", "timer_tick"],
);

pub const IRQ_ENTRY: u8 = 0;
pub const IRQ_EXIT: u8 = 1;
pub const SOFTIRQ_ENTRY: u8 = 2;
pub const SOFTIRQ_EXIT: u8 = 3;
pub const TIMER_TICK: u8 = 4;

pub fn init() {
    register_facility(&IRQ_FACILITY);
}

#[inline(always)]
pub fn trace_irq_entry(irq: u32, kernel_mode: bool) {
    let mode = kernel_mode as u8;
    crate::log_event(&IRQ_FACILITY, IRQ_ENTRY, &[Field::scalar(&irq), Field::scalar(&mode)]);
}

#[inline(always)]
pub fn trace_irq_exit(irq: u32) {
    crate::log_event(&IRQ_FACILITY, IRQ_EXIT, &[Field::scalar(&irq)]);
}

#[inline(always)]
pub fn trace_softirq_entry(nr: u32) {
    crate::log_event(&IRQ_FACILITY, SOFTIRQ_ENTRY, &[Field::scalar(&nr)]);
}

#[inline(always)]
pub fn trace_softirq_exit(nr: u32) {
    crate::log_event(&IRQ_FACILITY, SOFTIRQ_EXIT, &[Field::scalar(&nr)]);
}

#[inline(always)]
pub fn trace_timer_tick(ticks: u64) {
    crate::log_event(&IRQ_FACILITY, TIMER_TICK, &[Field::scalar(&ticks)]);
}
