//! Built-in facilities.
//!
//! - `core` (module `tracer`): tracer bookkeeping (facility list, heartbeat, state dump, user events)
//! - `irq`: interrupt entry/exit and timer ticks
//! - `sched`: context switches and wakeups
//! - `process`: fork, exit and exec
//! - `module`: module load and unload
//! - `net`: packet transmit and receive

pub mod irq;
pub mod module;
pub mod net;
pub mod process;
pub mod sched;
pub mod tracer;

pub use irq::IRQ_FACILITY;
pub use module::MODULE_FACILITY;
pub use net::NET_FACILITY;
pub use process::PROCESS_FACILITY;
pub use sched::SCHED_FACILITY;
pub use tracer::CORE_FACILITY;

/// Register every built-in facility. Safe to call more than once.
pub fn init() {
    tracer::init();
    irq::init();
    sched::init();
    process::init();
    module::init();
    net::init();

    log::debug!(
        "LTT: facilities registered: core={:#x}, irq={:#x}, sched={:#x}, process={:#x}, module={:#x}, net={:#x}",
        tracer::FACILITY_ID,
        irq::FACILITY_ID,
        sched::FACILITY_ID,
        process::FACILITY_ID,
        module::FACILITY_ID,
        net::FACILITY_ID
    );
}
