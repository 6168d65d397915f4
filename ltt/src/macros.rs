//! Probe macros.
//!
//! Each field is written as a naturally aligned scalar.
//!
//! ```rust,ignore
//! ltt_event!(ltt::facilities::SCHED_FACILITY, sched::WAKEUP, pid, cpu);
//! ltt_event_to!(registry, DISK, 0, sector);
//! ```

/// Log an event through the global registry.
#[macro_export]
macro_rules! ltt_event {
    ($facility:expr, $event:expr) => {
        $crate::log_event(&$facility, $event, &[])
    };
    ($facility:expr, $event:expr, $($field:expr),+ $(,)?) => {
        $crate::log_event(
            &$facility,
            $event,
            &[$($crate::header::Field::scalar(&$field)),+],
        )
    };
}

/// Log an event through an explicit [`TraceRegistry`](crate::TraceRegistry).
#[macro_export]
macro_rules! ltt_event_to {
    ($registry:expr, $facility:expr, $event:expr) => {
        $registry.log_event(&$facility, $event, &[])
    };
    ($registry:expr, $facility:expr, $event:expr, $($field:expr),+ $(,)?) => {
        $registry.log_event(
            &$facility,
            $event,
            &[$($crate::header::Field::scalar(&$field)),+],
        )
    };
}
