//! Delivery timer.
//!
//! Writers never wake readers themselves: a completed sub-buffer only queues
//! its CPU on the channel. One timer thread per registry runs while at least
//! one trace is active and, every tick, hands queued sub-buffers to readers
//! and emits heartbeats.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error};

use crate::error::{TraceError, TraceResult};

pub struct DeliveryTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryTimer {
    /// Start a thread calling `tick` every `period`.
    pub fn arm<F>(period: Duration, tick: F) -> TraceResult<DeliveryTimer>
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("ltt-timer".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::park_timeout(period);
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }
                    tick();
                }
            })
            .map_err(|err| {
                error!("LTT: cannot start delivery timer: {}", err);
                TraceError::NoMemory
            })?;
        debug!("LTT: delivery timer armed ({:?})", period);
        Ok(DeliveryTimer {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for its last tick to finish.
    pub fn disarm(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("LTT: delivery timer panicked");
            }
            debug!("LTT: delivery timer disarmed");
        }
    }
}

impl Drop for DeliveryTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn test_timer_ticks_until_disarmed() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let timer = DeliveryTimer::arm(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        timer.disarm();

        let after = ticks.load(Ordering::SeqCst);
        assert!(after >= 3);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }
}
