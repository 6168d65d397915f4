//! Per-CPU identity for writers.
//!
//! Every ring buffer has exactly one owning CPU. In a hosted process a "CPU"
//! is a simulated one: each thread carries a CPU id in thread-local storage
//! and always writes to that CPU's buffer in every channel. Threads that never
//! pick a CPU are assigned one round-robin on first use.
//!
//! Several threads may share a simulated CPU (like task, interrupt and NMI
//! context share a real one); the reservation protocol serializes them with a
//! compare-and-swap on the buffer offset.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of CPUs a channel can have buffers for.
pub const MAX_CPUS: usize = 64;

const CPU_UNASSIGNED: usize = usize::MAX;

/// Round-robin cursor for threads that never called [`set_current_cpu`].
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// Cached online CPU count (0 until first queried).
static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(CPU_UNASSIGNED) };
}

/// Number of CPUs available to this process, clamped to [`MAX_CPUS`].
pub fn online_cpus() -> usize {
    let cached = ONLINE_CPUS.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_CPUS);
    ONLINE_CPUS.store(count, Ordering::Relaxed);
    count
}

/// Bind the calling thread to a simulated CPU.
pub fn set_current_cpu(cpu: usize) {
    let _ = CURRENT_CPU.try_with(|current| current.set(cpu % MAX_CPUS));
}

/// Forget the calling thread's CPU binding.
pub fn clear_current_cpu() {
    let _ = CURRENT_CPU.try_with(|current| current.set(CPU_UNASSIGNED));
}

/// CPU id of the calling thread.
///
/// Lock-free; the first call on an unbound thread picks a CPU round-robin.
#[inline]
pub fn current_cpu_id() -> usize {
    CURRENT_CPU
        .try_with(|current| {
            let id = current.get();
            if id != CPU_UNASSIGNED {
                return id;
            }
            let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % online_cpus();
            current.set(id);
            id
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_cpu_is_sticky() {
        std::thread::spawn(|| {
            set_current_cpu(3);
            assert_eq!(current_cpu_id(), 3);
            assert_eq!(current_cpu_id(), 3);
            clear_current_cpu();
            assert!(current_cpu_id() < online_cpus());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cpu_wraps_at_max() {
        std::thread::spawn(|| {
            set_current_cpu(MAX_CPUS + 2);
            assert_eq!(current_cpu_id(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_online_cpus_bounds() {
        let n = online_cpus();
        assert!(n >= 1 && n <= MAX_CPUS);
    }
}
