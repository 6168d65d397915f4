//! Channels: one ring buffer per CPU for one logical event stream.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::buffer::RingBuffer;
use crate::config::{ChannelSizing, TrafficClass};
use crate::error::{TraceError, TraceResult};
use crate::format::TraceHeader;
use crate::header::HeaderFormat;
use crate::output::ChannelStats;
use crate::percpu;

/// Number of channels in every trace.
pub const CHANNEL_COUNT: usize = 6;

/// The fixed set of channels a trace owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Facilities,
    Interrupts,
    Processes,
    Modules,
    Cpu,
    Network,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; CHANNEL_COUNT] = [
        ChannelKind::Facilities,
        ChannelKind::Interrupts,
        ChannelKind::Processes,
        ChannelKind::Modules,
        ChannelKind::Cpu,
        ChannelKind::Network,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            ChannelKind::Facilities => "facilities",
            ChannelKind::Interrupts => "interrupts",
            ChannelKind::Processes => "processes",
            ChannelKind::Modules => "modules",
            ChannelKind::Cpu => "cpu",
            ChannelKind::Network => "network",
        }
    }

    #[inline(always)]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Sizing class used when the trace does not override this channel.
    pub const fn traffic_class(&self) -> TrafficClass {
        match self {
            ChannelKind::Cpu => TrafficClass::High,
            ChannelKind::Processes => TrafficClass::Medium,
            ChannelKind::Facilities
            | ChannelKind::Interrupts
            | ChannelKind::Modules
            | ChannelKind::Network => TrafficClass::Low,
        }
    }
}

impl core::str::FromStr for ChannelKind {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or(TraceError::InvalidArgument)
    }
}

impl core::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named stream of one trace, backed by one [`RingBuffer`] per CPU.
///
/// Shared through `Arc` between the trace, the transport and any open
/// readers; the buffers are released when the last holder drops it.
pub struct Channel {
    kind: ChannelKind,
    /// Name of the owning trace. The channel does not keep the trace alive.
    trace_name: String,
    overwrite: bool,
    sizing: ChannelSizing,
    buffers: Box<[RingBuffer]>,
    /// CPUs with completed sub-buffers awaiting delivery.
    pending: Arc<ArrayQueue<usize>>,
    finalized: AtomicBool,
}

impl Channel {
    /// Allocate a zeroed buffer for each of `num_cpus` CPUs.
    ///
    /// Sizes are rounded up to powers of two. Fails with `InvalidArgument` on
    /// unusable sizing and `NoMemory` if any buffer cannot be allocated; in
    /// both cases nothing stays allocated.
    pub fn create(
        trace_name: &str,
        kind: ChannelKind,
        sizing: ChannelSizing,
        overwrite: bool,
        format: HeaderFormat,
        trace_header: TraceHeader,
        num_cpus: usize,
    ) -> TraceResult<Arc<Channel>> {
        if num_cpus == 0 || num_cpus > percpu::MAX_CPUS {
            return Err(TraceError::InvalidArgument);
        }
        let sizing = sizing.validated()?;
        let pending = Arc::new(ArrayQueue::new(num_cpus));

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(num_cpus)
            .map_err(|_| TraceError::NoMemory)?;
        for cpu in 0..num_cpus {
            buffers.push(RingBuffer::new(
                cpu,
                sizing,
                overwrite,
                format,
                trace_header,
                pending.clone(),
            )?);
        }

        Ok(Arc::new(Channel {
            kind,
            trace_name: trace_name.to_string(),
            overwrite,
            sizing,
            buffers: buffers.into_boxed_slice(),
            pending,
            finalized: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn trace_name(&self) -> &str {
        &self.trace_name
    }

    #[inline]
    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    /// Sizing after power-of-two rounding.
    pub fn sizing(&self) -> ChannelSizing {
        self.sizing
    }

    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, cpu: usize) -> Option<&RingBuffer> {
        self.buffers.get(cpu)
    }

    /// Buffer of `cpu`, folding CPUs beyond the channel's count onto it.
    #[inline(always)]
    pub fn buffer_for(&self, cpu: usize) -> &RingBuffer {
        &self.buffers[cpu % self.buffers.len()]
    }

    /// Buffer of the calling thread's CPU.
    #[inline(always)]
    pub fn current_buffer(&self) -> &RingBuffer {
        self.buffer_for(percpu::current_cpu_id())
    }

    pub fn buffers(&self) -> &[RingBuffer] {
        &self.buffers
    }

    /// Next CPU with completed sub-buffers awaiting delivery.
    pub fn take_pending(&self) -> Option<usize> {
        self.pending.pop()
    }

    /// Close every partial sub-buffer.
    pub fn flush(&self) {
        for buffer in self.buffers.iter() {
            buffer.force_switch();
        }
    }

    /// Mark the channel closed and wake every reader so it can drain and end.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
        for buffer in self.buffers.iter() {
            buffer.wake_readers();
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn active_readers(&self) -> usize {
        self.buffers.iter().map(RingBuffer::active_readers).sum()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            kind: self.kind,
            overwrite: self.overwrite,
            buffers: self.buffers.iter().map(RingBuffer::stats).collect(),
        }
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("trace", &self.trace_name)
            .field("kind", &self.kind)
            .field("overwrite", &self.overwrite)
            .field("sizing", &self.sizing)
            .field("cpus", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TraceStart;
    use crate::header::Field;

    fn channel(sizing: ChannelSizing, cpus: usize) -> TraceResult<Arc<Channel>> {
        Channel::create(
            "t",
            ChannelKind::Cpu,
            sizing,
            false,
            HeaderFormat::default(),
            TraceHeader::new(false, false, true, TraceStart::default()),
            cpus,
        )
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ChannelKind::ALL {
            assert_eq!(kind.name().parse::<ChannelKind>(), Ok(kind));
            assert_eq!(ChannelKind::ALL[kind.index()], kind);
        }
        assert!("disk".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_create_rounds_sizes() {
        let ch = channel(ChannelSizing::new(1000, 3), 2).unwrap();
        assert_eq!(ch.sizing(), ChannelSizing::new(1024, 4));
        assert_eq!(ch.num_cpus(), 2);
        assert_eq!(ch.buffer(1).unwrap().cpu(), 1);
        assert!(ch.buffer(2).is_none());
        assert_eq!(ch.buffer_for(5).cpu(), 1);
    }

    #[test]
    fn test_create_rejects_bad_geometry() {
        assert_eq!(
            channel(ChannelSizing::new(32, 2), 1).unwrap_err(),
            TraceError::InvalidArgument
        );
        assert_eq!(
            channel(ChannelSizing::new(4096, 2), 0).unwrap_err(),
            TraceError::InvalidArgument
        );
    }

    #[test]
    fn test_flush_queues_each_cpu_once() {
        let ch = channel(ChannelSizing::new(512, 4), 2).unwrap();
        let v = 1u64;
        ch.buffer_for(0).write(1, 1, &[Field::scalar(&v)]).unwrap();
        ch.buffer_for(1).write(1, 1, &[Field::scalar(&v)]).unwrap();
        ch.flush();

        let mut cpus = vec![ch.take_pending().unwrap(), ch.take_pending().unwrap()];
        cpus.sort();
        assert_eq!(cpus, vec![0, 1]);
        assert!(ch.take_pending().is_none());
    }

    #[test]
    fn test_finalize() {
        let ch = channel(ChannelSizing::new(512, 2), 1).unwrap();
        assert!(!ch.is_finalized());
        ch.finalize();
        assert!(ch.is_finalized());
        assert_eq!(ch.active_readers(), 0);
    }
}
