//! Trace sessions.
//!
//! A trace owns the six fixed channels, its time reference and the transport
//! it was created with. Those never change once created; only the active flag
//! and the filter default move at runtime.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;

use crate::channel::{Channel, ChannelKind, CHANNEL_COUNT};
use crate::config::{validate_name, RegistryConfig, TraceConfig, TraceMode};
use crate::error::{TraceError, TraceResult};
use crate::format::{TraceHeader, TraceStart};
use crate::header::{Field, HeaderFormat};
use crate::output::TraceStats;
use crate::percpu;
use crate::transport::Transport;

pub struct Trace {
    name: String,
    mode: TraceMode,
    format: HeaderFormat,
    start: TraceStart,
    active: AtomicBool,
    /// Decision of the filter module for events no rule matches.
    filter_accept: AtomicBool,
    /// Delivery timer ticks since the last heartbeat.
    heartbeat_ticks: AtomicU32,
    channels: [Arc<Channel>; CHANNEL_COUNT],
    transport: Arc<dyn Transport>,
}

impl Trace {
    /// Build an inactive trace: namespace, time reference, all six channels.
    ///
    /// Any failure unwinds everything created so far, including what was
    /// registered with the transport.
    pub(crate) fn create(
        name: &str,
        config: &TraceConfig,
        defaults: &RegistryConfig,
        transport: Arc<dyn Transport>,
    ) -> TraceResult<Trace> {
        validate_name(name)?;
        let num_cpus = config.resolved_cpus()?;
        let format = HeaderFormat::new(config.heartbeat, config.alignment);
        let start = TraceStart::capture();
        let header = TraceHeader::new(
            config.mode == TraceMode::FlightRecorder,
            config.heartbeat,
            config.alignment,
            start,
        );

        transport.create_dirs(name)?;
        let mut channels: Vec<Arc<Channel>> = Vec::with_capacity(CHANNEL_COUNT);
        for kind in ChannelKind::ALL {
            let created = Channel::create(
                name,
                kind,
                config.sizing_for(kind, defaults),
                config.mode.overwrites(kind),
                format,
                header,
                num_cpus,
            )
            .and_then(|channel| {
                transport.create_channel(name, &channel)?;
                Ok(channel)
            });
            match created {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    debug!("LTT: trace {}: channel {} failed: {}", name, kind, err);
                    for channel in channels.iter().rev() {
                        transport.remove_channel(name, channel);
                    }
                    transport.remove_dirs(name);
                    return Err(err);
                }
            }
        }
        let channels: [Arc<Channel>; CHANNEL_COUNT] =
            channels.try_into().map_err(|_| TraceError::NoMemory)?;

        Ok(Trace {
            name: name.to_string(),
            mode: config.mode,
            format,
            start,
            active: AtomicBool::new(false),
            filter_accept: AtomicBool::new(true),
            heartbeat_ticks: AtomicU32::new(0),
            channels,
            transport,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn mode(&self) -> TraceMode {
        self.mode
    }

    #[inline]
    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    /// Time reference recorded at creation.
    pub fn start(&self) -> TraceStart {
        self.start
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the active flag; returns the previous value.
    pub(crate) fn set_active(&self, active: bool) -> bool {
        self.active.swap(active, Ordering::AcqRel)
    }

    #[inline]
    pub fn channel(&self, kind: ChannelKind) -> &Arc<Channel> {
        &self.channels[kind.index()]
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    #[inline(always)]
    pub fn filter_accepts(&self) -> bool {
        self.filter_accept.load(Ordering::Relaxed)
    }

    pub fn set_filter_accept(&self, accept: bool) {
        self.filter_accept.store(accept, Ordering::Relaxed);
    }

    /// Count one timer tick; true every `interval` ticks.
    pub(crate) fn heartbeat_due(&self, interval: u32) -> bool {
        let ticks = self.heartbeat_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks >= interval {
            self.heartbeat_ticks.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Write an event into channel `kind` on the calling thread's CPU.
    ///
    /// Goes straight to the buffer: no enable check, no filter.
    #[inline]
    pub fn write_event(
        &self,
        kind: ChannelKind,
        facility_id: u8,
        event_id: u8,
        fields: &[Field<'_>],
    ) -> TraceResult<()> {
        self.write_event_on(kind, percpu::current_cpu_id(), facility_id, event_id, fields)
    }

    /// Write an event into channel `kind` on a given CPU's buffer.
    pub fn write_event_on(
        &self,
        kind: ChannelKind,
        cpu: usize,
        facility_id: u8,
        event_id: u8,
        fields: &[Field<'_>],
    ) -> TraceResult<()> {
        let buffer = self.channels[kind.index()].buffer_for(cpu);
        let slot = self.transport.reserve_slot(buffer, fields)?;
        buffer.write_slot(&slot, facility_id, event_id, fields);
        self.transport.commit_slot(buffer, slot);
        Ok(())
    }

    /// Close every partial sub-buffer of every channel.
    pub fn flush(&self) {
        for channel in &self.channels {
            channel.flush();
        }
    }

    /// Hand completed sub-buffers to readers.
    pub fn deliver(&self) {
        for channel in &self.channels {
            self.transport.wakeup_channel(channel);
        }
    }

    /// Readers attached to any channel.
    pub fn active_readers(&self) -> usize {
        self.channels.iter().map(|c| c.active_readers()).sum()
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            name: self.name.clone(),
            active: self.is_active(),
            channels: self.channels.iter().map(|c| c.stats()).collect(),
        }
    }

    /// Unpublish from the transport and close every channel.
    ///
    /// Buffers stay allocated until the last reader drops its channel.
    pub(crate) fn teardown(&self) {
        for channel in self.channels.iter().rev() {
            self.transport.remove_channel(&self.name, channel);
            channel.finalize();
        }
        self.transport.remove_dirs(&self.name);
    }
}

impl core::fmt::Debug for Trace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trace")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("active", &self.is_active())
            .field("transport", &self.transport.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSizing;
    use crate::transport::RelayTransport;

    fn small(mode: TraceMode) -> TraceConfig {
        TraceConfig::new(mode)
            .num_cpus(2)
            .all_channels(ChannelSizing::new(512, 2))
    }

    #[test]
    fn test_create_builds_all_channels() {
        let relay = Arc::new(RelayTransport::new());
        let trace = Trace::create("t", &small(TraceMode::Hybrid), &RegistryConfig::default(), relay.clone())
            .unwrap();

        assert!(!trace.is_active());
        assert_eq!(trace.channels().len(), CHANNEL_COUNT);
        for kind in ChannelKind::ALL {
            let channel = trace.channel(kind);
            assert_eq!(channel.kind(), kind);
            assert_eq!(channel.overwrite(), kind == ChannelKind::Cpu);
            assert_eq!(channel.num_cpus(), 2);
            assert!(relay.channel("t", kind).is_some());
        }
        assert_eq!(trace.transport_name(), "relay");
    }

    #[test]
    fn test_bad_sizing_rolls_back() {
        let relay = Arc::new(RelayTransport::new());
        let config = small(TraceMode::Normal).channel_sizing(ChannelKind::Cpu, ChannelSizing::new(16, 2));
        let err = Trace::create("t", &config, &RegistryConfig::default(), relay.clone()).unwrap_err();
        assert_eq!(err, TraceError::InvalidArgument);
        assert!(relay.directories().is_empty());
    }

    #[test]
    fn test_write_event_on_cpu() {
        let relay = Arc::new(RelayTransport::new());
        let trace = Trace::create("t", &small(TraceMode::Normal), &RegistryConfig::default(), relay).unwrap();
        let v = 5u32;
        trace
            .write_event_on(ChannelKind::Network, 1, 9, 0, &[Field::scalar(&v)])
            .unwrap();
        let stats = trace.stats();
        let network = stats.channel(ChannelKind::Network).unwrap();
        assert_eq!(network.buffers[0].offset, 0);
        assert!(network.buffers[1].offset > 0);
    }

    #[test]
    fn test_heartbeat_interval() {
        let relay = Arc::new(RelayTransport::new());
        let trace = Trace::create("t", &small(TraceMode::Normal), &RegistryConfig::default(), relay).unwrap();
        assert!(!trace.heartbeat_due(3));
        assert!(!trace.heartbeat_due(3));
        assert!(trace.heartbeat_due(3));
        assert!(!trace.heartbeat_due(3));
    }

    #[test]
    fn test_teardown_unpublishes() {
        let relay = Arc::new(RelayTransport::new());
        let trace = Trace::create("t", &small(TraceMode::Normal), &RegistryConfig::default(), relay.clone())
            .unwrap();
        trace.teardown();
        assert!(relay.directories().is_empty());
        assert!(trace.channels().iter().all(|c| c.is_finalized()));
    }
}
