//! Storage and delivery backends.
//!
//! A transport exposes a trace's channels to readers. Traces pick one by name
//! at creation; the registry starts with [`RelayTransport`] registered as
//! `"relay"`. The slot and delivery hooks have defaults that go straight to
//! the ring buffer, so a backend only has to manage its namespace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use spin::Mutex;

use crate::buffer::{RingBuffer, Slot};
use crate::channel::{Channel, ChannelKind};
use crate::config::DEFAULT_TRANSPORT;
use crate::error::{TraceError, TraceResult};
use crate::header::Field;

/// Operations a storage backend supplies.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Create the per-trace namespace.
    fn create_dirs(&self, trace: &str) -> TraceResult<()>;

    fn remove_dirs(&self, trace: &str);

    /// Expose a freshly created channel.
    fn create_channel(&self, trace: &str, channel: &Arc<Channel>) -> TraceResult<()>;

    fn remove_channel(&self, trace: &str, channel: &Arc<Channel>);

    #[inline(always)]
    fn reserve_slot(&self, buffer: &RingBuffer, fields: &[Field<'_>]) -> TraceResult<Slot> {
        buffer.reserve(fields)
    }

    /// Reserve for a writer that retries on `NoSpace`; a failure is not
    /// counted as a lost event.
    fn try_reserve_slot(&self, buffer: &RingBuffer, fields: &[Field<'_>]) -> TraceResult<Slot> {
        buffer.try_reserve(fields)
    }

    #[inline(always)]
    fn commit_slot(&self, buffer: &RingBuffer, slot: Slot) {
        buffer.commit(slot)
    }

    /// Wake readers of every buffer with completed sub-buffers.
    ///
    /// Called from the delivery timer, never from the logging path.
    fn wakeup_channel(&self, channel: &Channel) {
        while let Some(cpu) = channel.take_pending() {
            if let Some(buffer) = channel.buffer(cpu) {
                buffer.wake_readers();
            }
        }
    }

    /// `(events lost, corrupted sub-buffers)` of one CPU's buffer.
    fn buffer_errors(&self, channel: &Channel, cpu: usize) -> (u64, u64) {
        channel
            .buffer(cpu)
            .map(|b| (b.events_lost(), b.corrupted_subbuffers()))
            .unwrap_or((0, 0))
    }

    /// Admission check for the user-space write path: wait until `size` bytes
    /// could be reserved, or fail with `Timeout`.
    fn user_blocking(&self, buffer: &RingBuffer, size: usize, timeout: Duration) -> TraceResult<()> {
        buffer.wait_for_space(size, timeout)
    }
}

/// In-memory relay: a directory per trace holding its channels, looked up by
/// readers through [`RelayTransport::channel`].
#[derive(Default)]
pub struct RelayTransport {
    dirs: Mutex<BTreeMap<String, BTreeMap<ChannelKind, Arc<Channel>>>>,
}

impl RelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel `kind` of `trace`, if exposed.
    pub fn channel(&self, trace: &str, kind: ChannelKind) -> Option<Arc<Channel>> {
        self.dirs.lock().get(trace)?.get(&kind).cloned()
    }

    /// Names of the traces with a directory.
    pub fn directories(&self) -> Vec<String> {
        self.dirs.lock().keys().cloned().collect()
    }
}

impl Transport for RelayTransport {
    fn name(&self) -> &str {
        DEFAULT_TRANSPORT
    }

    fn create_dirs(&self, trace: &str) -> TraceResult<()> {
        let mut dirs = self.dirs.lock();
        if dirs.contains_key(trace) {
            return Err(TraceError::AlreadyExists);
        }
        dirs.insert(trace.to_string(), BTreeMap::new());
        debug!("relay: created directory {}", trace);
        Ok(())
    }

    fn remove_dirs(&self, trace: &str) {
        if self.dirs.lock().remove(trace).is_some() {
            debug!("relay: removed directory {}", trace);
        }
    }

    fn create_channel(&self, trace: &str, channel: &Arc<Channel>) -> TraceResult<()> {
        let mut dirs = self.dirs.lock();
        let dir = dirs.get_mut(trace).ok_or(TraceError::NotFound)?;
        if dir.contains_key(&channel.kind()) {
            return Err(TraceError::AlreadyExists);
        }
        dir.insert(channel.kind(), channel.clone());
        Ok(())
    }

    fn remove_channel(&self, trace: &str, channel: &Arc<Channel>) {
        if let Some(dir) = self.dirs.lock().get_mut(trace) {
            dir.remove(&channel.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSizing;
    use crate::format::{TraceHeader, TraceStart};
    use crate::header::HeaderFormat;

    fn channel(kind: ChannelKind) -> Arc<Channel> {
        Channel::create(
            "t",
            kind,
            ChannelSizing::new(512, 2),
            false,
            HeaderFormat::default(),
            TraceHeader::new(false, false, true, TraceStart::default()),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_relay_namespace() {
        let relay = RelayTransport::new();
        let cpu = channel(ChannelKind::Cpu);

        assert_eq!(relay.create_channel("t", &cpu), Err(TraceError::NotFound));
        relay.create_dirs("t").unwrap();
        assert_eq!(relay.create_dirs("t"), Err(TraceError::AlreadyExists));
        relay.create_channel("t", &cpu).unwrap();
        assert!(relay.channel("t", ChannelKind::Cpu).is_some());
        assert!(relay.channel("t", ChannelKind::Network).is_none());

        relay.remove_channel("t", &cpu);
        assert!(relay.channel("t", ChannelKind::Cpu).is_none());
        relay.remove_dirs("t");
        assert!(relay.directories().is_empty());
    }

    #[test]
    fn test_default_wakeup_drains_pending() {
        let relay = RelayTransport::new();
        let ch = channel(ChannelKind::Cpu);
        let v = 3u32;
        relay
            .reserve_slot(ch.buffer_for(0), &[Field::scalar(&v)])
            .map(|slot| relay.commit_slot(ch.buffer_for(0), slot))
            .unwrap();
        ch.flush();
        assert!(ch.buffer_for(0).deliver_pending());

        relay.wakeup_channel(&ch);
        assert!(!ch.buffer_for(0).deliver_pending());
        assert!(ch.take_pending().is_none());
        assert_eq!(relay.buffer_errors(&ch, 0), (0, 0));
    }
}
