//! Tracer configuration.
//!
//! Channel sizes come from three traffic classes. A [`RegistryConfig`] holds
//! the default sizing of each class plus the delivery timer settings; a
//! [`TraceConfig`] picks the mode and transport of one trace and may override
//! the sizing of individual channels.

use core::time::Duration;

use crate::channel::{ChannelKind, CHANNEL_COUNT};
use crate::error::{TraceError, TraceResult};
use crate::format::SUBBUF_HEADER_SIZE;
use crate::percpu::MAX_CPUS;

/// Longest accepted trace name, in bytes.
pub const NAME_MAX: usize = 255;

/// Name of the transport every registry starts with.
pub const DEFAULT_TRANSPORT: &str = "relay";

// =============================================================================
// Traffic Classes
// =============================================================================

/// Expected event rate of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrafficClass {
    Low,
    Medium,
    High,
}

impl TrafficClass {
    pub const fn name(&self) -> &'static str {
        match self {
            TrafficClass::Low => "low",
            TrafficClass::Medium => "medium",
            TrafficClass::High => "high",
        }
    }

    /// Built-in sizing for this class.
    pub const fn default_sizing(&self) -> ChannelSizing {
        match self {
            TrafficClass::Low => ChannelSizing::new(64 * 1024, 2),
            TrafficClass::Medium => ChannelSizing::new(256 * 1024, 2),
            TrafficClass::High => ChannelSizing::new(1024 * 1024, 2),
        }
    }
}

// =============================================================================
// Channel Sizing
// =============================================================================

/// Geometry of every per-CPU buffer in a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelSizing {
    pub subbuf_size: usize,
    pub n_subbufs: usize,
}

impl ChannelSizing {
    pub const fn new(subbuf_size: usize, n_subbufs: usize) -> Self {
        Self {
            subbuf_size,
            n_subbufs,
        }
    }

    /// Round both dimensions up to powers of two and check they are usable.
    ///
    /// A sub-buffer must hold its header plus at least one byte of events,
    /// and a buffer needs at least two sub-buffers.
    pub fn validated(&self) -> TraceResult<ChannelSizing> {
        if self.subbuf_size == 0 || self.n_subbufs < 2 {
            return Err(TraceError::InvalidArgument);
        }
        let subbuf_size = self
            .subbuf_size
            .checked_next_power_of_two()
            .ok_or(TraceError::InvalidArgument)?;
        let n_subbufs = self
            .n_subbufs
            .checked_next_power_of_two()
            .ok_or(TraceError::InvalidArgument)?;
        if subbuf_size <= SUBBUF_HEADER_SIZE || subbuf_size > u32::MAX as usize {
            return Err(TraceError::InvalidArgument);
        }
        subbuf_size
            .checked_mul(n_subbufs)
            .ok_or(TraceError::InvalidArgument)?;
        Ok(ChannelSizing::new(subbuf_size, n_subbufs))
    }

    /// Total bytes of one per-CPU buffer.
    #[inline]
    pub const fn buffer_size(&self) -> usize {
        self.subbuf_size * self.n_subbufs
    }
}

// =============================================================================
// Trace Configuration
// =============================================================================

/// Overwrite behaviour of a trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceMode {
    /// No channel overwrites; a full buffer drops new events.
    #[default]
    Normal,
    /// Every channel overwrites its oldest unread sub-buffer.
    FlightRecorder,
    /// Only the high-rate `cpu` channel overwrites.
    Hybrid,
}

impl TraceMode {
    pub const fn name(&self) -> &'static str {
        match self {
            TraceMode::Normal => "normal",
            TraceMode::FlightRecorder => "flight",
            TraceMode::Hybrid => "hybrid",
        }
    }

    /// Whether channels of `kind` overwrite in this mode.
    pub const fn overwrites(&self, kind: ChannelKind) -> bool {
        match self {
            TraceMode::Normal => false,
            TraceMode::FlightRecorder => true,
            TraceMode::Hybrid => matches!(kind, ChannelKind::Cpu),
        }
    }
}

impl core::str::FromStr for TraceMode {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TraceMode::Normal),
            "flight" | "flight-recorder" => Ok(TraceMode::FlightRecorder),
            "hybrid" => Ok(TraceMode::Hybrid),
            _ => Err(TraceError::InvalidArgument),
        }
    }
}

/// Parameters of one trace.
#[derive(Clone, Debug)]
pub struct TraceConfig {
    pub mode: TraceMode,
    pub transport: String,
    /// Number of per-CPU buffers per channel; `None` uses the online CPUs.
    pub num_cpus: Option<usize>,
    /// Compact 32-bit timestamps with periodic heartbeat events.
    pub heartbeat: bool,
    /// Natural alignment of event fields.
    pub alignment: bool,
    sizing: [Option<ChannelSizing>; CHANNEL_COUNT],
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            mode: TraceMode::Normal,
            transport: DEFAULT_TRANSPORT.to_string(),
            num_cpus: None,
            heartbeat: false,
            alignment: true,
            sizing: [None; CHANNEL_COUNT],
        }
    }
}

impl TraceConfig {
    pub fn new(mode: TraceMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn transport(mut self, name: &str) -> Self {
        self.transport = name.to_string();
        self
    }

    pub fn num_cpus(mut self, n: usize) -> Self {
        self.num_cpus = Some(n);
        self
    }

    pub fn heartbeat(mut self, enabled: bool) -> Self {
        self.heartbeat = enabled;
        self
    }

    pub fn alignment(mut self, enabled: bool) -> Self {
        self.alignment = enabled;
        self
    }

    /// Override the sizing of one channel.
    pub fn channel_sizing(mut self, kind: ChannelKind, sizing: ChannelSizing) -> Self {
        self.sizing[kind.index()] = Some(sizing);
        self
    }

    /// Override the sizing of every channel.
    pub fn all_channels(mut self, sizing: ChannelSizing) -> Self {
        self.sizing = [Some(sizing); CHANNEL_COUNT];
        self
    }

    /// Sizing for `kind`: the override if any, else the class default.
    pub fn sizing_for(&self, kind: ChannelKind, defaults: &RegistryConfig) -> ChannelSizing {
        self.sizing[kind.index()].unwrap_or_else(|| defaults.class_sizing(kind.traffic_class()))
    }

    /// CPU count after applying the default and checking bounds.
    pub fn resolved_cpus(&self) -> TraceResult<usize> {
        let n = self.num_cpus.unwrap_or_else(crate::percpu::online_cpus);
        if n == 0 || n > MAX_CPUS {
            return Err(TraceError::InvalidArgument);
        }
        Ok(n)
    }
}

/// Check a trace name: 1..=NAME_MAX bytes, no path separators.
pub fn validate_name(name: &str) -> TraceResult<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') || name.contains('\0') {
        return Err(TraceError::InvalidArgument);
    }
    Ok(())
}

// =============================================================================
// Registry Configuration
// =============================================================================

/// Settings shared by every trace of a registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Delivery timer period.
    pub tick: Duration,
    /// Timer ticks between heartbeat events (traces created with heartbeat).
    pub heartbeat_ticks: u32,
    /// How long a blocking user-space write waits for buffer space.
    pub user_write_timeout: Duration,
    low: ChannelSizing,
    medium: ChannelSizing,
    high: ChannelSizing,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            heartbeat_ticks: 100,
            user_write_timeout: Duration::from_millis(500),
            low: TrafficClass::Low.default_sizing(),
            medium: TrafficClass::Medium.default_sizing(),
            high: TrafficClass::High.default_sizing(),
        }
    }
}

impl RegistryConfig {
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn heartbeat_ticks(mut self, ticks: u32) -> Self {
        self.heartbeat_ticks = ticks.max(1);
        self
    }

    pub fn user_write_timeout(mut self, timeout: Duration) -> Self {
        self.user_write_timeout = timeout;
        self
    }

    /// Replace the default sizing of a traffic class.
    pub fn class_default(mut self, class: TrafficClass, sizing: ChannelSizing) -> Self {
        match class {
            TrafficClass::Low => self.low = sizing,
            TrafficClass::Medium => self.medium = sizing,
            TrafficClass::High => self.high = sizing,
        }
        self
    }

    pub fn class_sizing(&self, class: TrafficClass) -> ChannelSizing {
        match class {
            TrafficClass::Low => self.low,
            TrafficClass::Medium => self.medium,
            TrafficClass::High => self.high,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_rounds_up() {
        let sizing = ChannelSizing::new(3000, 3).validated().unwrap();
        assert_eq!(sizing, ChannelSizing::new(4096, 4));
        assert_eq!(sizing.buffer_size(), 16384);
    }

    #[test]
    fn test_sizing_rejects_tiny() {
        assert_eq!(
            ChannelSizing::new(64, 4).validated(),
            Err(TraceError::InvalidArgument)
        );
        assert_eq!(
            ChannelSizing::new(4096, 1).validated(),
            Err(TraceError::InvalidArgument)
        );
        assert_eq!(
            ChannelSizing::new(0, 2).validated(),
            Err(TraceError::InvalidArgument)
        );
    }

    #[test]
    fn test_mode_policy_table() {
        for kind in ChannelKind::ALL {
            assert!(!TraceMode::Normal.overwrites(kind));
            assert!(TraceMode::FlightRecorder.overwrites(kind));
            assert_eq!(TraceMode::Hybrid.overwrites(kind), kind == ChannelKind::Cpu);
        }
    }

    #[test]
    fn test_sizing_override() {
        let defaults = RegistryConfig::default();
        let config = TraceConfig::default().channel_sizing(ChannelKind::Cpu, ChannelSizing::new(512, 2));
        assert_eq!(config.sizing_for(ChannelKind::Cpu, &defaults), ChannelSizing::new(512, 2));
        assert_eq!(
            config.sizing_for(ChannelKind::Processes, &defaults),
            TrafficClass::Medium.default_sizing()
        );
        assert_eq!(
            config.sizing_for(ChannelKind::Facilities, &defaults),
            TrafficClass::Low.default_sizing()
        );
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("trace0").is_ok());
        assert_eq!(validate_name(""), Err(TraceError::InvalidArgument));
        assert_eq!(validate_name("a/b"), Err(TraceError::InvalidArgument));
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(validate_name(&long), Err(TraceError::InvalidArgument));
        assert!(validate_name(&"x".repeat(NAME_MAX)).is_ok());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("hybrid".parse::<TraceMode>(), Ok(TraceMode::Hybrid));
        assert_eq!("flight".parse::<TraceMode>(), Ok(TraceMode::FlightRecorder));
        assert!("bogus".parse::<TraceMode>().is_err());
    }
}
