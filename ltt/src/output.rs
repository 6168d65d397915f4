//! Trace statistics and loss reporting.
//!
//! Runtime data loss never fails a call; it only moves counters. This module
//! snapshots those counters and reports them in a line-oriented format:
//!
//! ```text
//! [LTT] trace=t0 channel=cpu cpu=1 offset=8192 consumed=4096 committed=8192 lost=0 corrupted=2
//! ```

use core::fmt;

use log::warn;

use crate::channel::ChannelKind;

/// Counters of one per-CPU buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub cpu: usize,
    /// Bytes reserved so far.
    pub offset: u64,
    /// Bytes handed to readers (or skipped by overwrite).
    pub consumed: u64,
    /// Bytes committed by writers.
    pub committed: u64,
    pub events_lost: u64,
    pub corrupted: u64,
}

/// Counters of one channel, per CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStats {
    pub kind: ChannelKind,
    pub overwrite: bool,
    pub buffers: Vec<BufferStats>,
}

impl ChannelStats {
    pub fn events_lost(&self) -> u64 {
        self.buffers.iter().map(|b| b.events_lost).sum()
    }

    pub fn corrupted(&self) -> u64 {
        self.buffers.iter().map(|b| b.corrupted).sum()
    }

    pub fn committed(&self) -> u64 {
        self.buffers.iter().map(|b| b.committed).sum()
    }
}

/// Counters of a whole trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceStats {
    pub name: String,
    pub active: bool,
    pub channels: Vec<ChannelStats>,
}

impl TraceStats {
    pub fn events_lost(&self) -> u64 {
        self.channels.iter().map(ChannelStats::events_lost).sum()
    }

    pub fn corrupted(&self) -> u64 {
        self.channels.iter().map(ChannelStats::corrupted).sum()
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelStats> {
        self.channels.iter().find(|c| c.kind == kind)
    }
}

impl fmt::Display for TraceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for channel in &self.channels {
            for b in &channel.buffers {
                writeln!(
                    f,
                    "[LTT] trace={} channel={} cpu={} offset={} consumed={} committed={} lost={} corrupted={}",
                    self.name,
                    channel.kind.name(),
                    b.cpu,
                    b.offset,
                    b.consumed,
                    b.committed,
                    b.events_lost,
                    b.corrupted
                )?;
            }
        }
        Ok(())
    }
}

/// Warn once per buffer that lost events or had sub-buffers overwritten.
///
/// Returns the number of warnings emitted.
pub fn log_summary(stats: &TraceStats) -> usize {
    let mut warnings = 0;
    for channel in &stats.channels {
        for b in &channel.buffers {
            if b.events_lost != 0 {
                warn!(
                    "LTT: trace {} channel {} cpu {}: {} events lost",
                    stats.name,
                    channel.kind.name(),
                    b.cpu,
                    b.events_lost
                );
                warnings += 1;
            }
            if b.corrupted != 0 {
                warn!(
                    "LTT: trace {} channel {} cpu {}: {} sub-buffers overwritten",
                    stats.name,
                    channel.kind.name(),
                    b.cpu,
                    b.corrupted
                );
                warnings += 1;
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TraceStats {
        TraceStats {
            name: "t".into(),
            active: false,
            channels: vec![
                ChannelStats {
                    kind: ChannelKind::Cpu,
                    overwrite: true,
                    buffers: vec![
                        BufferStats {
                            cpu: 0,
                            corrupted: 3,
                            ..Default::default()
                        },
                        BufferStats {
                            cpu: 1,
                            events_lost: 2,
                            corrupted: 1,
                            ..Default::default()
                        },
                    ],
                },
                ChannelStats {
                    kind: ChannelKind::Network,
                    overwrite: false,
                    buffers: vec![BufferStats::default()],
                },
            ],
        }
    }

    #[test]
    fn test_totals() {
        let stats = sample();
        assert_eq!(stats.events_lost(), 2);
        assert_eq!(stats.corrupted(), 4);
        assert_eq!(stats.channel(ChannelKind::Network).unwrap().corrupted(), 0);
    }

    #[test]
    fn test_summary_counts_nonzero_counters() {
        assert_eq!(log_summary(&sample()), 3);
    }

    #[test]
    fn test_display_is_line_oriented() {
        let text = sample().to_string();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("[LTT] trace=t channel=cpu cpu=0"));
    }
}
