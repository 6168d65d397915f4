//! Readers woken by the delivery timer.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::task::{waker, ArcWake};
use futures_util::StreamExt;

use ltt::facilities::tracer;
use ltt::{
    ltt_event_to, percpu, ChannelKind, ChannelSizing, Facility, RegistryConfig, TraceConfig,
    TraceMode, TraceRegistry,
};

static PROBE: Facility = Facility::new("delivery_probe", 0x70, ChannelKind::Interrupts, &["irq"]);
static FORK: Facility = Facility::new("delivery_fork", 0x71, ChannelKind::Processes, &["fork"]);

struct Unpark(thread::Thread);

impl ArcWake for Unpark {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

fn fast_registry() -> TraceRegistry {
    TraceRegistry::new(RegistryConfig::default().tick(Duration::from_millis(2)))
}

#[test]
fn test_stream_is_woken_and_ends_after_destroy() {
    let registry = fast_registry();
    let config = TraceConfig::new(TraceMode::Normal)
        .num_cpus(1)
        .channel_sizing(ChannelKind::Interrupts, ChannelSizing::new(512, 4));
    registry.create("wake", &config).unwrap();
    let mut reader = registry.open_reader("wake", ChannelKind::Interrupts, 0).unwrap();
    registry.start("wake").unwrap();

    let waker = waker(Arc::new(Unpark(thread::current())));
    let mut cx = Context::from_waker(&waker);
    assert!(reader.poll_next_unpin(&mut cx).is_pending());

    // Enough to complete at least one sub-buffer.
    for i in 0..64u32 {
        ltt_event_to!(registry, PROBE, 0, i);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut subbufs = 0;
    loop {
        match reader.poll_next_unpin(&mut cx) {
            Poll::Ready(Some(subbuf)) => {
                assert!(subbuf.events().count() > 0);
                subbufs += 1;
                break;
            }
            Poll::Ready(None) => panic!("stream ended while the trace is alive"),
            Poll::Pending => {
                assert!(Instant::now() < deadline, "reader never woken");
                thread::park_timeout(Duration::from_millis(50));
            }
        }
    }

    registry.stop("wake").unwrap();
    registry.destroy("wake").unwrap();
    loop {
        match reader.poll_next_unpin(&mut cx) {
            Poll::Ready(Some(_)) => subbufs += 1,
            Poll::Ready(None) => break,
            Poll::Pending => panic!("finalized stream must not pend"),
        }
    }
    assert!(subbufs >= 2);
}

#[test]
fn test_readers_are_counted_per_trace() {
    let registry = TraceRegistry::default();
    registry
        .create("count", &TraceConfig::new(TraceMode::Normal).num_cpus(2))
        .unwrap();
    let trace = registry.trace("count").unwrap();
    let a = registry.open_reader("count", ChannelKind::Cpu, 0).unwrap();
    let b = registry.open_reader("count", ChannelKind::Cpu, 1).unwrap();
    assert_eq!(trace.active_readers(), 2);
    assert!(registry.open_reader("count", ChannelKind::Cpu, 2).is_err());
    drop(a);
    drop(b);
    assert_eq!(trace.active_readers(), 0);
}

#[test]
fn test_heartbeat_reaches_every_cpu() {
    let registry = TraceRegistry::new(
        RegistryConfig::default()
            .tick(Duration::from_millis(1))
            .heartbeat_ticks(2),
    );
    let config = TraceConfig::new(TraceMode::Normal).num_cpus(2).heartbeat(true);
    registry.create("hb", &config).unwrap();
    registry.start("hb").unwrap();

    let trace = registry.trace("hb").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while trace
        .channel(ChannelKind::Cpu)
        .buffers()
        .iter()
        .any(|b| b.stats().committed == 0)
    {
        assert!(Instant::now() < deadline, "no heartbeat written");
        thread::sleep(Duration::from_millis(5));
    }
    registry.stop("hb").unwrap();

    for cpu in 0..2 {
        let reader = registry.open_reader("hb", ChannelKind::Cpu, cpu).unwrap();
        let subbufs = reader.drain();
        let beat = subbufs
            .iter()
            .flat_map(|s| s.events().collect::<Vec<_>>())
            .find(|e| e.facility_id == tracer::FACILITY_ID && e.event_id == tracer::HEARTBEAT)
            .map(|e| {
                let mut tsc = [0u8; 8];
                tsc.copy_from_slice(&e.payload[e.payload.len() - 8..]);
                (e.timestamp, u64::from_ne_bytes(tsc))
            });
        let (timestamp, full) = beat.unwrap();
        // The header is stamped after the payload's counter was read.
        assert!(timestamp >= full);
    }
}

#[test]
fn test_compact_timestamps_survive_a_wrap_in_a_quiet_channel() {
    let registry = TraceRegistry::new(
        RegistryConfig::default()
            .tick(Duration::from_millis(10))
            .heartbeat_ticks(5),
    );
    let config = TraceConfig::new(TraceMode::Normal).num_cpus(1).heartbeat(true);
    registry.create("quiet", &config).unwrap();
    registry.start("quiet").unwrap();

    // Longer than one 32-bit wrap of a 1 GHz counter.
    let gap = Duration::from_millis(4500);
    let before = Instant::now();
    ltt_event_to!(registry, FORK, 0, 1u32);
    thread::sleep(gap);
    ltt_event_to!(registry, FORK, 0, 2u32);
    let elapsed = before.elapsed();
    registry.stop("quiet").unwrap();

    let reader = registry.open_reader("quiet", ChannelKind::Processes, 0).unwrap();
    let events: Vec<(u8, u64)> = reader
        .drain()
        .iter()
        .flat_map(|s| {
            s.events()
                .map(|e| (e.facility_id, e.timestamp))
                .collect::<Vec<_>>()
        })
        .collect();
    assert!(events
        .iter()
        .any(|&(id, _)| id == tracer::FACILITY_ID));
    let stamps: Vec<u64> = events
        .iter()
        .filter(|&&(id, _)| id == FORK.id)
        .map(|&(_, ts)| ts)
        .collect();
    assert_eq!(stamps.len(), 2);
    let delta = stamps[1] - stamps[0];
    assert!(delta >= gap.as_nanos() as u64, "delta {} ns", delta);
    assert!(delta <= elapsed.as_nanos() as u64, "delta {} ns", delta);
}

#[test]
fn test_writers_on_many_cpus() {
    let registry = Arc::new(TraceRegistry::default());
    let config = TraceConfig::new(TraceMode::Normal)
        .num_cpus(4)
        .channel_sizing(ChannelKind::Interrupts, ChannelSizing::new(64 * 1024, 2));
    registry.create("smp", &config).unwrap();
    registry.start("smp").unwrap();

    let writers: Vec<_> = (0..4)
        .map(|cpu| {
            let registry = registry.clone();
            thread::spawn(move || {
                percpu::set_current_cpu(cpu);
                for i in 0..500u32 {
                    ltt_event_to!(registry, PROBE, 0, i);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    registry.stop("smp").unwrap();

    for cpu in 0..4 {
        let reader = registry.open_reader("smp", ChannelKind::Interrupts, cpu).unwrap();
        let count: usize = reader
            .drain()
            .iter()
            .map(|s| s.events().filter(|e| e.facility_id == PROBE.id).count())
            .sum();
        assert_eq!(count, 500);
    }
    let stats = registry.destroy("smp").unwrap();
    assert_eq!(stats.events_lost(), 0);
}
