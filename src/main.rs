//! `lttctl`: run one trace session against simulated CPUs.
//!
//! Creates a trace, attaches a reader to every CPU buffer of the `cpu`
//! channel, starts the trace, lets one thread per CPU fire scheduler and
//! interrupt probes, then stops, destroys and prints what was read back
//! (per facility) together with the loss counters of each buffer.

mod logger;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser;
use futures_util::stream::Stream;
use futures_util::task::{waker, ArcWake};
use log::{info, LevelFilter};

use ltt::facilities::{irq, sched};
use ltt::{
    percpu, ChannelKind, ChannelReader, ChannelSizing, RegistryConfig, RelayTransport,
    TraceConfig, TraceMode, TraceStats, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "lttctl", about = "Run an LTT trace session on simulated CPUs")]
struct Args {
    /// Trace name.
    #[arg(long, default_value = "lttctl")]
    name: String,

    /// normal, flight (flight-recorder) or hybrid.
    #[arg(long, default_value = "normal")]
    mode: TraceMode,

    /// Simulated CPUs (defaults to the machine's).
    #[arg(long)]
    cpus: Option<usize>,

    /// Probe firings per CPU.
    #[arg(long, default_value_t = 1000)]
    events: u32,

    /// Sub-buffer size of the `cpu` channel, in bytes.
    #[arg(long)]
    subbuf_size: Option<usize>,

    /// Sub-buffer count of the `cpu` channel.
    #[arg(long, default_value_t = 2)]
    n_subbufs: usize,

    /// Use compact timestamps and periodic heartbeats.
    #[arg(long)]
    heartbeat: bool,

    /// Delivery timer period in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,

    /// Facility to turn off before tracing (repeatable), e.g. `sched`.
    #[arg(long = "disable", value_name = "FACILITY")]
    disabled: Vec<String>,

    /// Log level: off, error, warn, info, debug or trace.
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init(args.log_level)?;

    let registry = ltt::init_with(
        RegistryConfig::default().tick(Duration::from_millis(args.tick_ms.max(1))),
    )
    .ok_or_else(|| anyhow!("tracer initialization failed"))?;

    for name in &args.disabled {
        let facility = ltt::facility::facilities()
            .into_iter()
            .find(|f| f.name == name.as_str())
            .ok_or_else(|| anyhow!("unknown facility {}", name))?;
        facility.disable_all();
        info!("facility {} disabled", facility.name);
    }

    let mut config = TraceConfig::new(args.mode).heartbeat(args.heartbeat);
    if let Some(cpus) = args.cpus {
        config = config.num_cpus(cpus);
    }
    if let Some(subbuf_size) = args.subbuf_size {
        config = config.channel_sizing(
            ChannelKind::Cpu,
            ChannelSizing::new(subbuf_size, args.n_subbufs),
        );
    }

    registry
        .create(&args.name, &config)
        .with_context(|| format!("creating trace {}", args.name))?;
    // Holding the trace itself would stall `destroy`.
    let cpus = registry
        .trace(&args.name)
        .map(|trace| trace.channel(ChannelKind::Cpu).num_cpus())
        .ok_or_else(|| anyhow!("trace {} vanished after creation", args.name))?;

    let readers = (0..cpus)
        .map(|cpu| {
            let reader = registry.open_reader(&args.name, ChannelKind::Cpu, cpu)?;
            Ok(spawn_reader(reader, registry.relay().clone()))
        })
        .collect::<Result<Vec<_>, ltt::TraceError>>()
        .context("attaching readers")?;

    registry.start(&args.name).context("starting trace")?;
    let started = Instant::now();

    let writers: Vec<JoinHandle<()>> = (0..cpus)
        .map(|cpu| {
            let events = args.events;
            thread::spawn(move || run_probes(cpu, events))
        })
        .collect();
    for writer in writers {
        if writer.join().is_err() {
            bail!("probe thread panicked");
        }
    }
    let elapsed = started.elapsed();

    registry.stop(&args.name).context("stopping trace")?;
    let stats = registry.destroy(&args.name).context("destroying trace")?;

    let mut read = Vec::with_capacity(cpus);
    for reader in readers {
        read.push(
            reader
                .join()
                .map_err(|_| anyhow!("reader thread panicked"))?,
        );
    }

    report(&args, elapsed, &read, &stats);
    Ok(())
}

/// Probe load for one simulated CPU.
fn run_probes(cpu: usize, events: u32) {
    percpu::set_current_cpu(cpu);
    let cpu_id = cpu as u32;
    for i in 0..events {
        match i % 4 {
            0 => irq::trace_irq_entry(32 + cpu_id, true),
            1 => sched::trace_sched_switch(i, i + 1, 0),
            2 => sched::trace_wakeup(i, cpu_id),
            _ => irq::trace_irq_exit(32 + cpu_id),
        }
    }
    sched::trace_idle();
    percpu::clear_current_cpu();
}

/// What one reader thread saw on its CPU.
#[derive(Clone, Debug, Default)]
struct ReadTotals {
    cpu: usize,
    subbuffers: u64,
    events: u64,
    per_facility: BTreeMap<u8, u64>,
    /// `(events lost, corrupted sub-buffers)` as the transport reports them.
    errors: (u64, u64),
}

/// Unparks the reader thread when its buffer has data.
struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Drive a reader's stream on its own thread until the channel closes.
fn spawn_reader(mut reader: ChannelReader, relay: Arc<RelayTransport>) -> JoinHandle<ReadTotals> {
    thread::spawn(move || {
        let waker = waker(Arc::new(ThreadWaker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut totals = ReadTotals {
            cpu: reader.cpu(),
            ..ReadTotals::default()
        };
        loop {
            match Pin::new(&mut reader).poll_next(&mut cx) {
                Poll::Ready(Some(subbuf)) => {
                    totals.subbuffers += 1;
                    for event in subbuf.events() {
                        totals.events += 1;
                        *totals.per_facility.entry(event.facility_id).or_default() += 1;
                    }
                }
                Poll::Ready(None) => {
                    totals.errors = relay.buffer_errors(reader.channel(), reader.cpu());
                    return totals;
                }
                Poll::Pending => thread::park_timeout(Duration::from_millis(100)),
            }
        }
    })
}

fn report(args: &Args, elapsed: Duration, read: &[ReadTotals], stats: &TraceStats) {
    let cpus = read.len();
    info!(
        "trace {} ({}): {} cpus x {} probes in {:?}",
        args.name,
        args.mode.name(),
        cpus,
        args.events,
        elapsed
    );
    let events: u64 = read.iter().map(|r| r.events).sum();
    let subbuffers: u64 = read.iter().map(|r| r.subbuffers).sum();
    let mut per_facility: BTreeMap<u8, u64> = BTreeMap::new();
    for totals in read {
        for (&id, &count) in &totals.per_facility {
            *per_facility.entry(id).or_default() += count;
        }
    }

    println!("trace:        {}", stats.name);
    println!("mode:         {}", args.mode.name());
    println!("cpus:         {}", cpus);
    println!("read:         {} events in {} sub-buffers", events, subbuffers);
    for (id, count) in &per_facility {
        let name = ltt::facility::get_facility(*id).map_or("unknown", |f| f.name);
        println!("  {:<10}  {}", name, count);
    }
    println!("events lost:  {}", stats.events_lost());
    println!("corrupted:    {}", stats.corrupted());
    for totals in read {
        let (lost, corrupted) = totals.errors;
        if lost > 0 || corrupted > 0 {
            println!("  cpu {:<3}     {} lost, {} corrupted", totals.cpu, lost, corrupted);
        }
    }
    if let Some(cpu) = stats.channel(ChannelKind::Cpu) {
        println!("cpu channel:  {} bytes committed", cpu.committed());
    }
    if log::log_enabled!(log::Level::Debug) {
        print!("{}", stats);
    }
}
