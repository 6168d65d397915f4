//! Sub-buffer header layout.
//!
//! Every sub-buffer starts with a fixed header. The writer that opens the
//! sub-buffer fills in the begin fields and the trace header; the writer that
//! switches away from it records the unused tail (`lost_size`); the commit that
//! completes it records the end cycle count and frequency.
//!
//! # Memory Layout (native endian, 104 bytes)
//!
//! ```text
//! 0   begin_tsc        u64     40  magic            u32
//! 8   begin_freq       u64     44  arch_type        u32
//! 16  end_tsc          u64     48  arch_variant     u32
//! 24  end_freq         u64     52  version          u16 (12 bits)
//! 32  lost_size        u32     54  arch_size        u8
//! 36  subbuf_size      u32     55  flight_recorder  u8
//!                              56  has_heartbeat    u8
//!                              57  has_alignment    u8
//!                              58  (padding)        u16
//!                              60  freq_scale       u32
//!                              64  start_freq       u64
//!                              72  start_tsc        u64
//!                              80  start_monotonic  u64
//!                              88  start_time_sec   u64
//!                              96  start_time_usec  u64
//! ```

/// Magic number identifying a trace stream.
pub const TRACER_MAGIC_NUMBER: u32 = 0x00D6_B7ED;

/// Stream format version. Only the low 12 bits are stored.
pub const TRACER_VERSION: u16 = 0x010;

const VERSION_MASK: u16 = 0x0FFF;

/// Size of the header at the start of every sub-buffer.
pub const SUBBUF_HEADER_SIZE: usize = 104;

const BEGIN_TSC: usize = 0;
const BEGIN_FREQ: usize = 8;
const END_TSC: usize = 16;
const END_FREQ: usize = 24;
const LOST_SIZE: usize = 32;
const SUBBUF_SIZE: usize = 36;
const TRACE_HEADER: usize = 40;

/// Header bytes owned by the writer that closes a sub-buffer. The writer that
/// opens it owns everything else, so the two never write the same bytes.
pub const CLOSE_FIELDS: core::ops::Range<usize> = END_TSC..SUBBUF_SIZE;

pub const CLOSE_LEN: usize = SUBBUF_SIZE - END_TSC;

const _: () = assert!(SUBBUF_HEADER_SIZE % 8 == 0, "sub-buffer header must keep events 8-byte aligned");

/// Architecture identifiers stored in the trace header.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchType {
    Unknown = 0,
    X86 = 1,
    X86_64 = 2,
    Arm = 3,
    Aarch64 = 4,
    Riscv64 = 5,
}

impl ArchType {
    /// Architecture this tracer was built for.
    pub const fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            ArchType::X86_64
        } else if cfg!(target_arch = "x86") {
            ArchType::X86
        } else if cfg!(target_arch = "aarch64") {
            ArchType::Aarch64
        } else if cfg!(target_arch = "arm") {
            ArchType::Arm
        } else if cfg!(target_arch = "riscv64") {
            ArchType::Riscv64
        } else {
            ArchType::Unknown
        }
    }

    pub const fn from_u32(v: u32) -> Self {
        match v {
            1 => ArchType::X86,
            2 => ArchType::X86_64,
            3 => ArchType::Arm,
            4 => ArchType::Aarch64,
            5 => ArchType::Riscv64,
            _ => ArchType::Unknown,
        }
    }
}

/// Time reference captured when a trace is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceStart {
    pub tsc: u64,
    pub freq: u64,
    pub monotonic_ns: u64,
    pub wall_sec: u64,
    pub wall_usec: u64,
}

impl TraceStart {
    /// Sample every clock now.
    pub fn capture() -> Self {
        let tsc = crate::timestamp::trace_timestamp();
        let (wall_sec, wall_usec) = crate::timestamp::wall_clock();
        Self {
            tsc,
            freq: crate::timestamp::timestamp_frequency_hz(),
            monotonic_ns: crate::timestamp::timestamp_to_nanos(tsc),
            wall_sec,
            wall_usec,
        }
    }
}

/// Per-trace description repeated in every sub-buffer header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub magic: u32,
    pub arch_type: ArchType,
    pub arch_variant: u32,
    pub version: u16,
    pub arch_size: u8,
    pub flight_recorder: bool,
    pub has_heartbeat: bool,
    pub has_alignment: bool,
    pub freq_scale: u32,
    pub start: TraceStart,
}

impl TraceHeader {
    pub fn new(flight_recorder: bool, has_heartbeat: bool, has_alignment: bool, start: TraceStart) -> Self {
        Self {
            magic: TRACER_MAGIC_NUMBER,
            arch_type: ArchType::current(),
            arch_variant: 0,
            version: TRACER_VERSION & VERSION_MASK,
            arch_size: core::mem::size_of::<usize>() as u8,
            flight_recorder,
            has_heartbeat,
            has_alignment,
            freq_scale: 1,
            start,
        }
    }
}

/// Decoded sub-buffer header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubbufferHeader {
    pub begin_tsc: u64,
    pub begin_freq: u64,
    pub end_tsc: u64,
    pub end_freq: u64,
    /// Unused bytes at the tail of the sub-buffer.
    pub lost_size: u32,
    pub subbuf_size: u32,
    pub trace: TraceHeader,
}

#[inline(always)]
fn put_u64(out: &mut [u8], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}

#[inline(always)]
fn put_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

#[inline(always)]
fn get_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

#[inline(always)]
fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

impl SubbufferHeader {
    /// Header for a freshly opened sub-buffer.
    pub fn begin(begin_tsc: u64, begin_freq: u64, subbuf_size: u32, trace: TraceHeader) -> Self {
        Self {
            begin_tsc,
            begin_freq,
            end_tsc: 0,
            end_freq: 0,
            lost_size: 0,
            subbuf_size,
            trace,
        }
    }

    /// Serialize into the first [`SUBBUF_HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..SUBBUF_HEADER_SIZE];
        put_u64(out, BEGIN_TSC, self.begin_tsc);
        put_u64(out, BEGIN_FREQ, self.begin_freq);
        put_u64(out, END_TSC, self.end_tsc);
        put_u64(out, END_FREQ, self.end_freq);
        put_u32(out, LOST_SIZE, self.lost_size);
        put_u32(out, SUBBUF_SIZE, self.subbuf_size);

        let t = &self.trace;
        let th = TRACE_HEADER;
        put_u32(out, th, t.magic);
        put_u32(out, th + 4, t.arch_type as u32);
        put_u32(out, th + 8, t.arch_variant);
        out[th + 12..th + 14].copy_from_slice(&(t.version & VERSION_MASK).to_ne_bytes());
        out[th + 14] = t.arch_size;
        out[th + 15] = t.flight_recorder as u8;
        out[th + 16] = t.has_heartbeat as u8;
        out[th + 17] = t.has_alignment as u8;
        out[th + 18..th + 20].fill(0);
        put_u32(out, th + 20, t.freq_scale);
        put_u64(out, th + 24, t.start.freq);
        put_u64(out, th + 32, t.start.tsc);
        put_u64(out, th + 40, t.start.monotonic_ns);
        put_u64(out, th + 48, t.start.wall_sec);
        put_u64(out, th + 56, t.start.wall_usec);
    }

    /// Parse a header; `None` if the bytes are short or the magic is wrong.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SUBBUF_HEADER_SIZE {
            return None;
        }
        let th = TRACE_HEADER;
        let magic = get_u32(bytes, th);
        if magic != TRACER_MAGIC_NUMBER {
            return None;
        }
        let trace = TraceHeader {
            magic,
            arch_type: ArchType::from_u32(get_u32(bytes, th + 4)),
            arch_variant: get_u32(bytes, th + 8),
            version: u16::from_ne_bytes([bytes[th + 12], bytes[th + 13]]) & VERSION_MASK,
            arch_size: bytes[th + 14],
            flight_recorder: bytes[th + 15] != 0,
            has_heartbeat: bytes[th + 16] != 0,
            has_alignment: bytes[th + 17] != 0,
            freq_scale: get_u32(bytes, th + 20),
            start: TraceStart {
                freq: get_u64(bytes, th + 24),
                tsc: get_u64(bytes, th + 32),
                monotonic_ns: get_u64(bytes, th + 40),
                wall_sec: get_u64(bytes, th + 48),
                wall_usec: get_u64(bytes, th + 56),
            },
        };
        Some(Self {
            begin_tsc: get_u64(bytes, BEGIN_TSC),
            begin_freq: get_u64(bytes, BEGIN_FREQ),
            end_tsc: get_u64(bytes, END_TSC),
            end_freq: get_u64(bytes, END_FREQ),
            lost_size: get_u32(bytes, LOST_SIZE),
            subbuf_size: get_u32(bytes, SUBBUF_SIZE),
            trace,
        })
    }

    /// Bytes the closing writer fills in: end cycle count, end frequency and
    /// the unused tail, laid out for [`CLOSE_FIELDS`].
    pub fn encode_close(end_tsc: u64, end_freq: u64, lost_size: u32) -> [u8; CLOSE_LEN] {
        let mut out = [0u8; CLOSE_LEN];
        put_u64(&mut out, 0, end_tsc);
        put_u64(&mut out, END_FREQ - END_TSC, end_freq);
        put_u32(&mut out, LOST_SIZE - END_TSC, lost_size);
        out
    }
}
