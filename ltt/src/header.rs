//! Event header codec.
//!
//! Every event in a sub-buffer is laid out as:
//!
//! ```text
//! +----------------+--------+---------------+---------+-----+---------+
//! | before-hdr pad | header | after-hdr pad | field 0 | pad | field 1 | ...
//! +----------------+--------+---------------+---------+-----+---------+
//! ```
//!
//! Header formats:
//!
//! ```text
//! full (12 bytes):    | timestamp u64 | facility u8 | event u8 | size u16 |
//! compact (8 bytes):  | timestamp u32 | facility u8 | event u8 | size u16 |
//! ```
//!
//! The compact form is used when a periodic heartbeat event carries the full
//! 64-bit cycle counter. `size` counts everything after the header (paddings
//! included) and saturates at 0xFFFF.
//!
//! Layout is computed by one pure function, [`event_layout`], which the ring
//! buffer runs once to size a reservation and [`encode_event`] runs again to
//! place the bytes. Both passes walk the fields through the same code, so
//! their offsets cannot disagree.

use core::mem::size_of;

/// Size of a pointer on this architecture; caps natural alignment.
pub const POINTER_SIZE: usize = size_of::<usize>();

/// Largest value the header's `size` field can hold.
pub const EVENT_SIZE_MAX: usize = 0xFFFF;

/// Header size with a 64-bit timestamp.
pub const FULL_HEADER_SIZE: usize = 12;

/// Header size with a 32-bit timestamp.
pub const COMPACT_HEADER_SIZE: usize = 8;

/// Padding needed to bring `offset` up to a multiple of `align`.
#[inline(always)]
pub const fn align_pad(offset: usize, align: usize) -> usize {
    if align <= 1 {
        return 0;
    }
    (align - (offset % align)) % align
}

/// Natural alignment of a field of `size` bytes: `min(pointer size, size)`.
#[inline(always)]
pub const fn natural_align(size: usize) -> usize {
    if size == 0 {
        1
    } else if size < POINTER_SIZE {
        size
    } else {
        POINTER_SIZE
    }
}

// =============================================================================
// Header Format
// =============================================================================

/// Header shape selected per trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderFormat {
    /// 32-bit timestamps (a heartbeat supplies the high bits).
    pub heartbeat: bool,
    /// Pad fields to their natural alignment. When false the stream is packed.
    pub alignment: bool,
}

impl HeaderFormat {
    pub const fn new(heartbeat: bool, alignment: bool) -> Self {
        Self {
            heartbeat,
            alignment,
        }
    }

    /// Fixed header size.
    #[inline(always)]
    pub const fn header_size(&self) -> usize {
        if self.heartbeat {
            COMPACT_HEADER_SIZE
        } else {
            FULL_HEADER_SIZE
        }
    }

    /// Alignment of the header: its largest member, capped at pointer size.
    #[inline(always)]
    pub const fn header_align(&self) -> usize {
        if !self.alignment {
            return 1;
        }
        if self.heartbeat {
            natural_align(4)
        } else {
            natural_align(8)
        }
    }

    #[inline(always)]
    const fn field_align(&self, align: usize) -> usize {
        if self.alignment {
            align
        } else {
            1
        }
    }
}

impl Default for HeaderFormat {
    fn default() -> Self {
        Self::new(false, true)
    }
}

// =============================================================================
// Fields
// =============================================================================

mod sealed {
    pub trait Sealed {}
}

/// Primitive values that can be logged by their in-memory bytes.
pub trait Scalar: Copy + sealed::Sealed {}

macro_rules! impl_scalar {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Scalar for $t {}
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// One payload field: its bytes plus the alignment it must start on.
#[derive(Clone, Copy, Debug)]
pub struct Field<'a> {
    data: &'a [u8],
    align: usize,
}

impl<'a> Field<'a> {
    /// A primitive value, aligned to `min(pointer size, size_of::<T>())`.
    #[inline(always)]
    pub fn scalar<T: Scalar>(value: &'a T) -> Self {
        // SAFETY: Scalar is only implemented for primitive integers, which have
        // no padding bytes and are valid to view as initialized u8s.
        let data = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>())
        };
        Self {
            data,
            align: natural_align(size_of::<T>()),
        }
    }

    /// Raw bytes (strings, blobs); byte aligned.
    #[inline(always)]
    pub const fn bytes(data: &'a [u8]) -> Self {
        Self { data, align: 1 }
    }

    /// Bytes with an explicit alignment (a power of two).
    #[inline(always)]
    pub const fn with_align(data: &'a [u8], align: usize) -> Self {
        Self { data, align }
    }

    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub const fn align(&self) -> usize {
        self.align
    }

    #[inline(always)]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Byte layout of one event slot starting at a given buffer offset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventLayout {
    /// Padding before the header so the header is aligned.
    pub before_hdr_pad: usize,
    /// Fixed header size.
    pub header_size: usize,
    /// Padding between the header and the first field.
    pub after_hdr_pad: usize,
    /// Everything after the header: paddings plus field bytes.
    pub payload_size: usize,
    /// Total bytes the slot occupies.
    pub slot_size: usize,
}

impl EventLayout {
    /// Offset of the header relative to the slot start.
    #[inline(always)]
    pub const fn header_offset(&self) -> usize {
        self.before_hdr_pad
    }

    /// Value stored in the header's `size` field.
    #[inline(always)]
    pub const fn event_size_field(&self) -> u16 {
        if self.payload_size > EVENT_SIZE_MAX {
            EVENT_SIZE_MAX as u16
        } else {
            self.payload_size as u16
        }
    }
}

/// Walk the fields of an event placed at `offset`, calling `place` with each
/// field's position relative to the slot start.
#[inline(always)]
fn walk_fields<F>(offset: usize, format: HeaderFormat, fields: &[Field<'_>], mut place: F) -> EventLayout
where
    F: FnMut(usize, &Field<'_>),
{
    let before_hdr_pad = align_pad(offset, format.header_align());
    let header_size = format.header_size();
    let payload_start = offset + before_hdr_pad + header_size;

    let mut pos = payload_start;
    let mut after_hdr_pad = 0;
    for (i, field) in fields.iter().enumerate() {
        let pad = align_pad(pos, format.field_align(field.align));
        if i == 0 {
            after_hdr_pad = pad;
        }
        pos += pad;
        place(pos - offset, field);
        pos += field.len();
    }

    EventLayout {
        before_hdr_pad,
        header_size,
        after_hdr_pad,
        payload_size: pos - payload_start,
        slot_size: pos - offset,
    }
}

/// Size-only pass: the layout of an event whose slot starts at `offset`.
#[inline]
pub fn event_layout(offset: usize, format: HeaderFormat, fields: &[Field<'_>]) -> EventLayout {
    walk_fields(offset, format, fields, |_, _| {})
}

// =============================================================================
// Event Header
// =============================================================================

/// Decoded event header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// Cycle counter (truncated to 32 bits in the compact format).
    pub timestamp: u64,
    pub facility_id: u8,
    pub event_id: u8,
    /// Bytes following the header, saturated at 0xFFFF.
    pub event_size: u16,
}

impl EventHeader {
    pub const fn new(timestamp: u64, facility_id: u8, event_id: u8, event_size: u16) -> Self {
        Self {
            timestamp,
            facility_id,
            event_id,
            event_size,
        }
    }

    fn write_to(&self, out: &mut [u8], format: HeaderFormat) {
        let ts_len = if format.heartbeat {
            out[..4].copy_from_slice(&(self.timestamp as u32).to_ne_bytes());
            4
        } else {
            out[..8].copy_from_slice(&self.timestamp.to_ne_bytes());
            8
        };
        out[ts_len] = self.facility_id;
        out[ts_len + 1] = self.event_id;
        out[ts_len + 2..ts_len + 4].copy_from_slice(&self.event_size.to_ne_bytes());
    }
}

/// Write pass: place the header and fields into `slot`, which starts at buffer
/// offset `offset`. Padding bytes are zeroed.
///
/// Returns the layout used, identical to [`event_layout`] for the same inputs.
pub fn encode_event(
    slot: &mut [u8],
    offset: usize,
    format: HeaderFormat,
    header: &EventHeader,
    fields: &[Field<'_>],
) -> EventLayout {
    let mut cursor = 0;
    let layout = walk_fields(offset, format, fields, |at, field| {
        slot[cursor..at].fill(0);
        slot[at..at + field.len()].copy_from_slice(field.data());
        cursor = at + field.len();
    });

    let hdr = layout.header_offset();
    slot[..hdr].fill(0);
    header.write_to(&mut slot[hdr..hdr + layout.header_size], format);
    if fields.is_empty() {
        cursor = layout.slot_size;
    }
    let first_field = hdr + layout.header_size + layout.after_hdr_pad;
    slot[hdr + layout.header_size..first_field].fill(0);
    debug_assert_eq!(cursor, layout.slot_size);
    layout
}

/// Read a header from the start of `bytes`.
pub fn decode_header(bytes: &[u8], format: HeaderFormat) -> Option<EventHeader> {
    if bytes.len() < format.header_size() {
        return None;
    }
    let (timestamp, ts_len) = if format.heartbeat {
        (u64::from(u32::from_ne_bytes(bytes[..4].try_into().ok()?)), 4)
    } else {
        (u64::from_ne_bytes(bytes[..8].try_into().ok()?), 8)
    };
    Some(EventHeader {
        timestamp,
        facility_id: bytes[ts_len],
        event_id: bytes[ts_len + 1],
        event_size: u16::from_ne_bytes(bytes[ts_len + 2..ts_len + 4].try_into().ok()?),
    })
}
