//! Per-CPU ring buffer with lock-free slot reservation.
//!
//! Each buffer is a power-of-two array of `n_subbufs` sub-buffers of
//! `subbuf_size` bytes. Writers on the owning CPU (task code, and anything
//! that interrupts it) reserve slots by advancing a monotonic byte `offset`
//! with a compare-and-swap, fill them in, then commit them. Readers consume
//! whole sub-buffers once every byte of them has been committed.
//!
//! # Offsets
//!
//! `offset`, `consumed` and every slot position are absolute byte counts that
//! only grow. The sub-buffer of a position is
//! `(pos / subbuf_size) mod n_subbufs` and its generation is `pos / buf_size`.
//! Each sub-buffer keeps a cumulative commit count; it is complete for
//! generation `g` when the count reaches `(g + 1) * subbuf_size`.
//!
//! # Sub-buffer switches
//!
//! ```text
//!   sub-buffer k                         sub-buffer k+1
//! +--------+-------+-------+-----------+--------+-------+----
//! | header | event | event | lost tail | header | event | ...
//! +--------+-------+-------+-----------+--------+-------+----
//!                          ^ end switch ^ begin switch
//! ```
//!
//! A reservation that does not fit in the current sub-buffer closes it
//! (recording the unused tail in its header and committing the tail) and opens
//! the next one. Opening a sub-buffer that still holds unread data either
//! fails (`events_lost`) or, on an overwriting buffer, pushes the reader
//! forward (`corrupted_subbuffers`).
//!
//! Nothing on the write side blocks, allocates or takes a lock.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::task::Waker;
use core::time::Duration;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_queue::ArrayQueue;
use futures_util::task::AtomicWaker;

use crate::config::ChannelSizing;
use crate::error::{TraceError, TraceResult};
use crate::format::{SubbufferHeader, TraceHeader, CLOSE_FIELDS, SUBBUF_HEADER_SIZE};
use crate::header::{encode_event, event_layout, EventHeader, EventLayout, Field, HeaderFormat};
use crate::output::BufferStats;
use crate::timestamp;

// =============================================================================
// Storage
// =============================================================================

/// Zeroed, cache-line aligned byte arena.
struct Storage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena is plain bytes; concurrent access is coordinated by the
// reservation protocol (disjoint slots) and by readers validating copies.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

impl Storage {
    fn zeroed(size: usize) -> TraceResult<Self> {
        let layout = Layout::from_size_align(size, 64).map_err(|_| TraceError::InvalidArgument)?;
        if layout.size() == 0 {
            return Err(TraceError::InvalidArgument);
        }
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr, layout })
            .ok_or(TraceError::NoMemory)
    }

    /// Copy `src` into the arena at `at`.
    ///
    /// # Safety
    ///
    /// The caller must own `at..at + src.len()` through a reservation.
    #[inline(always)]
    unsafe fn write(&self, at: usize, src: &[u8]) {
        debug_assert!(at + src.len() <= self.layout.size());
        core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(at), src.len());
    }

    /// Borrow `at..at + len` mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the range through a reservation.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self, at: usize, len: usize) -> &mut [u8] {
        debug_assert!(at + len <= self.layout.size());
        core::slice::from_raw_parts_mut(self.ptr.as_ptr().add(at), len)
    }

    /// Snapshot `at..at + len`. The bytes may be torn if a writer overwrote
    /// them meanwhile; callers validate the copy afterwards.
    fn copy_out(&self, at: usize, len: usize) -> Vec<u8> {
        debug_assert!(at + len <= self.layout.size());
        let mut out = vec![0u8; len];
        // SAFETY: the range lies inside the arena and `out` is a fresh buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(at), out.as_mut_ptr(), len);
        }
        out
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// =============================================================================
// Slots
// =============================================================================

/// A reserved, not yet committed, region of a ring buffer.
///
/// Not `Clone`: the holder is the only writer of the region until it hands the
/// slot back through [`RingBuffer::commit`].
#[derive(Debug)]
#[must_use = "a reserved slot must be committed or its sub-buffer never completes"]
pub struct Slot {
    begin: usize,
    size: usize,
    tsc: u64,
    layout: EventLayout,
    /// The slot ends exactly on a sub-buffer boundary.
    closes: bool,
}

impl Slot {
    /// Absolute buffer offset of the slot.
    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Cycle counter sampled at reservation.
    #[inline]
    pub fn tsc(&self) -> u64 {
        self.tsc
    }

    #[inline]
    pub fn layout(&self) -> &EventLayout {
        &self.layout
    }
}

/// Outcome of planning a reservation against a loaded offset.
struct Plan {
    begin: usize,
    end: usize,
    layout: EventLayout,
    /// Closing the previous sub-buffer: (position inside it, unused tail).
    end_switch: Option<(usize, usize)>,
    /// Opening a sub-buffer at this boundary.
    begin_switch: Option<usize>,
}

// =============================================================================
// Ring Buffer
// =============================================================================

/// One CPU's buffer within a channel.
#[repr(C, align(64))]
pub struct RingBuffer {
    /// Next byte to reserve.
    offset: AtomicUsize,
    /// Start of the oldest unread sub-buffer.
    consumed: AtomicUsize,
    /// Readers currently attached.
    active_readers: AtomicUsize,
    /// Cumulative committed bytes, per sub-buffer.
    commit_count: Box<[AtomicUsize]>,
    /// Committed bytes across all sub-buffers.
    commit_total: AtomicU64,
    events_lost: AtomicU64,
    corrupted: AtomicU64,
    /// Cycle count at which the current sub-buffer was opened.
    begin_tsc: AtomicU64,
    /// Completed sub-buffers are waiting for the delivery timer.
    deliver_pending: AtomicBool,
    waker: AtomicWaker,
    /// Blocking user-space writers waiting for readers to free space.
    space: (Mutex<()>, Condvar),
    pending: Arc<ArrayQueue<usize>>,
    storage: Storage,
    cpu: usize,
    subbuf_size: usize,
    n_subbufs: usize,
    buf_size: usize,
    overwrite: bool,
    format: HeaderFormat,
    trace_header: TraceHeader,
}

impl RingBuffer {
    /// Allocate a zeroed buffer for `cpu`. `sizing` must already be validated.
    ///
    /// Completed sub-buffers are announced by pushing `cpu` onto `pending`.
    pub fn new(
        cpu: usize,
        sizing: ChannelSizing,
        overwrite: bool,
        format: HeaderFormat,
        trace_header: TraceHeader,
        pending: Arc<ArrayQueue<usize>>,
    ) -> TraceResult<Self> {
        debug_assert!(sizing.subbuf_size.is_power_of_two());
        debug_assert!(sizing.n_subbufs.is_power_of_two());
        let buf_size = sizing.buffer_size();
        let storage = Storage::zeroed(buf_size)?;

        let mut commit_count = Vec::new();
        commit_count
            .try_reserve_exact(sizing.n_subbufs)
            .map_err(|_| TraceError::NoMemory)?;
        commit_count.extend((0..sizing.n_subbufs).map(|_| AtomicUsize::new(0)));

        Ok(Self {
            offset: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            active_readers: AtomicUsize::new(0),
            commit_count: commit_count.into_boxed_slice(),
            commit_total: AtomicU64::new(0),
            events_lost: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
            begin_tsc: AtomicU64::new(0),
            deliver_pending: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            space: (Mutex::new(()), Condvar::new()),
            pending,
            storage,
            cpu,
            subbuf_size: sizing.subbuf_size,
            n_subbufs: sizing.n_subbufs,
            buf_size,
            overwrite,
            format,
            trace_header,
        })
    }

    #[inline(always)]
    fn subbuf_offset(&self, pos: usize) -> usize {
        pos & (self.subbuf_size - 1)
    }

    #[inline(always)]
    fn subbuf_trunc(&self, pos: usize) -> usize {
        pos & !(self.subbuf_size - 1)
    }

    #[inline(always)]
    fn subbuf_index(&self, pos: usize) -> usize {
        (pos / self.subbuf_size) & (self.n_subbufs - 1)
    }

    #[inline(always)]
    fn buf_offset(&self, pos: usize) -> usize {
        pos & (self.buf_size - 1)
    }

    // =========================================================================
    // Write side
    // =========================================================================

    /// Reserve a slot for an event made of `fields`.
    ///
    /// Fails with `NoSpace` (and one more lost event) when the next sub-buffer
    /// is unread on a non-overwriting buffer, when a sub-buffer about to be
    /// reused is still being committed, or when the event can never fit in a
    /// sub-buffer. A failed reservation changes nothing else.
    pub fn reserve(&self, fields: &[Field<'_>]) -> TraceResult<Slot> {
        self.try_reserve(fields).map_err(|err| {
            self.record_lost();
            err
        })
    }

    /// [`reserve`](Self::reserve) without counting a failure as a lost event.
    ///
    /// For writers that retry: they call [`record_lost`](Self::record_lost)
    /// once if they finally give up.
    pub fn try_reserve(&self, fields: &[Field<'_>]) -> TraceResult<Slot> {
        loop {
            let old = self.offset.load(Ordering::Relaxed);
            let tsc = timestamp::trace_timestamp();
            let plan = self.plan(old, fields).ok_or(TraceError::NoSpace)?;

            if self
                .offset
                .compare_exchange_weak(old, plan.end, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if let Some(boundary) = plan.begin_switch {
                if self.overwrite {
                    self.push_reader(boundary);
                }
            }
            if let Some((pos, lost)) = plan.end_switch {
                self.close_subbuf(pos, lost, tsc);
                self.commit_bytes(pos, lost);
            }
            if let Some(boundary) = plan.begin_switch {
                self.open_subbuf(boundary, tsc);
                self.commit_bytes(boundary, SUBBUF_HEADER_SIZE);
            }

            return Ok(Slot {
                begin: plan.begin,
                size: plan.layout.slot_size,
                tsc,
                layout: plan.layout,
                closes: self.subbuf_offset(plan.end) == 0,
            });
        }
    }

    /// Count one event dropped for lack of space.
    pub fn record_lost(&self) {
        self.events_lost.fetch_add(1, Ordering::Relaxed);
    }

    fn plan(&self, old: usize, fields: &[Field<'_>]) -> Option<Plan> {
        let mut begin = old;
        let mut end_switch = None;

        let in_subbuf = self.subbuf_offset(begin);
        if in_subbuf != 0 {
            let layout = event_layout(begin, self.format, fields);
            if in_subbuf + layout.slot_size <= self.subbuf_size {
                return Some(Plan {
                    begin,
                    end: begin + layout.slot_size,
                    layout,
                    end_switch: None,
                    begin_switch: None,
                });
            }
            let lost = self.subbuf_size - in_subbuf;
            end_switch = Some((begin, lost));
            begin += lost;
        }

        if !self.subbuf_writable(begin) {
            return None;
        }
        let event_begin = begin + SUBBUF_HEADER_SIZE;
        let layout = event_layout(event_begin, self.format, fields);
        if SUBBUF_HEADER_SIZE + layout.slot_size > self.subbuf_size {
            return None;
        }
        Some(Plan {
            begin: event_begin,
            end: event_begin + layout.slot_size,
            layout,
            end_switch,
            begin_switch: Some(begin),
        })
    }

    /// Whether the sub-buffer starting at `boundary` may be opened.
    fn subbuf_writable(&self, boundary: usize) -> bool {
        let idx = self.subbuf_index(boundary);
        let generation = boundary / self.buf_size;
        if self.commit_count[idx].load(Ordering::Acquire) != generation * self.subbuf_size {
            return false;
        }
        if !self.overwrite {
            let consumed = self.consumed.load(Ordering::Acquire);
            if boundary.wrapping_sub(self.subbuf_trunc(consumed)) >= self.buf_size {
                return false;
            }
        }
        true
    }

    /// Move the reader off the sub-buffer about to be overwritten.
    fn push_reader(&self, boundary: usize) {
        let target = boundary + self.subbuf_size - self.buf_size;
        let mut consumed = self.consumed.load(Ordering::Acquire);
        while boundary.wrapping_sub(consumed) >= self.buf_size {
            match self.consumed.compare_exchange_weak(
                consumed,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.corrupted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(current) => consumed = current,
            }
        }
    }

    /// Write the begin half of a sub-buffer header.
    fn open_subbuf(&self, boundary: usize, tsc: u64) {
        let header = SubbufferHeader::begin(
            tsc,
            timestamp::timestamp_frequency_hz(),
            self.subbuf_size as u32,
            self.trace_header,
        );
        let mut raw = [0u8; SUBBUF_HEADER_SIZE];
        header.encode(&mut raw);
        let at = self.buf_offset(boundary);
        // SAFETY: the header bytes outside CLOSE_FIELDS belong to the writer
        // whose reservation opened this sub-buffer.
        unsafe {
            self.storage.write(at, &raw[..CLOSE_FIELDS.start]);
            self.storage
                .write(at + CLOSE_FIELDS.end, &raw[CLOSE_FIELDS.end..]);
        }
        self.begin_tsc.store(tsc, Ordering::Relaxed);
    }

    /// Write the close half of the header of the sub-buffer holding `pos`.
    fn close_subbuf(&self, pos: usize, lost: usize, tsc: u64) {
        let close = SubbufferHeader::encode_close(tsc, timestamp::timestamp_frequency_hz(), lost as u32);
        let at = self.buf_offset(self.subbuf_trunc(pos)) + CLOSE_FIELDS.start;
        // SAFETY: CLOSE_FIELDS belong to the one writer whose reservation
        // ended the sub-buffer.
        unsafe { self.storage.write(at, &close) }
    }

    /// Encode an event into a reserved slot.
    pub fn write_slot(&self, slot: &Slot, facility_id: u8, event_id: u8, fields: &[Field<'_>]) {
        let header = EventHeader::new(slot.tsc, facility_id, event_id, slot.layout.event_size_field());
        // SAFETY: `slot` came from `reserve` on this buffer and has not been
        // committed, so its range is exclusively ours.
        let bytes = unsafe { self.storage.slice_mut(self.buf_offset(slot.begin), slot.size) };
        let written = encode_event(bytes, slot.begin, self.format, &header, fields);
        debug_assert_eq!(written, slot.layout);
    }

    /// Publish a slot.
    pub fn commit(&self, slot: Slot) {
        if slot.closes {
            self.close_subbuf(slot.begin, 0, slot.tsc);
        }
        self.commit_bytes(slot.begin, slot.size);
    }

    fn commit_bytes(&self, pos: usize, size: usize) {
        let idx = self.subbuf_index(pos);
        let generation = pos / self.buf_size;
        let count = self.commit_count[idx].fetch_add(size, Ordering::AcqRel) + size;
        self.commit_total.fetch_add(size as u64, Ordering::Relaxed);
        if count == (generation + 1) * self.subbuf_size {
            self.subbuf_complete();
        }
    }

    fn subbuf_complete(&self) {
        if !self.deliver_pending.swap(true, Ordering::AcqRel) {
            // At most one entry per CPU is ever queued.
            let _ = self.pending.push(self.cpu);
        }
    }

    /// Reserve, encode and commit one event.
    pub fn write(&self, facility_id: u8, event_id: u8, fields: &[Field<'_>]) -> TraceResult<()> {
        let slot = self.reserve(fields)?;
        self.write_slot(&slot, facility_id, event_id, fields);
        self.commit(slot);
        Ok(())
    }

    /// Close the current partial sub-buffer so readers receive it.
    pub fn force_switch(&self) {
        let tsc = timestamp::trace_timestamp();
        let mut old = self.offset.load(Ordering::Relaxed);
        loop {
            let in_subbuf = self.subbuf_offset(old);
            if in_subbuf == 0 {
                return;
            }
            let lost = self.subbuf_size - in_subbuf;
            match self.offset.compare_exchange_weak(
                old,
                old + lost,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.close_subbuf(old, lost, tsc);
                    self.commit_bytes(old, lost);
                    return;
                }
                Err(current) => old = current,
            }
        }
    }

    // =========================================================================
    // Read side
    // =========================================================================

    /// Take the oldest complete sub-buffer, if any.
    ///
    /// The bytes are copied out and then claimed by advancing `consumed`; if a
    /// writer overwrote the sub-buffer meanwhile the claim fails and the copy
    /// is discarded.
    pub fn read_subbuffer(&self) -> Option<Vec<u8>> {
        loop {
            let consumed = self.consumed.load(Ordering::Acquire);
            if consumed >= self.offset.load(Ordering::Acquire) {
                return None;
            }
            let idx = self.subbuf_index(consumed);
            let generation = consumed / self.buf_size;
            if self.commit_count[idx].load(Ordering::Acquire) < (generation + 1) * self.subbuf_size {
                return None;
            }

            let data = self.storage.copy_out(self.buf_offset(consumed), self.subbuf_size);
            if self
                .consumed
                .compare_exchange(
                    consumed,
                    consumed + self.subbuf_size,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.notify_space();
                return Some(data);
            }
        }
    }

    fn notify_space(&self) {
        let (lock, cvar) = &self.space;
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        cvar.notify_all();
    }

    /// Whether an event of `size` bytes could be reserved right now.
    pub fn has_space(&self, size: usize) -> bool {
        if self.overwrite {
            return true;
        }
        let offset = self.offset.load(Ordering::Acquire);
        let in_subbuf = self.subbuf_offset(offset);
        if in_subbuf != 0 && in_subbuf + size <= self.subbuf_size {
            return true;
        }
        let next = if in_subbuf == 0 {
            offset
        } else {
            self.subbuf_trunc(offset) + self.subbuf_size
        };
        let consumed = self.subbuf_trunc(self.consumed.load(Ordering::Acquire));
        next.wrapping_sub(consumed) < self.buf_size
    }

    /// Block until [`has_space`](Self::has_space) or until `timeout` passes.
    ///
    /// Only for the user-space write path; never called by in-process probes.
    pub fn wait_for_space(&self, size: usize, timeout: Duration) -> TraceResult<()> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &self.space;
        let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.has_space(size) {
            let now = Instant::now();
            if now >= deadline {
                return Err(TraceError::Timeout);
            }
            guard = match cvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    pub fn register_waker(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Wake the reader parked on this buffer.
    pub fn wake_readers(&self) {
        self.deliver_pending.store(false, Ordering::Release);
        self.waker.wake();
    }

    pub fn deliver_pending(&self) -> bool {
        self.deliver_pending.load(Ordering::Acquire)
    }

    pub(crate) fn reader_attached(&self) {
        self.active_readers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reader_detached(&self) {
        self.active_readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_readers(&self) -> usize {
        self.active_readers.load(Ordering::Acquire)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[inline]
    pub fn subbuf_size(&self) -> usize {
        self.subbuf_size
    }

    #[inline]
    pub fn n_subbufs(&self) -> usize {
        self.n_subbufs
    }

    #[inline]
    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    #[inline]
    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    pub fn events_lost(&self) -> u64 {
        self.events_lost.load(Ordering::Relaxed)
    }

    pub fn corrupted_subbuffers(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }

    /// Cycle count at which the current sub-buffer was opened.
    pub fn begin_tsc(&self) -> u64 {
        self.begin_tsc.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            cpu: self.cpu,
            offset: self.offset.load(Ordering::Acquire) as u64,
            consumed: self.consumed.load(Ordering::Acquire) as u64,
            committed: self.commit_total.load(Ordering::Acquire),
            events_lost: self.events_lost(),
            corrupted: self.corrupted_subbuffers(),
        }
    }
}

impl core::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("cpu", &self.cpu)
            .field("subbuf_size", &self.subbuf_size)
            .field("n_subbufs", &self.n_subbufs)
            .field("overwrite", &self.overwrite)
            .field("stats", &self.stats())
            .finish()
    }
}
