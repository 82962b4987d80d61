// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-size frame slot pool in shared memory.
//
// One named segment holds everything the driver process and the output
// workers share:
//
//   PoolHeader   flags, geometry, process-shared lock + two conditions,
//                ring state for the free-slot queue and the work queue
//   free ring    slot_count x u64            (slot offsets)
//   work ring    slot_count x SlotDescriptor (filled slots)
//   slot data    slot_count x slot_size bytes, 64-byte aligned
//
// Every slot offset lives in exactly one place: the free ring, the work ring,
// or the hands of a single producer/consumer. Each ring can therefore never
// hold more than slot_count entries.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::condition::IpcCondition;
use crate::error::{CamdError, Result};
use crate::mutex::{IpcMutex, IpcMutexGuard};
use crate::shm::{ShmHandle, ShmOpenMode};

const POOL_MAGIC: u64 = 0x4c4f_4f50_444d_4143; // "CAMDPOOL" little-endian
const DATA_ALIGN: usize = 64;

// ---------------------------------------------------------------------------
// Shared layout
// ---------------------------------------------------------------------------

#[repr(C)]
struct RingState {
    head: u64,
    len: u64,
}

#[repr(C)]
struct PoolHeader {
    magic: AtomicU64,
    constructed: AtomicBool,
    stop: AtomicBool,
    abort: AtomicBool,
    slot_count: u64,
    slot_size: u64,
    generation: AtomicU64,
    lock: libc::pthread_mutex_t,
    free_cond: libc::pthread_cond_t,
    work_cond: libc::pthread_cond_t,
    // Protected by `lock`.
    free: RingState,
    work: RingState,
}

/// Capture metadata travelling with a filled slot.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMetadata {
    /// 1-based frame number within the current sequence.
    pub frame_counter: u64,
    /// Lifetime exposure count from the persisted counters.
    pub shutter_counter: u64,
    /// Exposure start, nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
}

/// A filled slot waiting in, or taken from, the work queue.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub offset: u64,
    /// Bytes written into the slot.
    pub length: u64,
    /// Pool generation the slot was drawn in; see [`FramePool::rebuild`].
    pub generation: u64,
    pub meta: SequenceMetadata,
}

const FRAME_MAGIC: u32 = 0x4d52_4643; // "CFRM"

/// Acquisition settings written at the start of every filled slot, ahead of
/// the raw pixels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    magic: u32,
    /// [`crate::ReadoutMode`] raw value.
    pub mode: u32,
    pub sensor_width: u32,
    pub sensor_height: u32,
    /// 0-indexed inclusive `[x1, x2, y1, y2]`.
    pub window: [u32; 4],
    pub binning: [u32; 2],
    pub exposure_ns: u64,
    pub start_ns: i64,
    pub end_ns: i64,
    pub cooler_temperature: f64,
    pub cooler_setpoint: f64,
    pub cooler_locked: u32,
    pub cooler_enabled: u32,
    /// Raw 16-bit little-endian pixels following the header.
    pub pixel_bytes: u64,
}

pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new() -> Self {
        Self {
            magic: FRAME_MAGIC,
            ..Self::default()
        }
    }

    pub fn write_to(&self, slot: &mut [u8]) -> Result<()> {
        if slot.len() < FRAME_HEADER_LEN {
            return Err(CamdError::Pool("slot too small for frame header".into()));
        }
        unsafe { std::ptr::write_unaligned(slot.as_mut_ptr() as *mut FrameHeader, *self) };
        Ok(())
    }

    pub fn read_from(slot: &[u8]) -> Result<Self> {
        if slot.len() < FRAME_HEADER_LEN {
            return Err(CamdError::Pool(format!("slot holds only {} bytes", slot.len())));
        }
        let hdr = unsafe { std::ptr::read_unaligned(slot.as_ptr() as *const FrameHeader) };
        if hdr.magic != FRAME_MAGIC {
            return Err(CamdError::Pool("slot does not start with a frame header".into()));
        }
        let needed = FRAME_HEADER_LEN as u64 + hdr.pixel_bytes;
        if (slot.len() as u64) < needed {
            return Err(CamdError::Pool(format!(
                "frame truncated: {} of {needed} bytes",
                slot.len()
            )));
        }
        Ok(hdr)
    }

    /// Pixel bytes that follow the header in `slot`.
    pub fn pixels<'a>(&self, slot: &'a [u8]) -> &'a [u8] {
        &slot[FRAME_HEADER_LEN..FRAME_HEADER_LEN + self.pixel_bytes as usize]
    }
}

/// Slot size and count. The region is `slot_size * slot_count` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub slot_size: usize,
    pub slot_count: usize,
}

impl PoolGeometry {
    pub fn new(slot_size: usize, slot_count: usize) -> Result<Self> {
        if slot_size == 0 || slot_count == 0 {
            return Err(CamdError::Pool(format!(
                "invalid geometry: {slot_count} slots of {slot_size} bytes"
            )));
        }
        Ok(Self {
            slot_size,
            slot_count,
        })
    }

    /// Carve a region of `region_bytes` into slots of `slot_size`.
    pub fn from_region(region_bytes: usize, slot_size: usize) -> Result<Self> {
        if slot_size == 0 || region_bytes < slot_size {
            return Err(CamdError::Pool(format!(
                "region of {region_bytes} bytes cannot hold a {slot_size}-byte slot"
            )));
        }
        let slot_count = region_bytes / slot_size;
        let spare = region_bytes % slot_size;
        if spare != 0 {
            tracing::debug!(spare, "frame region does not divide evenly into slots");
        }
        Self::new(slot_size, slot_count)
    }

    pub fn region_bytes(&self) -> usize {
        self.slot_size * self.slot_count
    }

    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.slot_count).map(move |i| (i * self.slot_size) as u64)
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    free_off: usize,
    work_off: usize,
    data_off: usize,
    total: usize,
}

fn align_up(v: usize, align: usize) -> usize {
    v.div_ceil(align) * align
}

fn layout_of(g: PoolGeometry) -> Layout {
    let free_off = align_up(std::mem::size_of::<PoolHeader>(), 8);
    let work_off = align_up(
        free_off + g.slot_count * std::mem::size_of::<u64>(),
        std::mem::align_of::<SlotDescriptor>(),
    );
    let data_off = align_up(
        work_off + g.slot_count * std::mem::size_of::<SlotDescriptor>(),
        DATA_ALIGN,
    );
    Layout {
        free_off,
        work_off,
        data_off,
        total: data_off + g.region_bytes(),
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAccounting {
    pub free: usize,
    pub work: usize,
    pub total: usize,
}

impl PoolAccounting {
    /// Slots neither queued as free nor as work: held by the driver or a
    /// worker (or lost to a killed process until the next rebuild).
    pub fn held(&self) -> usize {
        self.total - self.free - self.work
    }
}

/// Entries discarded by [`FramePool::drain`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub free: usize,
    pub work: usize,
}

// ---------------------------------------------------------------------------
// FramePool
// ---------------------------------------------------------------------------

/// Handle to a frame pool segment. One per process; share it with `Arc`.
pub struct FramePool {
    shm: ShmHandle,
    geometry: PoolGeometry,
    layout: Layout,
    lock: IpcMutex,
    free_cond: IpcCondition,
    work_cond: IpcCondition,
}

// Safety: all shared state is behind atomics or the process-shared lock.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Create the pool segment, replacing any stale one with the same name.
    /// Every slot starts in the free-slot queue.
    pub fn create(name: &str, geometry: PoolGeometry) -> Result<Self> {
        let layout = layout_of(geometry);
        ShmHandle::unlink_by_name(name);
        let shm = ShmHandle::acquire(name, layout.total, ShmOpenMode::Create)?;

        let base = shm.as_mut_ptr();
        let hdr = base as *mut PoolHeader;
        let (lock, free_cond, work_cond) = unsafe {
            std::ptr::write_bytes(base, 0, layout.data_off);
            (*hdr).slot_count = geometry.slot_count as u64;
            (*hdr).slot_size = geometry.slot_size as u64;
            (
                IpcMutex::init(std::ptr::addr_of_mut!((*hdr).lock))?,
                IpcCondition::init(std::ptr::addr_of_mut!((*hdr).free_cond))?,
                IpcCondition::init(std::ptr::addr_of_mut!((*hdr).work_cond))?,
            )
        };

        let pool = Self {
            shm,
            geometry,
            layout,
            lock,
            free_cond,
            work_cond,
        };
        {
            let _g = pool.lock()?;
            pool.refill_locked()?;
        }
        pool.header().magic.store(POOL_MAGIC, Ordering::Relaxed);
        pool.header().constructed.store(true, Ordering::Release);

        tracing::info!(
            name,
            slots = geometry.slot_count,
            slot_size = geometry.slot_size,
            "created frame pool"
        );
        Ok(pool)
    }

    /// Attach to a pool created by another process.
    pub fn open(name: &str) -> Result<Self> {
        let shm = ShmHandle::open_existing(name)?;
        let base = shm.as_mut_ptr();
        if shm.user_size() < std::mem::size_of::<PoolHeader>() {
            return Err(CamdError::Pool(format!("segment {name} is too small")));
        }
        let hdr = unsafe { &*(base as *const PoolHeader) };
        if !hdr.constructed.load(Ordering::Acquire) || hdr.magic.load(Ordering::Relaxed) != POOL_MAGIC
        {
            return Err(CamdError::Pool(format!("segment {name} is not a frame pool")));
        }

        let geometry = PoolGeometry::new(hdr.slot_size as usize, hdr.slot_count as usize)?;
        let layout = layout_of(geometry);
        if shm.user_size() < layout.total {
            return Err(CamdError::Pool(format!(
                "segment {name} holds {} bytes, geometry needs {}",
                shm.user_size(),
                layout.total
            )));
        }

        let hdr = base as *mut PoolHeader;
        let (lock, free_cond, work_cond) = unsafe {
            (
                IpcMutex::attach(std::ptr::addr_of_mut!((*hdr).lock)),
                IpcCondition::attach(std::ptr::addr_of_mut!((*hdr).free_cond)),
                IpcCondition::attach(std::ptr::addr_of_mut!((*hdr).work_cond)),
            )
        };

        Ok(Self {
            shm,
            geometry,
            layout,
            lock,
            free_cond,
            work_cond,
        })
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn slot_count(&self) -> usize {
        self.geometry.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.geometry.slot_size
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Remove the segment name; mappings stay valid until dropped.
    pub fn unlink(&self) {
        self.shm.unlink();
    }

    /// Current pool generation.
    pub fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Acquire)
    }

    // --- flags ---

    /// Tell output workers to exit once they finish the slot in hand.
    pub fn raise_stop(&self) -> Result<()> {
        let _g = self.lock()?;
        self.header().stop.store(true, Ordering::Release);
        self.work_cond.notify_all()?;
        self.free_cond.notify_all()?;
        Ok(())
    }

    pub fn stop_requested(&self) -> bool {
        self.header().stop.load(Ordering::Acquire)
    }

    /// Ask the driver process to end the running sequence.
    pub fn request_abort(&self) {
        self.header().abort.store(true, Ordering::Release);
    }

    pub fn abort_requested(&self) -> bool {
        self.header().abort.load(Ordering::Acquire)
    }

    pub fn clear_abort(&self) {
        self.header().abort.store(false, Ordering::Release);
    }

    // --- free-slot queue ---

    /// Draw a free slot, waiting up to `timeout` (`None` = forever).
    /// `Ok(None)` on timeout.
    pub fn acquire_free(&self, timeout: Option<Duration>) -> Result<Option<FreeSlot<'_>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut g = self.lock()?;
        loop {
            if let Some(offset) = self.pop_locked(Queue::Free) {
                let generation = self.generation();
                return Ok(Some(FreeSlot {
                    pool: self,
                    offset,
                    generation,
                    consumed: false,
                }));
            }
            if !self.wait_locked(&self.free_cond, &mut g, deadline)? {
                return Ok(None);
            }
        }
    }

    /// Return `desc`'s offset to the free-slot queue. Returns `false` when the
    /// descriptor belongs to an older generation and was ignored.
    pub fn release(&self, desc: &SlotDescriptor) -> Result<bool> {
        self.release_offset(desc.offset, desc.generation)
    }

    fn release_offset(&self, offset: u64, generation: u64) -> Result<bool> {
        self.check_offset(offset)?;
        let _g = self.lock()?;
        if generation != self.generation() {
            tracing::debug!(offset, generation, "ignoring release from a previous pool generation");
            return Ok(false);
        }
        self.push_free_locked(offset)?;
        self.free_cond.notify_one()?;
        Ok(true)
    }

    // --- work queue ---

    /// Queue a filled slot for the output workers. Returns `false` when the
    /// descriptor belongs to an older generation and was dropped.
    pub fn submit(&self, desc: SlotDescriptor) -> Result<bool> {
        self.check_offset(desc.offset)?;
        if desc.length as usize > self.geometry.slot_size {
            return Err(CamdError::Pool(format!(
                "descriptor length {} exceeds slot size {}",
                desc.length, self.geometry.slot_size
            )));
        }
        let _g = self.lock()?;
        if desc.generation != self.generation() {
            return Ok(false);
        }
        let ring = self.ring_mut(Queue::Work);
        if ring.len as usize >= self.geometry.slot_count {
            return Err(CamdError::Pool("work queue overflow".into()));
        }
        let idx = (ring.head + ring.len) as usize % self.geometry.slot_count;
        unsafe { self.work_entries().add(idx).write(desc) };
        ring.len += 1;
        self.work_cond.notify_one()?;
        Ok(true)
    }

    /// Take the oldest filled slot, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout, or immediately once the stop signal is
    /// raised and the work queue is empty.
    pub fn take_work(&self, timeout: Option<Duration>) -> Result<Option<SlotLease<'_>>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut g = self.lock()?;
        loop {
            let ring = self.ring_mut(Queue::Work);
            if ring.len > 0 {
                let idx = ring.head as usize;
                let desc = unsafe { self.work_entries().add(idx).read() };
                ring.head = (ring.head + 1) % self.geometry.slot_count as u64;
                ring.len -= 1;
                return Ok(Some(SlotLease {
                    pool: self,
                    desc,
                    released: false,
                }));
            }
            if self.stop_requested() {
                return Ok(None);
            }
            if !self.wait_locked(&self.work_cond, &mut g, deadline)? {
                return Ok(None);
            }
        }
    }

    // --- reconciliation ---

    /// Discard everything in both queues without blocking and start a new
    /// generation, so slots still in flight are never returned twice.
    pub fn drain(&self) -> Result<DrainReport> {
        let _g = self.lock()?;
        Ok(self.drain_locked())
    }

    /// Drain, then put every slot back into the free-slot queue.
    pub fn rebuild(&self) -> Result<DrainReport> {
        let _g = self.lock()?;
        let report = self.drain_locked();
        self.refill_locked()?;
        self.header().abort.store(false, Ordering::Release);
        self.free_cond.notify_all()?;
        Ok(report)
    }

    pub fn accounting(&self) -> Result<PoolAccounting> {
        let _g = self.lock()?;
        Ok(PoolAccounting {
            free: self.ring_mut(Queue::Free).len as usize,
            work: self.ring_mut(Queue::Work).len as usize,
            total: self.geometry.slot_count,
        })
    }

    pub fn free_len(&self) -> Result<usize> {
        Ok(self.accounting()?.free)
    }

    pub fn work_len(&self) -> Result<usize> {
        Ok(self.accounting()?.work)
    }

    // --- internals ---

    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.shm.as_ptr() as *const PoolHeader) }
    }

    fn lock(&self) -> Result<IpcMutexGuard<'_>> {
        Ok(self.lock.lock()?)
    }

    #[allow(clippy::mut_from_ref)]
    fn ring_mut(&self, q: Queue) -> &mut RingState {
        // Only called with `lock` held.
        let hdr = self.shm.as_mut_ptr() as *mut PoolHeader;
        unsafe {
            match q {
                Queue::Free => &mut (*hdr).free,
                Queue::Work => &mut (*hdr).work,
            }
        }
    }

    fn free_entries(&self) -> *mut u64 {
        unsafe { self.shm.as_mut_ptr().add(self.layout.free_off) as *mut u64 }
    }

    fn work_entries(&self) -> *mut SlotDescriptor {
        unsafe { self.shm.as_mut_ptr().add(self.layout.work_off) as *mut SlotDescriptor }
    }

    fn pop_locked(&self, q: Queue) -> Option<u64> {
        debug_assert!(matches!(q, Queue::Free));
        let ring = self.ring_mut(q);
        if ring.len == 0 {
            return None;
        }
        let offset = unsafe { self.free_entries().add(ring.head as usize).read() };
        ring.head = (ring.head + 1) % self.geometry.slot_count as u64;
        ring.len -= 1;
        Some(offset)
    }

    fn push_free_locked(&self, offset: u64) -> Result<()> {
        let ring = self.ring_mut(Queue::Free);
        if ring.len as usize >= self.geometry.slot_count {
            return Err(CamdError::Pool(format!(
                "free-slot queue overflow returning offset {offset}"
            )));
        }
        let idx = (ring.head + ring.len) as usize % self.geometry.slot_count;
        unsafe { self.free_entries().add(idx).write(offset) };
        ring.len += 1;
        Ok(())
    }

    fn drain_locked(&self) -> DrainReport {
        let free = self.ring_mut(Queue::Free);
        let free_len = free.len as usize;
        *free = RingState { head: 0, len: 0 };
        let work = self.ring_mut(Queue::Work);
        let work_len = work.len as usize;
        *work = RingState { head: 0, len: 0 };
        self.header().generation.fetch_add(1, Ordering::AcqRel);
        DrainReport {
            free: free_len,
            work: work_len,
        }
    }

    fn refill_locked(&self) -> Result<()> {
        for offset in self.geometry.offsets() {
            self.push_free_locked(offset)?;
        }
        Ok(())
    }

    /// Wait on `cond`; `false` once `deadline` has passed.
    fn wait_locked(
        &self,
        cond: &IpcCondition,
        g: &mut IpcMutexGuard<'_>,
        deadline: Option<Instant>,
    ) -> io::Result<bool> {
        match deadline {
            None => cond.wait(g, None).map(|_| true),
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                // The caller re-checks its ring before waiting again.
                cond.wait(g, Some(remaining)).map(|_| true)
            }
        }
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        let off = offset as usize;
        if off % self.geometry.slot_size != 0 || off >= self.geometry.region_bytes() {
            return Err(CamdError::Pool(format!("offset {offset} is not a slot boundary")));
        }
        Ok(())
    }

    fn slot_ptr(&self, offset: u64) -> *mut u8 {
        unsafe {
            self.shm
                .as_mut_ptr()
                .add(self.layout.data_off + offset as usize)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Queue {
    Free,
    Work,
}

// ---------------------------------------------------------------------------
// FreeSlot: a slot drawn by the producer
// ---------------------------------------------------------------------------

/// A slot drawn from the free-slot queue. Fill it through [`FreeSlot::data_mut`]
/// and hand it on with [`FreeSlot::submit`]. Dropping it unsubmitted returns
/// the offset to the free-slot queue.
pub struct FreeSlot<'a> {
    pool: &'a FramePool,
    offset: u64,
    generation: u64,
    consumed: bool,
}

impl FreeSlot<'_> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The whole slot, exclusively owned until submitted or dropped.
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.offset), self.pool.slot_size())
        }
    }

    /// Push the filled slot onto the work queue.
    pub fn submit(mut self, length: usize, meta: SequenceMetadata) -> Result<bool> {
        self.consumed = true;
        self.pool.submit(SlotDescriptor {
            offset: self.offset,
            length: length as u64,
            generation: self.generation,
            meta,
        })
    }
}

impl Drop for FreeSlot<'_> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        if let Err(e) = self.pool.release_offset(self.offset, self.generation) {
            tracing::error!(offset = self.offset, "failed to return unused slot: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// SlotLease: a filled slot held by a consumer
// ---------------------------------------------------------------------------

/// A filled slot taken from the work queue. The offset goes back to the
/// free-slot queue exactly once: on [`SlotLease::release`] or on drop.
pub struct SlotLease<'a> {
    pool: &'a FramePool,
    desc: SlotDescriptor,
    released: bool,
}

impl SlotLease<'_> {
    pub fn descriptor(&self) -> &SlotDescriptor {
        &self.desc
    }

    /// The bytes the producer wrote.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.pool.slot_ptr(self.desc.offset), self.desc.length as usize)
        }
    }

    /// Return the slot now, reporting failures to the caller.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.pool.release(&self.desc)
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.release(&self.desc) {
            tracing::error!(offset = self.desc.offset, "failed to release frame slot: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_from_region_floors_slot_count() {
        let g = PoolGeometry::from_region(1000, 300).unwrap();
        assert_eq!(g.slot_count, 3);
        assert_eq!(g.offsets().collect::<Vec<_>>(), vec![0, 300, 600]);
    }

    #[test]
    fn geometry_rejects_region_smaller_than_a_slot() {
        assert!(PoolGeometry::from_region(10, 300).is_err());
        assert!(PoolGeometry::from_region(10, 0).is_err());
    }

    #[test]
    fn frame_header_survives_unaligned_slot() {
        let mut buf = vec![0u8; FRAME_HEADER_LEN + 9];
        let mut hdr = FrameHeader::new();
        hdr.sensor_width = 2;
        hdr.sensor_height = 2;
        hdr.pixel_bytes = 8;
        hdr.write_to(&mut buf[1..]).unwrap();
        let back = FrameHeader::read_from(&buf[1..]).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(back.pixels(&buf[1..]).len(), 8);
    }

    #[test]
    fn frame_header_rejects_garbage_and_truncation() {
        let buf = vec![0u8; FRAME_HEADER_LEN];
        assert!(FrameHeader::read_from(&buf).is_err());

        let mut buf = vec![0u8; FRAME_HEADER_LEN + 4];
        let mut hdr = FrameHeader::new();
        hdr.pixel_bytes = 8;
        hdr.write_to(&mut buf).unwrap();
        assert!(FrameHeader::read_from(&buf).is_err());
    }

    #[test]
    fn layout_keeps_data_aligned() {
        let g = PoolGeometry::new(1000, 7).unwrap();
        let l = layout_of(g);
        assert_eq!(l.data_off % DATA_ALIGN, 0);
        assert!(l.work_off >= l.free_off + 7 * 8);
        assert_eq!(l.total, l.data_off + 7000);
    }
}
