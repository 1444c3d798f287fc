// Log memory split into fixed-size partitions, each with a packed atomic tail and a generation term.
// The length word of a frame is only touched atomically; recycling zeroes bytes before the new term shows.
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{
    FLAGS_OFFSET, FRAME_ALIGNMENT, FRAME_VERSION, FrameHeader, FrameType, HEADER_LENGTH,
    LENGTH_OFFSET, STREAM_ID_OFFSET, TYPE_OFFSET, VERSION_OFFSET,
};

const RECYCLING: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawTail(u64);

impl RawTail {
    pub fn new(term: u32, offset: usize) -> Self {
        Self(((term as u64) << 32) | offset as u64)
    }

    pub fn term(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn offset(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }
}

pub struct Partition {
    index: usize,
    base: NonNull<u8>,
    capacity: usize,
    raw_tail: CachePadded<AtomicU64>,
    term: CachePadded<AtomicU64>,
}

// Safety: the region behind `base` lives as long as the owning `PartitionSet`; concurrent
// access follows the claim/publish protocol (disjoint reservations, release/acquire length words).
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .field("term", &self.term())
            .field("tail", &self.raw_tail())
            .finish()
    }
}

impl Partition {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Highest offset a message frame may end at.
    pub fn trip_point(&self) -> usize {
        self.capacity - HEADER_LENGTH
    }

    /// Generation currently held, `None` while the partition is being recycled.
    pub fn term(&self) -> Option<u32> {
        match self.term.load(Ordering::Acquire) {
            RECYCLING => None,
            term => Some(term as u32),
        }
    }

    pub fn raw_tail(&self) -> RawTail {
        RawTail(self.raw_tail.load(Ordering::Acquire))
    }

    /// The one atomic step of a claim: reserve `len` bytes at the current tail.
    pub(crate) fn get_and_add_tail(&self, len: usize) -> RawTail {
        RawTail(self.raw_tail.fetch_add(len as u64, Ordering::AcqRel))
    }

    pub fn load_length(&self, offset: usize) -> i32 {
        self.length_word(offset).load(Ordering::Acquire)
    }

    pub(crate) fn put_length_relaxed(&self, offset: usize, length: i32) {
        self.length_word(offset).store(length, Ordering::Relaxed);
    }

    /// Publication boundary: every prior write to the frame happens-before a reader
    /// that observes this length.
    pub(crate) fn publish_length(&self, offset: usize, length: i32) {
        self.length_word(offset).store(length, Ordering::Release);
    }

    /// Writes every header field except the length word.
    ///
    /// Only valid on a range the caller reserved and has not yet published.
    pub(crate) fn write_header_fields(&self, offset: usize, frame_type: FrameType, flags: u8, stream_id: i32) {
        self.check_header(offset);
        unsafe {
            let at = self.base.as_ptr().add(offset);
            at.add(VERSION_OFFSET).write(FRAME_VERSION);
            at.add(FLAGS_OFFSET).write(flags);
            write_bytes(at.add(TYPE_OFFSET), &(frame_type as u16).to_le_bytes());
            write_bytes(at.add(STREAM_ID_OFFSET), &stream_id.to_le_bytes());
        }
    }

    pub(crate) fn set_frame_type(&self, offset: usize, frame_type: FrameType) {
        self.check_header(offset);
        unsafe {
            write_bytes(
                self.base.as_ptr().add(offset + TYPE_OFFSET),
                &(frame_type as u16).to_le_bytes(),
            );
        }
    }

    pub fn flags(&self, offset: usize) -> u8 {
        self.check_header(offset);
        unsafe { self.base.as_ptr().add(offset + FLAGS_OFFSET).read() }
    }

    pub(crate) fn set_flags(&self, offset: usize, flags: u8) {
        self.check_header(offset);
        unsafe { self.base.as_ptr().add(offset + FLAGS_OFFSET).write(flags) }
    }

    /// Decodes the header at `offset`, reading the length word atomically first.
    ///
    /// Callers only decode frames they reserved or frames whose length they
    /// already observed as published.
    pub fn read_header(&self, offset: usize) -> Result<FrameHeader, Error> {
        let length = self.load_length(offset);
        let mut buf = [0u8; HEADER_LENGTH];
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset + VERSION_OFFSET),
                buf.as_mut_ptr().add(VERSION_OFFSET),
                HEADER_LENGTH - VERSION_OFFSET,
            );
        }
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 4].copy_from_slice(&length.to_le_bytes());
        FrameHeader::decode(&buf).map_err(|err| err.with_offset(offset))
    }

    /// Shared view over committed bytes.
    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset + len <= self.capacity,
            "slice out of bounds: offset={offset} len={len} capacity={}",
            self.capacity
        );
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Exclusive view over a reserved, unpublished range.
    ///
    /// # Safety
    /// The caller must own `[offset, offset + len)` through a claim and no other
    /// reference to that range may exist for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset + len <= self.capacity,
            "slice_mut out of bounds: offset={offset} len={len} capacity={}",
            self.capacity
        );
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }

    /// Claims the right to recycle this partition out of generation `previous`.
    pub(crate) fn begin_recycle(&self, previous: u32) -> bool {
        self.term
            .compare_exchange(previous as u64, RECYCLING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resets the partition for `term`. Must follow a successful `begin_recycle`.
    pub(crate) fn recycle(&self, term: u32) {
        debug_assert_eq!(self.term.load(Ordering::Acquire), RECYCLING);
        unsafe {
            ptr::write_bytes(self.base.as_ptr(), 0, self.capacity);
        }
        self.raw_tail
            .store(RawTail::new(term, 0).0, Ordering::Release);
        self.term.store(term as u64, Ordering::Release);
    }

    fn length_word(&self, offset: usize) -> &AtomicI32 {
        self.check_header(offset);
        unsafe { &*(self.base.as_ptr().add(offset + LENGTH_OFFSET) as *const AtomicI32) }
    }

    fn check_header(&self, offset: usize) {
        debug_assert_eq!(offset % FRAME_ALIGNMENT, 0, "unaligned frame offset {offset}");
        assert!(
            offset + HEADER_LENGTH <= self.capacity,
            "header out of bounds: offset={offset} capacity={}",
            self.capacity
        );
    }
}

unsafe fn write_bytes(dst: *mut u8, bytes: &[u8]) {
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) }
}

/// Partitions plus the mapping that backs them; dropping the set unmaps the memory.
#[derive(Debug)]
pub struct PartitionSet {
    partitions: Vec<Partition>,
    _memory: MmapMut,
}

impl Deref for PartitionSet {
    type Target = [Partition];

    fn deref(&self) -> &Self::Target {
        &self.partitions
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PartitionBuilder {
    partition_size: usize,
    partition_count: usize,
}

impl PartitionBuilder {
    pub fn new(partition_size: usize, partition_count: usize) -> Self {
        Self {
            partition_size,
            partition_count,
        }
    }

    /// Maps one zeroed anonymous region and slices it into equal partitions.
    /// Partition `i` starts out holding term `i`.
    pub fn allocate(self) -> Result<PartitionSet, Error> {
        if self.partition_count == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("partition count must be positive"));
        }
        if self.partition_size < 2 * HEADER_LENGTH
            || self.partition_size % FRAME_ALIGNMENT != 0
            || self.partition_size > i32::MAX as usize
        {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "invalid partition size {} (multiple of {FRAME_ALIGNMENT}, at least {}, at most {})",
                self.partition_size,
                2 * HEADER_LENGTH,
                i32::MAX
            )));
        }
        let total = self
            .partition_size
            .checked_mul(self.partition_count)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("buffer size overflow"))?;

        let mut memory = MmapMut::map_anon(total).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to map log memory")
                .with_source(err)
        })?;
        let base = memory.as_mut_ptr();

        let partitions = (0..self.partition_count)
            .map(|index| {
                let start = unsafe { base.add(index * self.partition_size) };
                let base = NonNull::new(start).ok_or_else(|| {
                    Error::new(ErrorKind::Internal).with_message("log memory mapped at null")
                })?;
                Ok(Partition {
                    index,
                    base,
                    capacity: self.partition_size,
                    raw_tail: CachePadded::new(AtomicU64::new(RawTail::new(index as u32, 0).0)),
                    term: CachePadded::new(AtomicU64::new(index as u64)),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(PartitionSet {
            partitions,
            _memory: memory,
        })
    }
}
