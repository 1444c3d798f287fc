// Rotating log over the partitions plus the subscriber slot table shared by every handle.
// A partition is recycled only once every open slot and every claim has left its prior generation.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::core::appender::{self, AppendOutcome};
use crate::core::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::core::error::{Error, ErrorKind};
use crate::core::options::{DispatcherOptions, LogLayout};
use crate::core::partition::{Partition, PartitionBuilder, PartitionSet};
use crate::core::position::Position;
use crate::core::validate::{self, GenerationScan};

const SLOT_FREE: u64 = u64::MAX;
const SLOT_RESERVED: u64 = 0;

/// Result of one claim attempt; only `Claimed` hands out space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimResult {
    /// Space reserved; the position is just past the reserved frame(s).
    Claimed(Position),
    /// The active partition cannot take the claim yet; retry later.
    PartitionFull,
    /// This claim filled the active partition; retry goes to the next one.
    EndOfPartition,
    /// The log was closed; nothing was reserved.
    Closed,
}

impl ClaimResult {
    pub fn position(self) -> Option<Position> {
        match self {
            ClaimResult::Claimed(position) => Some(position),
            _ => None,
        }
    }

    pub fn is_claimed(self) -> bool {
        matches!(self, ClaimResult::Claimed(_))
    }
}

pub struct LogBuffer {
    name: String,
    layout: LogLayout,
    partitions: PartitionSet,
    active_term: CachePadded<AtomicU64>,
    slots: Box<[CachePadded<AtomicU64>]>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("active_term", &self.active_term())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LogBuffer {
    pub fn new(options: &DispatcherOptions) -> Result<Self, Error> {
        let layout = options.layout()?;
        let partitions = PartitionBuilder::new(layout.partition_size, layout.partition_count)
            .allocate()
            .map_err(|err| err.with_name(options.name.clone()))?;
        let slots = (0..options.max_subscriptions)
            .map(|_| CachePadded::new(AtomicU64::new(SLOT_FREE)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::info!(
            name = %options.name,
            partitions = layout.partition_count,
            partition_size = layout.partition_size,
            max_fragment_length = layout.max_fragment_length,
            max_subscriptions = options.max_subscriptions,
            "log buffer created"
        );

        Ok(Self {
            name: options.name.clone(),
            layout,
            partitions,
            active_term: CachePadded::new(AtomicU64::new(0)),
            slots,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> LogLayout {
        self.layout
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition_for(&self, term: u32) -> &Partition {
        &self.partitions[term as usize % self.partitions.len()]
    }

    pub fn active_term(&self) -> u32 {
        self.active_term.load(Ordering::Acquire) as u32
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flips the log to closed; returns whether this call did it.
    pub fn close(&self) -> bool {
        let closed = !self.closed.swap(true, Ordering::AcqRel);
        if closed {
            tracing::info!(name = %self.name, active_term = self.active_term(), "log buffer closed");
        }
        closed
    }

    pub fn claim<'a>(&'a self, fragment: &mut ClaimedFragment<'a>, length: usize, stream_id: i32) -> ClaimResult {
        let Some(partition) = self.writable_partition() else {
            return self.unwritable();
        };
        let outcome = appender::claim(partition, fragment, length, stream_id);
        self.on_outcome(outcome)
    }

    pub fn claim_batch<'a>(
        &'a self,
        batch: &mut ClaimedFragmentBatch<'a>,
        fragment_count: usize,
        total_length: usize,
    ) -> ClaimResult {
        let Some(partition) = self.writable_partition() else {
            return self.unwritable();
        };
        let outcome = appender::claim_batch(partition, batch, fragment_count, total_length);
        self.on_outcome(outcome)
    }

    pub fn claim_batch_exact<'a>(&'a self, batch: &mut ClaimedFragmentBatch<'a>, lengths: &[usize]) -> ClaimResult {
        let Some(partition) = self.writable_partition() else {
            return self.unwritable();
        };
        let outcome = appender::claim_batch_exact(partition, batch, lengths);
        self.on_outcome(outcome)
    }

    fn writable_partition(&self) -> Option<&Partition> {
        if self.is_closed() {
            return None;
        }
        let term = self.active_term();
        let partition = self.partition_for(term);
        if partition.term() == Some(term) || self.try_activate(term) {
            Some(partition)
        } else {
            None
        }
    }

    fn unwritable(&self) -> ClaimResult {
        if self.is_closed() {
            ClaimResult::Closed
        } else {
            ClaimResult::PartitionFull
        }
    }

    fn on_outcome(&self, outcome: AppendOutcome) -> ClaimResult {
        match outcome {
            AppendOutcome::Claimed(position) => ClaimResult::Claimed(position),
            AppendOutcome::PartitionFull => ClaimResult::PartitionFull,
            AppendOutcome::EndOfPartition { term } => {
                self.on_partition_filled(term);
                ClaimResult::EndOfPartition
            }
        }
    }

    /// Called by the one claimer that padded out `term`.
    fn on_partition_filled(&self, term: u32) {
        let next = term.wrapping_add(1);
        if self
            .active_term
            .compare_exchange(term as u64, next as u64, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.try_activate(next);
        }
    }

    /// Makes the partition for `term` writable, recycling its previous generation.
    /// Returns false while readers or writers still hold the previous generation.
    pub(crate) fn try_activate(&self, term: u32) -> bool {
        let partition = self.partition_for(term);
        let count = self.partitions.len() as u32;
        let Some(current) = partition.term() else {
            return false;
        };
        if current == term {
            return true;
        }
        let Some(previous) = term.checked_sub(count) else {
            return false;
        };
        if current != previous {
            return false;
        }

        let required = Position::new(previous.wrapping_add(1), 0);
        if self.min_subscriber_position().is_some_and(|min| min < required) {
            return false;
        }
        match validate::scan_generation(partition) {
            GenerationScan::Drained => {}
            GenerationScan::Pending { .. } => return false,
            GenerationScan::Corrupt { offset } => {
                tracing::error!(
                    name = %self.name,
                    partition = partition.index(),
                    term = previous,
                    offset,
                    "corrupt frame blocks partition recycling"
                );
                return false;
            }
        }
        if !partition.begin_recycle(previous) {
            return partition.term() == Some(term);
        }

        validate::debug_assert_generation(partition);
        partition.recycle(term);
        tracing::debug!(
            name = %self.name,
            partition = partition.index(),
            term,
            generation = term / count,
            "partition recycled"
        );
        true
    }

    /// Where a subscription opened now starts reading.
    pub fn publisher_position(&self) -> Position {
        let term = self.active_term();
        let partition = self.partition_for(term);
        if partition.term() != Some(term) {
            return Position::new(term, 0);
        }
        let tail = partition.raw_tail();
        if tail.term() != term {
            return Position::new(term, 0);
        }
        if tail.offset() > partition.trip_point() {
            Position::new(term, 0).next_term()
        } else {
            Position::new(term, tail.offset() as u32)
        }
    }

    pub(crate) fn open_slot(&self) -> Result<(usize, Position), Error> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(SLOT_FREE, SLOT_RESERVED, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let start = self.publisher_position();
                slot.store(start.as_raw(), Ordering::SeqCst);
                return Ok((index, start));
            }
        }
        Err(Error::new(ErrorKind::Busy)
            .with_message(format!("all {} subscription slots in use", self.slots.len()))
            .with_name(self.name.clone()))
    }

    pub(crate) fn update_slot(&self, index: usize, position: Position) {
        self.slots[index].store(position.as_raw(), Ordering::Release);
    }

    pub(crate) fn release_slot(&self, index: usize) {
        self.slots[index].store(SLOT_FREE, Ordering::Release);
    }

    /// Lowest position over open slots; `None` when nobody is subscribed.
    pub fn min_subscriber_position(&self) -> Option<Position> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|raw| *raw != SLOT_FREE)
            .min()
            .map(Position::from_raw)
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != SLOT_FREE)
            .count()
    }
}
