//! Purpose: Reserve space for frames in a partition with a single atomic step.
//! Exports: `claim`, `claim_batch`, `claim_batch_exact`, `AppendOutcome`.
//! Role: Stateless claim algorithm used by `LogBuffer`; wraps claim cursors on success.
//! Invariants: Exactly one fetch-and-add on the partition tail per attempted reservation.
//! Invariants: Message frames never end past the trip point; the claim crossing it pads to the end.
use crate::core::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::core::frame::{self, FrameType, HEADER_LENGTH};
use crate::core::partition::{Partition, RawTail};
use crate::core::position::Position;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    /// Reservation succeeded; the position is just past the reserved frame(s).
    Claimed(Position),
    /// The partition was already past its trip point; nothing was written.
    PartitionFull,
    /// This claim crossed the trip point and padded the partition to its end.
    EndOfPartition { term: u32 },
}

pub fn claim<'a>(
    partition: &'a Partition,
    claim: &mut ClaimedFragment<'a>,
    length: usize,
    stream_id: i32,
) -> AppendOutcome {
    let framed_length = frame::framed_length(length);
    let frame_length = frame::aligned_length(framed_length);

    let reserved = match reserve(partition, frame_length) {
        Ok(reserved) => reserved,
        Err(outcome) => return outcome,
    };
    let frame_offset = reserved.offset();
    let new_tail = frame_offset + frame_length;

    partition.put_length_relaxed(frame_offset, -(framed_length as i32));
    partition.write_header_fields(frame_offset, FrameType::Message, 0, stream_id);

    let position = Position::new(reserved.term(), new_tail as u32);
    claim.wrap(partition, frame_offset, framed_length, position);
    AppendOutcome::Claimed(position)
}

/// Reserves room for `fragment_count` fragments totalling `total_length` payload
/// bytes, however the caller later splits them.
pub fn claim_batch<'a>(
    partition: &'a Partition,
    batch: &mut ClaimedFragmentBatch<'a>,
    fragment_count: usize,
    total_length: usize,
) -> AppendOutcome {
    reserve_batch(partition, batch, frame::batch_length(fragment_count, total_length))
}

/// Reserves exactly `Σ align(H + len)` for fragments of the given lengths.
pub fn claim_batch_exact<'a>(
    partition: &'a Partition,
    batch: &mut ClaimedFragmentBatch<'a>,
    lengths: &[usize],
) -> AppendOutcome {
    reserve_batch(partition, batch, frame::exact_batch_length(lengths))
}

fn reserve_batch<'a>(
    partition: &'a Partition,
    batch: &mut ClaimedFragmentBatch<'a>,
    batch_length: usize,
) -> AppendOutcome {
    let reserved = match reserve(partition, batch_length) {
        Ok(reserved) => reserved,
        Err(outcome) => return outcome,
    };
    let batch_offset = reserved.offset();

    // In-progress marker until the first fragment header replaces it.
    partition.put_length_relaxed(batch_offset, -(batch_length as i32));

    let position = Position::new(reserved.term(), (batch_offset + batch_length) as u32);
    batch.wrap(partition, batch_offset, batch_length, reserved.term());
    AppendOutcome::Claimed(position)
}

/// Moves the tail by `frame_length` and classifies the result; `Ok` carries the
/// reservation start when the whole frame fits before the trip point.
fn reserve(partition: &Partition, frame_length: usize) -> Result<RawTail, AppendOutcome> {
    // Skip the atomic add once the partition is spent so a backlog of failing
    // claims cannot push the offset into the term bits of the packed tail.
    if partition.raw_tail().offset() > partition.trip_point() {
        return Err(AppendOutcome::PartitionFull);
    }

    let reserved = partition.get_and_add_tail(frame_length);
    let new_tail = reserved.offset() + frame_length;
    if new_tail <= partition.trip_point() {
        Ok(reserved)
    } else {
        Err(on_end_of_partition(partition, reserved))
    }
}

fn on_end_of_partition(partition: &Partition, reserved: RawTail) -> AppendOutcome {
    let offset = reserved.offset();
    let Some(pad_length) = partition.capacity().checked_sub(offset) else {
        return AppendOutcome::PartitionFull;
    };
    if pad_length < HEADER_LENGTH {
        return AppendOutcome::PartitionFull;
    }

    // This claim tripped the end of the partition; fill the rest with padding.
    partition.put_length_relaxed(offset, -(pad_length as i32));
    partition.write_header_fields(offset, FrameType::Padding, 0, 0);
    partition.publish_length(offset, pad_length as i32);

    AppendOutcome::EndOfPartition {
        term: reserved.term(),
    }
}
