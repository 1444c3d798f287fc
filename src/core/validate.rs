// Partition scans used by rotation plus debug-only generation assertions.
// Rotation runs the drain scan once per activation; full validation is opt-in.
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FrameType, HEADER_LENGTH};
use crate::core::partition::Partition;

/// Outcome of walking a partition's published frames from offset 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GenerationScan {
    /// Published frames tile the partition exactly.
    Drained,
    /// The frame at `offset` is unwritten or still in progress.
    Pending { offset: usize },
    /// The length at `offset` cannot start a frame.
    Corrupt { offset: usize },
}

/// Counts gathered by `validate_partition`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PartitionReport {
    pub messages: usize,
    pub padding: usize,
    pub failed: usize,
    pub batches: usize,
    /// Offset of the first unpublished frame, or the capacity when drained.
    pub committed_end: usize,
}

pub fn scan_generation(partition: &Partition) -> GenerationScan {
    let capacity = partition.capacity();
    let mut offset = 0;
    while offset < capacity {
        let length = partition.load_length(offset);
        if length <= 0 {
            return GenerationScan::Pending { offset };
        }
        let frame_len = frame::aligned_length(length as usize);
        if (length as usize) < HEADER_LENGTH || offset + frame_len > capacity {
            return GenerationScan::Corrupt { offset };
        }
        offset += frame_len;
    }
    GenerationScan::Drained
}

/// Decodes every published header and checks batch flags pair up.
pub fn validate_partition(partition: &Partition) -> Result<PartitionReport, Error> {
    let capacity = partition.capacity();
    let mut report = PartitionReport::default();
    let mut open_batch: Option<usize> = None;
    let mut offset = 0;

    while offset < capacity {
        if partition.load_length(offset) <= 0 {
            break;
        }
        let header = partition.read_header(offset)?;
        header
            .validate(capacity)
            .map_err(|err| err.with_offset(offset))?;
        if offset + header.frame_len() > capacity {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("frame exceeds partition")
                .with_offset(offset));
        }

        match header.frame_type {
            FrameType::Padding => {
                if open_batch.is_some() {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message("padding inside batch")
                        .with_offset(offset));
                }
                report.padding += 1;
            }
            FrameType::Message => {
                report.messages += 1;
                if frame::is_failed(header.flags) {
                    report.failed += 1;
                }
                if frame::is_batch_begin(header.flags) {
                    if open_batch.is_some() {
                        return Err(Error::new(ErrorKind::Corrupt)
                            .with_message("nested batch begin")
                            .with_offset(offset));
                    }
                    open_batch = Some(offset);
                }
                if frame::is_batch_end(header.flags) {
                    if open_batch.take().is_none() {
                        return Err(Error::new(ErrorKind::Corrupt)
                            .with_message("batch end without begin")
                            .with_offset(offset));
                    }
                    report.batches += 1;
                }
            }
        }
        offset += header.frame_len();
    }

    if let Some(start) = open_batch {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("unterminated batch")
            .with_offset(start));
    }
    report.committed_end = offset;
    Ok(report)
}

/// Panics in debug builds unless the partition's generation tiles it with
/// published, well-formed frames. Runs just before a partition is recycled.
pub fn debug_assert_generation(partition: &Partition) {
    if !cfg!(debug_assertions) {
        return;
    }
    let result = validate_partition(partition).and_then(|report| {
        if report.committed_end == partition.capacity() {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Corrupt)
                .with_message("generation not fully committed")
                .with_offset(report.committed_end))
        }
    });
    if let Err(err) = result {
        panic!(
            "partition {} generation {:?} invariant failed: {err}",
            partition.index(),
            partition.term()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationScan, debug_assert_generation, scan_generation, validate_partition};
    use crate::core::appender::{self, AppendOutcome};
    use crate::core::claim::{ClaimedFragment, ClaimedFragmentBatch};
    use crate::core::error::ErrorKind;
    use crate::core::frame::{FLAG_BATCH_BEGIN, FrameType};
    use crate::core::partition::{Partition, PartitionBuilder};

    fn fill(partition: &Partition) {
        let mut fragment = ClaimedFragment::new();
        loop {
            match appender::claim(partition, &mut fragment, 40, 1) {
                AppendOutcome::Claimed(_) => fragment.commit(),
                AppendOutcome::EndOfPartition { .. } => return,
                AppendOutcome::PartitionFull => panic!("partition full before end"),
            }
        }
    }

    #[test]
    fn empty_partition_is_pending_at_zero() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        assert_eq!(scan_generation(&set[0]), GenerationScan::Pending { offset: 0 });
    }

    #[test]
    fn filled_partition_is_drained() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        fill(&set[0]);
        assert_eq!(scan_generation(&set[0]), GenerationScan::Drained);

        let report = validate_partition(&set[0]).expect("valid");
        assert_eq!(report.messages, 1008 / 64);
        assert_eq!(report.padding, 1);
        assert_eq!(report.committed_end, 1024);
    }

    #[test]
    fn in_flight_claim_blocks_drain() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut held = ClaimedFragment::new();
        appender::claim(partition, &mut held, 16, 1);
        fill(partition);
        assert_eq!(scan_generation(partition), GenerationScan::Pending { offset: 0 });

        held.commit();
        assert_eq!(scan_generation(partition), GenerationScan::Drained);
    }

    #[test]
    fn corrupt_length_is_reported() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        partition.publish_length(0, 4);
        assert_eq!(scan_generation(partition), GenerationScan::Corrupt { offset: 0 });
    }

    #[test]
    fn batch_flags_must_pair() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        appender::claim_batch(partition, &mut batch, 2, 32);
        batch.next_fragment(16, 1).expect("first");
        batch.next_fragment(16, 1).expect("second");
        batch.commit();
        let report = validate_partition(partition).expect("valid");
        assert_eq!(report.batches, 1);
        assert_eq!(report.messages, 2);

        let mut fragment = ClaimedFragment::new();
        appender::claim(partition, &mut fragment, 16, 1);
        let offset = fragment.offset() - 16;
        fragment.commit();
        partition.set_flags(offset, FLAG_BATCH_BEGIN);
        let err = validate_partition(partition).expect_err("unterminated");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(partition.read_header(offset).expect("header").frame_type, FrameType::Message);
    }

    #[test]
    fn generation_assertion_checks_tiling() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        fill(&set[0]);
        debug_assert_generation(&set[0]);

        if !cfg!(debug_assertions) {
            return;
        }
        let partition = &set[1];
        let mut fragment = ClaimedFragment::new();
        appender::claim(partition, &mut fragment, 16, 1);
        fragment.commit();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            debug_assert_generation(partition);
        }));
        assert!(result.is_err());
    }
}
