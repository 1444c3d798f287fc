// Claim cursors that own a reserved range until commit or abort publishes it.
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FLAG_BATCH_BEGIN, FLAG_BATCH_END, FLAG_FAILED, FrameType, HEADER_LENGTH};
use crate::core::partition::Partition;
use crate::core::position::Position;

#[derive(Clone, Copy, Debug)]
struct FrameSpan<'a> {
    partition: &'a Partition,
    offset: usize,
    framed_length: usize,
    position: Position,
}

/// Scratch cursor over one claimed message frame.
///
/// Reusable across claims; an unresolved claim is aborted when the value is dropped.
#[derive(Debug, Default)]
pub struct ClaimedFragment<'a> {
    frame: Option<FrameSpan<'a>>,
}

impl<'a> ClaimedFragment<'a> {
    pub fn new() -> Self {
        Self { frame: None }
    }

    pub fn is_claimed(&self) -> bool {
        self.frame.is_some()
    }

    pub(crate) fn wrap(
        &mut self,
        partition: &'a Partition,
        offset: usize,
        framed_length: usize,
        position: Position,
    ) {
        debug_assert!(self.frame.is_none(), "claimed fragment wrapped twice");
        self.frame = Some(FrameSpan {
            partition,
            offset,
            framed_length,
            position,
        });
    }

    /// Position just past the claimed frame.
    pub fn position(&self) -> Option<Position> {
        self.frame.map(|frame| frame.position)
    }

    /// Offset of the payload within its partition.
    pub fn offset(&self) -> usize {
        self.frame
            .map_or(0, |frame| frame.offset + HEADER_LENGTH)
    }

    pub fn length(&self) -> usize {
        self.frame
            .map_or(0, |frame| frame.framed_length - HEADER_LENGTH)
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match self.frame {
            // Safety: the appender handed this range to us alone and it stays
            // unpublished until `commit`/`abort` consumes the span.
            Some(frame) => unsafe {
                frame
                    .partition
                    .slice_mut(frame.offset + HEADER_LENGTH, frame.framed_length - HEADER_LENGTH)
            },
            None => &mut [],
        }
    }

    /// Flags the frame so consumers see `is_marked_failed`.
    pub fn mark_failed(&mut self) {
        if let Some(frame) = self.frame {
            let flags = frame.partition.flags(frame.offset);
            frame.partition.set_flags(frame.offset, flags | FLAG_FAILED);
        }
    }

    pub fn commit(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame
                .partition
                .publish_length(frame.offset, frame.framed_length as i32);
        }
    }

    pub fn abort(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.partition.set_frame_type(frame.offset, FrameType::Padding);
            frame
                .partition
                .publish_length(frame.offset, frame.framed_length as i32);
        }
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame {
            tracing::warn!(
                partition = frame.partition.index(),
                offset = frame.offset,
                "claimed fragment dropped without commit; aborting"
            );
            self.abort();
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BatchSpan<'a> {
    partition: &'a Partition,
    offset: usize,
    length: usize,
    term: u32,
    next_offset: usize,
    fragment_count: usize,
    last_fragment_offset: usize,
}

/// Scratch cursor over one reserved batch; fragments are carved in call order.
#[derive(Debug, Default)]
pub struct ClaimedFragmentBatch<'a> {
    span: Option<BatchSpan<'a>>,
}

/// One fragment carved out of a batch reservation.
#[derive(Debug)]
pub struct BatchFragment<'b> {
    offset: usize,
    position: Position,
    buffer: &'b mut [u8],
}

impl BatchFragment<'_> {
    /// Offset of the payload within its partition.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Position just past this fragment.
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut *self.buffer
    }
}

impl<'a> ClaimedFragmentBatch<'a> {
    pub fn new() -> Self {
        Self { span: None }
    }

    pub fn is_claimed(&self) -> bool {
        self.span.is_some()
    }

    pub(crate) fn wrap(&mut self, partition: &'a Partition, offset: usize, length: usize, term: u32) {
        debug_assert!(self.span.is_none(), "claimed batch wrapped twice");
        self.span = Some(BatchSpan {
            partition,
            offset,
            length,
            term,
            next_offset: 0,
            fragment_count: 0,
            last_fragment_offset: offset,
        });
    }

    /// Reserved bytes not yet carved into fragments.
    pub fn remaining(&self) -> usize {
        self.span
            .map_or(0, |span| span.length - span.next_offset)
    }

    pub fn fragment_count(&self) -> usize {
        self.span.map_or(0, |span| span.fragment_count)
    }

    /// Position just past the whole reservation.
    pub fn position(&self) -> Option<Position> {
        self.span
            .map(|span| Position::new(span.term, (span.offset + span.length) as u32))
    }

    pub fn next_fragment(&mut self, length: usize, stream_id: i32) -> Result<BatchFragment<'_>, Error> {
        let span = self
            .span
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("no batch claimed"))?;

        let framed_length = frame::framed_length(length);
        let frame_length = frame::aligned_length(framed_length);
        let remaining = span.length - span.next_offset;
        if frame_length > remaining {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message(format!(
                    "batch fragment of {length} bytes needs {frame_length}, {remaining} reserved bytes remain"
                ))
                .with_offset(span.offset + span.next_offset));
        }

        let offset = span.offset + span.next_offset;
        span.partition
            .put_length_relaxed(offset, -(framed_length as i32));
        span.partition
            .write_header_fields(offset, FrameType::Message, 0, stream_id);
        span.next_offset += frame_length;
        span.fragment_count += 1;
        span.last_fragment_offset = offset;

        let position = Position::new(span.term, (offset + frame_length) as u32);
        // Safety: the range lies inside this batch's reservation, was carved
        // exactly once, and stays unpublished until commit/abort.
        let buffer = unsafe { span.partition.slice_mut(offset + HEADER_LENGTH, length) };
        Ok(BatchFragment {
            offset: offset + HEADER_LENGTH,
            position,
            buffer,
        })
    }

    pub fn commit(&mut self) {
        let Some(span) = self.span.take() else {
            return;
        };
        let partition = span.partition;
        if span.fragment_count > 0 {
            let first = partition.flags(span.offset);
            partition.set_flags(span.offset, first | FLAG_BATCH_BEGIN);
            let last = partition.flags(span.last_fragment_offset);
            partition.set_flags(span.last_fragment_offset, last | FLAG_BATCH_END);
        }
        pad_remainder(&span);
        publish(&span);
    }

    pub fn abort(&mut self) {
        let Some(span) = self.span.take() else {
            return;
        };
        let partition = span.partition;
        let mut offset = span.offset;
        for _ in 0..span.fragment_count {
            let framed_length = partition.load_length(offset).unsigned_abs() as usize;
            partition.set_frame_type(offset, FrameType::Padding);
            partition.set_flags(offset, 0);
            offset += frame::aligned_length(framed_length);
        }
        pad_remainder(&span);
        publish(&span);
    }
}

impl Drop for ClaimedFragmentBatch<'_> {
    fn drop(&mut self) {
        if let Some(span) = self.span {
            tracing::warn!(
                partition = span.partition.index(),
                offset = span.offset,
                fragments = span.fragment_count,
                "claimed batch dropped without commit; aborting"
            );
            self.abort();
        }
    }
}

fn pad_remainder(span: &BatchSpan<'_>) {
    let rest = span.length - span.next_offset;
    if rest == 0 {
        return;
    }
    let offset = span.offset + span.next_offset;
    span.partition.put_length_relaxed(offset, -(rest as i32));
    span.partition
        .write_header_fields(offset, FrameType::Padding, 0, 0);
}

// Flip every frame of the reservation to its positive length, the first one last.
fn publish(span: &BatchSpan<'_>) {
    let partition = span.partition;
    let end = span.offset + span.length;
    let mut first = None;
    let mut offset = span.offset;
    while offset < end {
        let framed_length = partition.load_length(offset).unsigned_abs() as usize;
        if offset == span.offset {
            first = Some(framed_length);
        } else {
            partition.publish_length(offset, framed_length as i32);
        }
        offset += frame::aligned_length(framed_length);
    }
    debug_assert_eq!(offset, end, "batch frames do not tile the reservation");
    if let Some(framed_length) = first {
        partition.publish_length(span.offset, framed_length as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::{ClaimedFragment, ClaimedFragmentBatch};
    use crate::core::appender::{self, AppendOutcome};
    use crate::core::error::ErrorKind;
    use crate::core::frame::{FLAG_BATCH_BEGIN, FLAG_BATCH_END, FrameType, HEADER_LENGTH};
    use crate::core::partition::PartitionBuilder;
    use crate::core::position::Position;

    #[test]
    fn abort_turns_frame_into_padding() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut fragment = ClaimedFragment::new();
        appender::claim(partition, &mut fragment, 20, 4);
        fragment.buffer_mut().fill(1);
        fragment.abort();

        let header = partition.read_header(0).expect("header");
        assert!(header.is_committed());
        assert_eq!(header.frame_type, FrameType::Padding);
        assert_eq!(header.frame_len(), 48);
        assert!(!fragment.is_claimed());
    }

    #[test]
    fn dropping_unresolved_claim_aborts_it() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        {
            let mut fragment = ClaimedFragment::new();
            appender::claim(partition, &mut fragment, 16, 4);
        }
        let header = partition.read_header(0).expect("header");
        assert_eq!(header.length, 32);
        assert_eq!(header.frame_type, FrameType::Padding);
    }

    #[test]
    fn mark_failed_sets_flag_before_publication() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut fragment = ClaimedFragment::new();
        appender::claim(partition, &mut fragment, 16, 4);
        fragment.mark_failed();
        fragment.commit();
        let header = partition.read_header(0).expect("header");
        assert!(crate::core::frame::is_failed(header.flags));
    }

    #[test]
    fn batch_fragments_are_carved_in_order() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        assert_eq!(
            appender::claim_batch_exact(partition, &mut batch, &[16, 16, 16]),
            AppendOutcome::Claimed(Position::new(0, 96))
        );

        let mut offsets = Vec::new();
        for index in 0..3u8 {
            let mut fragment = batch.next_fragment(16, 9).expect("fragment");
            fragment.buffer_mut().fill(index);
            offsets.push(fragment.offset());
        }
        assert_eq!(offsets, vec![HEADER_LENGTH, 32 + HEADER_LENGTH, 64 + HEADER_LENGTH]);
        assert_eq!(batch.fragment_count(), 3);
        assert_eq!(batch.remaining(), 0);
        // Nothing is visible before commit.
        assert!(partition.load_length(0) < 0);

        batch.commit();
        let first = partition.read_header(0).expect("first");
        let middle = partition.read_header(32).expect("middle");
        let last = partition.read_header(64).expect("last");
        assert_eq!(first.flags, FLAG_BATCH_BEGIN);
        assert_eq!(middle.flags, 0);
        assert_eq!(last.flags, FLAG_BATCH_END);
        assert_eq!(first.length, 32);
        assert_eq!(partition.load_length(96), 0);
    }

    #[test]
    fn unused_batch_space_becomes_one_padding_frame() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        appender::claim_batch_exact(partition, &mut batch, &[16, 16, 16]);
        batch.next_fragment(16, 9).expect("first");
        batch.next_fragment(8, 9).expect("second");
        assert_eq!(batch.remaining(), 32);
        batch.commit();

        let only = partition.read_header(32).expect("second");
        assert_eq!(only.flags, FLAG_BATCH_END);
        let padding = partition.read_header(64).expect("padding");
        assert_eq!(padding.frame_type, FrameType::Padding);
        assert_eq!(padding.length, 32);
    }

    #[test]
    fn single_fragment_batch_carries_both_flags() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        appender::claim_batch(partition, &mut batch, 1, 20);
        batch.next_fragment(20, 2).expect("fragment");
        batch.commit();
        let header = partition.read_header(0).expect("header");
        assert_eq!(header.flags, FLAG_BATCH_BEGIN | FLAG_BATCH_END);
        assert_eq!(header.length, 36);
    }

    #[test]
    fn oversized_batch_fragment_is_rejected() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        appender::claim_batch_exact(partition, &mut batch, &[32, 0]);
        assert_eq!(batch.remaining(), 64);

        batch.next_fragment(32, 1).expect("first fits");
        assert_eq!(batch.remaining(), 16);
        let err = batch.next_fragment(1, 1).expect_err("no room");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        batch.next_fragment(0, 1).expect("empty fragment fits exactly");
        assert_eq!(batch.remaining(), 0);
        let err = batch.next_fragment(0, 1).expect_err("not even a header left");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        batch.commit();

        let header = partition.read_header(0).expect("first");
        assert_eq!(header.flags, FLAG_BATCH_BEGIN);
        let tail = partition.read_header(48).expect("second");
        assert_eq!(tail.flags, FLAG_BATCH_END);
        assert_eq!(tail.length, HEADER_LENGTH as i32);
    }

    #[test]
    fn batch_abort_pads_every_fragment() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        appender::claim_batch(partition, &mut batch, 2, 40);
        assert_eq!(batch.remaining(), 96);
        batch.next_fragment(24, 1).expect("first");
        batch.next_fragment(16, 1).expect("second");
        batch.abort();

        let mut offset = 0;
        while offset < 96 {
            let header = partition.read_header(offset).expect("header");
            assert!(header.is_committed());
            assert_eq!(header.frame_type, FrameType::Padding);
            assert_eq!(header.flags, 0);
            offset += header.frame_len();
        }
        assert_eq!(offset, 96);
    }

    #[test]
    fn unaligned_fragments_fit_their_message_total() {
        let set = PartitionBuilder::new(1024, 2).allocate().expect("allocate");
        let partition = &set[0];
        let mut batch = ClaimedFragmentBatch::new();
        assert_eq!(
            appender::claim_batch(partition, &mut batch, 3, 30),
            AppendOutcome::Claimed(Position::new(0, 112))
        );

        let mut offsets = Vec::new();
        for index in 0..3u8 {
            let mut fragment = batch.next_fragment(10, 1).expect("fragment");
            fragment.buffer_mut().fill(index);
            offsets.push(fragment.offset());
        }
        assert_eq!(offsets, vec![16, 48, 80]);
        assert_eq!(batch.remaining(), 16);
        batch.commit();

        assert_eq!(partition.read_header(0).expect("first").flags, FLAG_BATCH_BEGIN);
        let last = partition.read_header(64).expect("last");
        assert_eq!(last.flags, FLAG_BATCH_END);
        assert_eq!(last.length, 26);
        let padding = partition.read_header(96).expect("padding");
        assert_eq!(padding.frame_type, FrameType::Padding);
        assert_eq!(padding.length, 16);
        assert_eq!(partition.slice(80, 10), &[2u8; 10]);
    }
}
