// Zero-copy block views over runs of published frames, the batch-oriented side of a subscription.
// A block stays in one partition and ends on a frame boundary; it splits a batch only when
// the bounds cannot hold the whole leading batch.
use crate::core::error::Error;
use crate::core::frame::{self, FrameHeader, FrameType, HEADER_LENGTH};
use crate::core::partition::Partition;
use crate::core::position::Position;
use crate::core::subscription::{FragmentRef, Subscription};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BlockSpan {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) fragment_count: usize,
}

/// Finds the longest block starting at `start` that ends outside a batch. When the
/// leading batch itself breaks the bounds, returns the frames of it that fit.
/// `None` when the first frame is unpublished or longer than `max_length`.
pub(crate) fn scan_block(
    partition: &Partition,
    start: usize,
    max_length: usize,
    stream_aware: bool,
) -> Result<Option<BlockSpan>, Error> {
    let capacity = partition.capacity();
    let mut offset = start;
    let mut count = 0;
    let mut stream_id = None;
    let mut in_batch = false;
    let mut block = None;

    while offset + HEADER_LENGTH <= capacity {
        if partition.load_length(offset) <= 0 {
            break;
        }
        let header = partition.read_header(offset)?;
        header.validate(capacity).map_err(|err| err.with_offset(offset))?;
        if header.frame_type == FrameType::Padding {
            break;
        }
        if stream_aware && stream_id.is_some_and(|id| id != header.stream_id) {
            break;
        }
        let end = offset + header.frame_len();
        if end - start > max_length || end > capacity {
            break;
        }

        offset = end;
        count += 1;
        stream_id = Some(header.stream_id);
        if frame::is_batch_begin(header.flags) {
            in_batch = true;
        }
        if frame::is_batch_end(header.flags) {
            in_batch = false;
        }
        if !in_batch {
            block = Some(BlockSpan {
                start,
                end,
                fragment_count: count,
            });
        }
    }

    if block.is_none() && count > 0 {
        // The bounds cut the leading batch; hand out its prefix so the reader moves.
        block = Some(BlockSpan {
            start,
            end: offset,
            fragment_count: count,
        });
    }
    Ok(block)
}

pub struct BlockPeek<'s> {
    subscription: &'s mut Subscription,
    term: u32,
    span: BlockSpan,
}

impl<'s> BlockPeek<'s> {
    pub(crate) fn new(subscription: &'s mut Subscription, start: Position, span: BlockSpan) -> Self {
        debug_assert_eq!(start.offset(), span.start);
        Self {
            subscription,
            term: start.term(),
            span,
        }
    }

    /// Headers and payloads of every frame in the block, exactly as published.
    pub fn buffer(&self) -> &[u8] {
        self.subscription
            .log()
            .partition_for(self.term)
            .slice(self.span.start, self.len())
    }

    pub fn len(&self) -> usize {
        self.span.end - self.span.start
    }

    pub fn is_empty(&self) -> bool {
        self.span.fragment_count == 0
    }

    /// Offset of the block's first header within its partition.
    pub fn offset(&self) -> usize {
        self.span.start
    }

    pub fn position(&self) -> Position {
        Position::new(self.term, self.span.start as u32)
    }

    /// Position `mark_completed` moves the subscription to.
    pub fn end_position(&self) -> Position {
        Position::new(self.term, self.span.end as u32)
    }

    pub fn fragment_count(&self) -> usize {
        self.span.fragment_count
    }

    pub fn fragments(&self) -> BlockFragments<'_> {
        BlockFragments {
            buffer: self.buffer(),
            base: self.span.start,
            term: self.term,
            cursor: 0,
        }
    }

    pub fn mark_completed(self) {
        let end = self.end_position();
        self.subscription.advance_to(end);
    }

    pub fn mark_failed(self) {}
}

impl std::fmt::Debug for BlockPeek<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPeek")
            .field("subscription", &self.subscription.name())
            .field("position", &self.position())
            .field("len", &self.len())
            .field("fragment_count", &self.fragment_count())
            .finish()
    }
}

/// Walks the frames of a peeked block.
#[derive(Clone, Debug)]
pub struct BlockFragments<'b> {
    buffer: &'b [u8],
    base: usize,
    term: u32,
    cursor: usize,
}

impl<'b> Iterator for BlockFragments<'b> {
    type Item = FragmentRef<'b>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buffer.get(self.cursor..)?;
        let header = FrameHeader::decode(rest).ok()?;
        let frame_len = header.frame_len();
        let payload = rest.get(HEADER_LENGTH..HEADER_LENGTH + header.payload_len())?;
        let offset = self.base + self.cursor;
        self.cursor += frame_len;
        Some(FragmentRef {
            payload,
            offset: offset + HEADER_LENGTH,
            stream_id: header.stream_id,
            flags: header.flags,
            position: Position::new(self.term, (offset + frame_len) as u32),
        })
    }
}
