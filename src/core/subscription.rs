// Subscription read cursor: sequential scan of published frames across partitions.
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FrameType, HEADER_LENGTH};
use crate::core::log_buffer::LogBuffer;
use crate::core::peek::{self, BlockPeek};
use crate::core::position::Position;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragmentAction {
    /// Advance past the fragment.
    Consume,
    /// Halt the poll; the fragment is delivered again on the next poll.
    Stop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentRef<'a> {
    pub payload: &'a [u8],
    /// Offset of the payload within its partition.
    pub offset: usize,
    pub stream_id: i32,
    pub flags: u8,
    /// Position just past the frame; equals the producer's claim result.
    pub position: Position,
}

impl FragmentRef<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_marked_failed(&self) -> bool {
        frame::is_failed(self.flags)
    }

    pub fn is_batch_begin(&self) -> bool {
        frame::is_batch_begin(self.flags)
    }

    pub fn is_batch_end(&self) -> bool {
        frame::is_batch_end(self.flags)
    }
}

pub trait FragmentHandler {
    fn on_fragment(&mut self, fragment: FragmentRef<'_>) -> FragmentAction;
}

impl<F> FragmentHandler for F
where
    F: FnMut(FragmentRef<'_>) -> FragmentAction,
{
    fn on_fragment(&mut self, fragment: FragmentRef<'_>) -> FragmentAction {
        self(fragment)
    }
}

pub struct Subscription {
    name: String,
    log: Arc<LogBuffer>,
    slot: Option<usize>,
    position: Position,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("position", &self.position)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn open(log: Arc<LogBuffer>, name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if log.is_closed() {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("log buffer is closed")
                .with_name(log.name().to_string()));
        }
        let (slot, position) = log
            .open_slot()
            .map_err(|err| {
                let detail = err.message().unwrap_or("no free slot").to_string();
                err.with_message(format!("cannot open subscription {name}: {detail}"))
            })?;
        tracing::debug!(dispatcher = %log.name(), subscription = %name, slot, %position, "subscription opened");
        Ok(Self {
            name,
            log,
            slot: Some(slot),
            position,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_none() || self.log.is_closed()
    }

    /// Delivers up to `max_fragments` messages to `handler`; returns how many were consumed.
    pub fn poll<H>(&mut self, handler: &mut H, max_fragments: usize) -> Result<usize, Error>
    where
        H: FragmentHandler + ?Sized,
    {
        let slot = self.ensure_open()?;
        let log: &LogBuffer = &self.log;
        let mut position = self.position;
        let mut consumed = 0;

        let result = loop {
            if consumed >= max_fragments {
                break Ok(());
            }
            match read_frame_at(log, position) {
                Err(err) => break Err(err),
                Ok(ReadResult::WouldBlock) => break Ok(()),
                Ok(ReadResult::Padding { next }) | Ok(ReadResult::EndOfPartition { next }) => {
                    position = next;
                }
                Ok(ReadResult::Message { fragment, next }) => match handler.on_fragment(fragment) {
                    FragmentAction::Consume => {
                        position = next;
                        consumed += 1;
                    }
                    FragmentAction::Stop => break Ok(()),
                },
            }
        };

        self.position = position;
        log.update_slot(slot, position);
        result.map(|()| consumed)
    }

    /// Whether a published message is readable at or after the current position.
    pub fn has_available(&self) -> Result<bool, Error> {
        self.ensure_open()?;
        let log: &LogBuffer = &self.log;
        let mut position = self.position;
        loop {
            match read_frame_at(log, position)? {
                ReadResult::Message { .. } => return Ok(true),
                ReadResult::WouldBlock => return Ok(false),
                ReadResult::Padding { next } | ReadResult::EndOfPartition { next } => position = next,
            }
        }
    }

    /// Zero-copy view over the longest run of published messages, bounded by
    /// `max_length` frame bytes and, when `stream_aware`, by one stream id.
    pub fn peek_block(&mut self, max_length: usize, stream_aware: bool) -> Result<Option<BlockPeek<'_>>, Error> {
        self.ensure_open()?;
        let log: &LogBuffer = &self.log;
        let mut position = self.position;
        loop {
            match read_frame_at(log, position)? {
                ReadResult::WouldBlock => return Ok(None),
                ReadResult::Padding { next } | ReadResult::EndOfPartition { next } => position = next,
                ReadResult::Message { .. } => break,
            }
        }
        let partition = log.partition_for(position.term());
        let Some(span) = peek::scan_block(partition, position.offset(), max_length, stream_aware)? else {
            return Ok(None);
        };
        Ok(Some(BlockPeek::new(self, position, span)))
    }

    pub(crate) fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub(crate) fn advance_to(&mut self, position: Position) {
        debug_assert!(position >= self.position, "subscription position moved backwards");
        self.position = position;
        if let Some(slot) = self.slot {
            self.log.update_slot(slot, position);
        }
    }

    /// Frees the slot so rotation no longer waits on this subscription.
    pub fn close(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.log.release_slot(slot);
            tracing::debug!(
                dispatcher = %self.log.name(),
                subscription = %self.name,
                position = %self.position,
                "subscription closed"
            );
        }
    }

    fn ensure_open(&self) -> Result<usize, Error> {
        let closed = || {
            Error::new(ErrorKind::Closed)
                .with_name(self.log.name().to_string())
                .with_position(self.position)
        };
        let Some(slot) = self.slot else {
            return Err(closed().with_message(format!("subscription {} is closed", self.name)));
        };
        if self.log.is_closed() {
            return Err(closed().with_message("log buffer is closed"));
        }
        Ok(slot)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

enum ReadResult<'a> {
    Message { fragment: FragmentRef<'a>, next: Position },
    Padding { next: Position },
    EndOfPartition { next: Position },
    WouldBlock,
}

fn read_frame_at(log: &LogBuffer, position: Position) -> Result<ReadResult<'_>, Error> {
    let term = position.term();
    let partition = log.partition_for(term);
    match partition.term() {
        Some(current) if current == term => {}
        Some(current) if current > term => {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("partition recycled to term {current} under a reader"))
                .with_name(log.name().to_string())
                .with_position(position));
        }
        // Not yet activated for this term, or mid-recycle.
        _ => return Ok(ReadResult::WouldBlock),
    }

    let offset = position.offset();
    let capacity = partition.capacity();
    if offset >= capacity {
        return Ok(ReadResult::EndOfPartition {
            next: position.next_term(),
        });
    }
    if partition.load_length(offset) <= 0 {
        return Ok(ReadResult::WouldBlock);
    }

    let header = partition
        .read_header(offset)
        .and_then(|header| header.validate(capacity).map(|()| header))
        .map_err(|err| err.with_name(log.name().to_string()).with_position(position))?;
    let frame_len = header.frame_len();
    if offset + frame_len > capacity {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("frame exceeds partition")
            .with_name(log.name().to_string())
            .with_position(position));
    }

    let end = offset + frame_len;
    let next = if end == capacity {
        position.next_term()
    } else {
        Position::new(term, end as u32)
    };

    match header.frame_type {
        FrameType::Padding => Ok(ReadResult::Padding { next }),
        FrameType::Message => Ok(ReadResult::Message {
            fragment: FragmentRef {
                payload: partition.slice(offset + HEADER_LENGTH, header.payload_len()),
                offset: offset + HEADER_LENGTH,
                stream_id: header.stream_id,
                flags: header.flags,
                position: Position::new(term, end as u32),
            },
            next,
        }),
    }
}
