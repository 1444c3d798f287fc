//! Purpose: Public façade that producers and consumers share.
//! Exports: `Dispatcher`.
//! Role: Argument checks and handle management over one `LogBuffer`.
//! Invariants: Cloning shares the log; memory is released with the last handle or subscription.
//! Invariants: Misuse is an `Error`; backpressure and closure are `ClaimResult` values.
use std::sync::Arc;

use crate::core::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame;
use crate::core::log_buffer::{ClaimResult, LogBuffer};
use crate::core::options::DispatcherOptions;
use crate::core::position::Position;
use crate::core::subscription::Subscription;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug)]
pub struct Dispatcher {
    log: Arc<LogBuffer>,
}

impl Dispatcher {
    pub fn new(options: DispatcherOptions) -> ApiResult<Self> {
        Ok(Self {
            log: Arc::new(LogBuffer::new(&options)?),
        })
    }

    pub fn name(&self) -> &str {
        self.log.name()
    }

    pub fn partition_count(&self) -> usize {
        self.log.layout().partition_count
    }

    pub fn partition_size(&self) -> usize {
        self.log.layout().partition_size
    }

    pub fn max_fragment_length(&self) -> usize {
        self.log.layout().max_fragment_length
    }

    /// Reserves one message frame of `length` payload bytes in the active partition.
    pub fn claim_single_fragment<'a>(
        &'a self,
        claim: &mut ClaimedFragment<'a>,
        length: usize,
        stream_id: i32,
    ) -> ApiResult<ClaimResult> {
        if self.log.is_closed() {
            return Ok(ClaimResult::Closed);
        }
        let max = self.max_fragment_length();
        if length > max {
            return Err(self
                .error(ErrorKind::Capacity)
                .with_message(format!("fragment of {length} bytes exceeds max fragment length {max}")));
        }
        if claim.is_claimed() {
            return Err(self
                .error(ErrorKind::Usage)
                .with_message("claimed fragment still holds an unresolved claim"));
        }
        Ok(self.log.claim(claim, length, stream_id))
    }

    /// Reserves room for `fragment_count` fragments totalling `total_length` payload
    /// bytes in one step; fragments are then carved with `next_fragment`. Space the
    /// fragments do not use becomes one padding frame at commit.
    pub fn claim_fragment_batch<'a>(
        &'a self,
        batch: &mut ClaimedFragmentBatch<'a>,
        fragment_count: usize,
        total_length: usize,
    ) -> ApiResult<ClaimResult> {
        if self.log.is_closed() {
            return Ok(ClaimResult::Closed);
        }
        let reservation = frame::batch_length(fragment_count, total_length);
        self.check_batch(batch, fragment_count, reservation)?;
        Ok(self.log.claim_batch(batch, fragment_count, total_length))
    }

    /// Like `claim_fragment_batch`, but reserves exactly the frames for `lengths`.
    pub fn claim_fragment_batch_exact<'a>(
        &'a self,
        batch: &mut ClaimedFragmentBatch<'a>,
        lengths: &[usize],
    ) -> ApiResult<ClaimResult> {
        if self.log.is_closed() {
            return Ok(ClaimResult::Closed);
        }
        let reservation = frame::exact_batch_length(lengths);
        self.check_batch(batch, lengths.len(), reservation)?;
        Ok(self.log.claim_batch_exact(batch, lengths))
    }

    /// One claim attempt that copies `payload` and commits on success.
    pub fn offer(&self, payload: &[u8], stream_id: i32) -> ApiResult<ClaimResult> {
        let mut claim = ClaimedFragment::new();
        let result = self.claim_single_fragment(&mut claim, payload.len(), stream_id)?;
        if result.is_claimed() {
            claim.buffer_mut().copy_from_slice(payload);
            claim.commit();
        }
        Ok(result)
    }

    pub fn open_subscription(&self, name: impl Into<String>) -> ApiResult<Subscription> {
        Subscription::open(Arc::clone(&self.log), name)
    }

    pub fn publisher_position(&self) -> Position {
        self.log.publisher_position()
    }

    pub fn subscriber_count(&self) -> usize {
        self.log.subscriber_count()
    }

    /// Stops further claims and subscription reads; returns whether this call closed it.
    pub fn close(&self) -> bool {
        self.log.close()
    }

    pub fn is_closed(&self) -> bool {
        self.log.is_closed()
    }

    fn check_batch(&self, batch: &ClaimedFragmentBatch<'_>, fragment_count: usize, reservation: usize) -> ApiResult<()> {
        if fragment_count == 0 {
            return Err(self
                .error(ErrorKind::Usage)
                .with_message("batch needs at least one fragment"));
        }
        let max = self.log.layout().max_frame_length;
        if reservation > max {
            return Err(self.error(ErrorKind::Capacity).with_message(format!(
                "batch of {fragment_count} fragments needs {reservation} bytes, limit {max}"
            )));
        }
        if batch.is_claimed() {
            return Err(self
                .error(ErrorKind::Usage)
                .with_message("claimed batch still holds an unresolved claim"));
        }
        Ok(())
    }

    fn error(&self, kind: ErrorKind) -> Error {
        Error::new(kind).with_name(self.log.name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::core::claim::{ClaimedFragment, ClaimedFragmentBatch};
    use crate::core::error::ErrorKind;
    use crate::core::log_buffer::ClaimResult;
    use crate::core::options::DispatcherOptions;
    use crate::core::position::Position;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            DispatcherOptions::new(2048)
                .with_name("unit")
                .with_max_fragment_length(64),
        )
        .expect("dispatcher")
    }

    #[test]
    fn accessors_report_layout() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.name(), "unit");
        assert_eq!(dispatcher.partition_count(), 2);
        assert_eq!(dispatcher.partition_size(), 1024);
        assert_eq!(dispatcher.max_fragment_length(), 64);
    }

    #[test]
    fn oversized_fragment_is_a_capacity_error() {
        let dispatcher = dispatcher();
        let mut claim = ClaimedFragment::new();
        let err = dispatcher
            .claim_single_fragment(&mut claim, 65, 1)
            .expect_err("too long");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(dispatcher.publisher_position(), Position::ZERO);
    }

    #[test]
    fn busy_scratch_claim_is_rejected() {
        let dispatcher = dispatcher();
        let mut claim = ClaimedFragment::new();
        let result = dispatcher.claim_single_fragment(&mut claim, 16, 1).expect("claim");
        assert_eq!(result, ClaimResult::Claimed(Position::new(0, 32)));
        let err = dispatcher
            .claim_single_fragment(&mut claim, 16, 1)
            .expect_err("busy");
        assert_eq!(err.kind(), ErrorKind::Usage);
        claim.commit();
        assert!(dispatcher.claim_single_fragment(&mut claim, 16, 1).expect("claim").is_claimed());
        claim.commit();
    }

    #[test]
    fn batch_is_bounded_by_max_frame() {
        let dispatcher = dispatcher();
        let mut batch = ClaimedFragmentBatch::new();
        let err = dispatcher
            .claim_fragment_batch(&mut batch, 4, 64)
            .expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        let err = dispatcher
            .claim_fragment_batch(&mut batch, 0, 0)
            .expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = dispatcher
            .claim_fragment_batch_exact(&mut batch, &[])
            .expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = dispatcher
            .claim_fragment_batch_exact(&mut batch, &[32, 32])
            .expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let result = dispatcher.claim_fragment_batch(&mut batch, 2, 32).expect("batch");
        assert_eq!(result, ClaimResult::Claimed(Position::new(0, 80)));
        let err = dispatcher
            .claim_fragment_batch_exact(&mut batch, &[16])
            .expect_err("busy");
        assert_eq!(err.kind(), ErrorKind::Usage);
        batch.abort();

        let result = dispatcher
            .claim_fragment_batch_exact(&mut batch, &[16, 16])
            .expect("batch");
        assert_eq!(result, ClaimResult::Claimed(Position::new(0, 144)));
        batch.abort();
    }

    #[test]
    fn offer_commits_payload() {
        let dispatcher = dispatcher();
        let mut subscription = dispatcher.open_subscription("reader").expect("open");
        let result = dispatcher.offer(b"hello", 3).expect("offer");
        assert_eq!(result.position(), Some(Position::new(0, 32)));

        let peek = subscription.peek_block(1024, false).expect("peek").expect("block");
        let fragment = peek.fragments().next().expect("fragment");
        assert_eq!(fragment.payload, b"hello");
        assert_eq!(fragment.stream_id, 3);
    }

    #[test]
    fn close_wins_over_argument_checks() {
        let dispatcher = dispatcher();
        let handle = dispatcher.clone();
        assert!(handle.close());
        assert!(dispatcher.is_closed());
        let mut claim = ClaimedFragment::new();
        assert_eq!(
            dispatcher.claim_single_fragment(&mut claim, 1 << 20, 1).expect("closed"),
            ClaimResult::Closed
        );
        assert_eq!(dispatcher.offer(b"x", 1).expect("closed"), ClaimResult::Closed);
        let err = dispatcher.open_subscription("late").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
