//! Purpose: Define the public Rust API boundary for the dispatcher.
//! Exports: `Dispatcher`, claim cursors, subscription types, options, and errors.
//! Role: Stable, additive-only surface over the core modules.
//! Invariants: Producers and consumers only reach partitions through these types.

mod dispatcher;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::claim::{BatchFragment, ClaimedFragment, ClaimedFragmentBatch};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::log_buffer::ClaimResult;
pub use crate::core::options::DispatcherOptions;
pub use crate::core::peek::{BlockFragments, BlockPeek};
pub use crate::core::position::Position;
pub use crate::core::subscription::{FragmentAction, FragmentHandler, FragmentRef, Subscription};
pub use dispatcher::Dispatcher;
