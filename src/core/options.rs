// Dispatcher construction options and the validated partition layout derived from them.
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, FRAME_ALIGNMENT, HEADER_LENGTH};

pub const DEFAULT_NAME: &str = "dispatcher";
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_FRAGMENT_LENGTH: usize = 64 * 1024;
pub const DEFAULT_PARTITION_COUNT: usize = 2;
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 16;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherOptions {
    pub name: String,
    pub buffer_size: usize,
    pub max_fragment_length: usize,
    pub partition_count: usize,
    pub max_subscriptions: usize,
}

impl DispatcherOptions {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_fragment_length(mut self, max_fragment_length: usize) -> Self {
        self.max_fragment_length = max_fragment_length;
        self
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_max_subscriptions(mut self, max_subscriptions: usize) -> Self {
        self.max_subscriptions = max_subscriptions;
        self
    }

    pub fn from_json(input: &str) -> Result<Self, Error> {
        serde_json::from_str(input).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid dispatcher options")
                .with_source(err)
        })
    }

    pub fn layout(&self) -> Result<LogLayout, Error> {
        let usage = |message: String| {
            Error::new(ErrorKind::Usage)
                .with_message(message)
                .with_name(self.name.clone())
        };

        if self.partition_count < 2 {
            return Err(usage(format!(
                "partition count must be at least 2 (got {})",
                self.partition_count
            )));
        }
        if self.max_subscriptions == 0 {
            return Err(usage("max subscriptions must be positive".to_string()));
        }
        if self.max_fragment_length == 0 {
            return Err(usage("max fragment length must be positive".to_string()));
        }

        let partition_size = frame::align_down(self.buffer_size / self.partition_count, FRAME_ALIGNMENT);
        let max_frame_length = frame::aligned_framed_length(self.max_fragment_length);
        let required = 2 * max_frame_length + HEADER_LENGTH;
        if partition_size < required {
            return Err(usage(format!(
                "buffer size {} too small: each of {} partitions needs {required} bytes for two {}-byte fragments",
                self.buffer_size, self.partition_count, self.max_fragment_length
            )));
        }
        if partition_size > i32::MAX as usize {
            return Err(usage(format!(
                "partition size {partition_size} exceeds {}",
                i32::MAX
            )));
        }

        Ok(LogLayout {
            partition_size,
            partition_count: self.partition_count,
            max_fragment_length: self.max_fragment_length,
            max_frame_length,
        })
    }
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_fragment_length: DEFAULT_MAX_FRAGMENT_LENGTH,
            partition_count: DEFAULT_PARTITION_COUNT,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
        }
    }
}

/// Validated sizes derived from `DispatcherOptions`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogLayout {
    pub partition_size: usize,
    pub partition_count: usize,
    pub max_fragment_length: usize,
    /// Aligned frame length of a maximal fragment; also bounds batch reservations.
    pub max_frame_length: usize,
}
