// Core modules implementing partitioned storage, the claim protocol, and consumption.
pub mod appender;
pub mod claim;
pub mod error;
pub mod frame;
pub mod log_buffer;
pub mod options;
pub mod partition;
pub mod peek;
pub mod position;
pub mod subscription;
pub mod validate;
