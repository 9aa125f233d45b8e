//! Configuration errors.
//!
//! Everything in this module describes bad input detected before any device
//! resource is touched, and is always recoverable by the caller.

use std::fmt;

/// Result type for portacc-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which hardware limit a work division or request runs into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    GridBlockExtent,
    GridBlockCount,
    BlockThreadExtent,
    BlockThreadCount,
    ThreadElemExtent,
    ThreadElemCount,
    BlockSharedMemBytes,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Limit::GridBlockExtent => "grid block extent",
            Limit::GridBlockCount => "grid block count",
            Limit::BlockThreadExtent => "block thread extent",
            Limit::BlockThreadCount => "block thread count",
            Limit::ThreadElemExtent => "thread element extent",
            Limit::ThreadElemCount => "thread element count",
            Limit::BlockSharedMemBytes => "block shared memory",
        };
        f.write_str(name)
    }
}

/// Errors raised by index, work-division and configuration handling
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A component that must be positive is zero
    #[error("{what} has a zero component on axis {axis}")]
    ZeroExtent { what: &'static str, axis: usize },

    /// A per-axis or aggregate device limit is exceeded
    #[error("{limit} exceeds the device maximum: {value} > {max}{}", axis_suffix(.axis))]
    LimitExceeded {
        limit: Limit,
        axis: Option<usize>,
        value: usize,
        max: usize,
    },

    /// A region does not fit into the view it addresses
    #[error("{what} out of range on axis {axis}: {requested} > {available}")]
    ExtentOutOfRange {
        what: &'static str,
        axis: usize,
        requested: usize,
        available: usize,
    },

    /// A product of extents overflows the index type
    #[error("{what} overflows the index type")]
    IndexOverflow { what: &'static str },

    /// A queue was handed memory it cannot address
    #[error("{queue} cannot access {space} memory")]
    UnsupportedMemSpace { queue: String, space: String },

    /// Invalid runtime configuration value
    #[error("invalid configuration for {key}: {message}")]
    InvalidConfig { key: &'static str, message: String },

    /// Configuration document could not be parsed
    #[error("failed to parse runtime configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

fn axis_suffix(axis: &Option<usize>) -> String {
    match axis {
        Some(axis) => format!(" on axis {axis}"),
        None => String::new(),
    }
}

impl Error {
    pub fn limit(limit: Limit, axis: Option<usize>, value: usize, max: usize) -> Self {
        Error::LimitExceeded { limit, axis, value, max }
    }

    pub fn invalid_config(key: &'static str, message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            key,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_message_names_axis() {
        let err = Error::limit(Limit::BlockThreadExtent, Some(0), 2048, 1024);
        assert_eq!(
            err.to_string(),
            "block thread extent exceeds the device maximum: 2048 > 1024 on axis 0"
        );
    }

    #[test]
    fn test_aggregate_limit_message() {
        let err = Error::limit(Limit::GridBlockCount, None, 10, 4);
        assert_eq!(err.to_string(), "grid block count exceeds the device maximum: 10 > 4");
    }
}
