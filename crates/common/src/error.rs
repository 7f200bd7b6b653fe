//! Error types shared by the testbed crates.

use std::io;
use thiserror::Error;

/// Result type for testbed operations that can fail at startup.
pub type TestbedResult<T> = Result<T, TestbedError>;

/// Reasons a datagram could not be encoded or decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram length differs from the layout's frame size
    #[error("wrong frame size: expected {expected} bytes, got {actual}")]
    WrongSize { expected: usize, actual: usize },

    /// Status byte outside READY/BUSY/NO_CONN
    #[error("unknown controller status code {0}")]
    UnknownStatus(u8),

    /// Command tag not in the command table
    #[error("unknown command tag {0}")]
    UnknownCommand(u32),

    /// SET_PHASE profile does not fit the outbound payload
    #[error("phase payload of {len} codes exceeds {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// SET_PHASE carries a code count other than the array's element count
    #[error("phase profile has {actual} codes, array has {expected} elements")]
    PhaseCount { expected: usize, actual: usize },

    /// Layout table has no row matching the requested shape
    #[error("unsupported frame layout: {0}")]
    Layout(String),
}

/// Array geometry construction errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("array must have at least one row and one column (got {cols}x{rows})")]
    Empty { cols: usize, rows: usize },

    #[error("carrier frequency must be positive and finite (got {0} Hz)")]
    BadFrequency(f64),

    #[error("phase shifter resolution must be 1..=7 bits (got {0})")]
    BadPhaseBits(u32),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for startup paths (binding sockets, opening logs, loading config).
#[derive(Error, Debug)]
pub enum TestbedError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("CSV log error: {0}")]
    Csv(#[from] csv::Error),
}
