//! Error types shared by the device, configuration and sweep layers.
use thiserror::Error;

/// Failures of the lane-group device (initialization, memory, launches)
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no suitable device: {0}")]
    NoDevice(String),

    #[error("failed to allocate {bytes} bytes of device memory")]
    AllocationFailed { bytes: usize },

    #[error("transfer of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    TransferOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("failed to launch lane {lane}: {source}")]
    Launch {
        lane: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("lane {0} panicked during kernel execution")]
    LanePanicked(usize),
}

/// Malformed sweep configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not parse {key}={value:?}: {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv output error: {0}")]
    Csv(#[from] csv::Error),

    #[error("result writer thread stopped before the sweep finished")]
    WriterClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
