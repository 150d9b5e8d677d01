use std::time::Duration;

use thiserror::Error;

use crate::protocols::Protocol;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(u32),

    #[error("flow timeout must be at least 1s, got {0:?}")]
    InvalidTimeout(Duration),

    #[error("flow report period must be disabled or at least 1s, got {0:?}")]
    InvalidPeriod(Duration),

    #[error("duplicate port ({port}) exists in {existing} and {new} protocols")]
    DuplicatePort {
        port: u16,
        existing: Protocol,
        new: Protocol,
    },

    #[error("flow key layout needs {size} bytes, offsets are limited to 255")]
    FlowKeyTooLarge { size: usize },

    #[error("counter {0:?} already registered")]
    DuplicateCounter(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
