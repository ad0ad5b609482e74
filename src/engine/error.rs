use thiserror::Error;

use crate::channel::ChannelError;
use crate::tracer::event::GroupKey;

/// Degradations the engine recovers from locally.
///
/// None of these is fatal: the engine logs them, counts them in its stats,
/// and carries on with the next event.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("aggregation table at capacity ({capacity} keys), dropped update for key {key}")]
    CapacityExceeded { key: GroupKey, capacity: usize },

    #[error("output channel reservation failed: {0}")]
    ChannelFull(#[from] ChannelError),

    #[error("drain target missing or mis-sized ({len} words)")]
    InvalidContext { len: usize },

    #[error("{live} live groups but only {emitted} fit the flush; remainder discarded")]
    Truncation { live: usize, emitted: usize },
}

/// Coarse classification of [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapacityExceeded,
    InvalidContext,
    Truncation,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } | Self::ChannelFull(_) => ErrorKind::CapacityExceeded,
            Self::InvalidContext { .. } => ErrorKind::InvalidContext,
            Self::Truncation { .. } => ErrorKind::Truncation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let full = EngineError::from(ChannelError::Full { requested: 56, free: 8 });
        assert_eq!(full.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(
            EngineError::Truncation { live: 3, emitted: 1 }.kind(),
            ErrorKind::Truncation
        );
    }

    #[test]
    fn test_display() {
        let err = EngineError::CapacityExceeded {
            key: GroupKey::new(9, 1),
            capacity: 2,
        };
        assert_eq!(
            err.to_string(),
            "aggregation table at capacity (2 keys), dropped update for key (9, 1)"
        );
    }
}
