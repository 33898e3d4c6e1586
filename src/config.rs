//! # Exchange Configuration
//!
//! Timeouts and pipelining limits for the piece exchange.
//!
//! The defaults are the conventional values for the peer wire protocol:
//! 16 KiB blocks, up to 5 pipelined requests per peer, and a 30 second
//! budget to download one piece.

use std::time::Duration;

use crate::error::ExchangeError;

/// Standard block size for piece downloads (16KB)
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;

/// Largest block most clients will serve; bigger requests get peers to drop us
pub const MAX_BLOCK_SIZE: u32 = 131072;

/// Maximum number of concurrent block requests per peer
pub const DEFAULT_BACKLOG: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Deadline for the handshake exchange
    pub handshake_timeout: Duration,
    /// Deadline for the bitfield sent after the handshake
    pub bitfield_timeout: Duration,
    /// Overall budget for downloading one piece, choke waits included
    pub piece_timeout: Duration,
    /// Largest block requested in one REQUEST message
    pub block_size: u32,
    /// Maximum number of unanswered requests per peer
    pub backlog: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            piece_timeout: Duration::from_secs(30),
            block_size: DEFAULT_BLOCK_SIZE,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ExchangeConfig {
    /// Checks that the configuration can drive a download.
    pub fn validate(&self) -> Result<(), ExchangeError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ExchangeError::InvalidConfig(format!(
                "block size must be between 1 and {} bytes, got {}",
                MAX_BLOCK_SIZE, self.block_size
            )));
        }

        if self.backlog == 0 {
            return Err(ExchangeError::InvalidConfig(
                "backlog must be at least 1".to_string(),
            ));
        }

        let timeouts = [
            ("connect", self.connect_timeout),
            ("handshake", self.handshake_timeout),
            ("bitfield", self.bitfield_timeout),
            ("piece", self.piece_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(ExchangeError::InvalidConfig(format!(
                    "{} timeout cannot be zero",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ExchangeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 16384);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.piece_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_values() {
        let zero_block = ExchangeConfig {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_block.validate(),
            Err(ExchangeError::InvalidConfig(_))
        ));

        let huge_block = ExchangeConfig {
            block_size: MAX_BLOCK_SIZE + 1,
            ..Default::default()
        };
        assert!(huge_block.validate().is_err());

        let no_backlog = ExchangeConfig {
            backlog: 0,
            ..Default::default()
        };
        assert!(no_backlog.validate().is_err());

        let no_timeout = ExchangeConfig {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());
    }
}
