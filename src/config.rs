// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Link configuration shared by the packet transport and the transfer loop.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("attempts per packet must be at least 1")]
    NoAttempts,
    #[error("ack poll limit must be at least 1")]
    NoAckPolls,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// GPIO number of the select line
    pub gpio_line: u32,
    /// Directory holding the exported `gpio{N}` entries
    pub gpio_root: PathBuf,
    /// Wait between selecting the peripheral and writing the frame
    pub settle_delay: Duration,
    /// Pause after a failed attempt before the next one
    pub retry_delay: Duration,
    /// Attempts per chunk before the transfer is abandoned
    pub max_attempts: u32,
    /// Poll exchanges allowed per frame before giving up on the ack
    pub ack_poll_limit: u32,
    /// Optional wall-clock bound on the ack poll
    pub ack_timeout: Option<Duration>,
    /// Pause between poll exchanges
    pub ack_poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            gpio_line: 59,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            settle_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(20),
            max_attempts: 3,
            ack_poll_limit: 1_000_000,
            ack_timeout: None,
            ack_poll_interval: Duration::ZERO,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.ack_poll_limit == 0 {
            return Err(ConfigError::NoAckPolls);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(20));
        assert_eq!(config.settle_delay, Duration::from_millis(1));
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let config = LinkConfig { max_attempts: 0, ..LinkConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::NoAttempts));

        let config = LinkConfig { ack_poll_limit: 0, ..LinkConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::NoAckPolls));
    }
}
