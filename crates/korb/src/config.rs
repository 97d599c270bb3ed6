// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! [`RuntimeConfig`] is the value object handed to connections and the
//! reactor by the bootstrap layer. Property parsing lives outside this
//! crate; only the resolved values are consumed here.
//!
//! # Example
//!
//! ```
//! use korb::config::RuntimeConfig;
//! use std::time::Duration;
//!
//! let config = RuntimeConfig {
//!     connect_timeout: Duration::from_secs(5),
//!     compress_level: 9,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::time::Duration;

/// Trace verbosity, per category.
///
/// `protocol >= 1` logs one line per sent/received protocol message;
/// `network >= 1` logs connection lifecycle; higher values add detail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub protocol: u8,
    pub network: u8,
}

/// Resolved runtime configuration for connections and the reactor.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    // === Timeouts ===
    /// Time allowed for transceiver init + protocol validation.
    /// Zero disables the connect timer.
    pub connect_timeout: Duration,

    /// Time allowed for a graceful shutdown to drain before the
    /// connection is forced closed. Zero disables the close timer.
    pub close_timeout: Duration,

    /// Close a connection with no dispatches, no pending invocations and
    /// nothing mid-read after this long. Zero disables the inactivity
    /// timer.
    pub inactivity_timeout: Duration,

    /// Abort a connection that received no bytes for this long (peer
    /// liveness check). Zero disables the idle check. Heartbeats exist to
    /// feed the peer's idle check; they are emitted at half this period.
    pub idle_timeout: Duration,

    /// Run the idle check at all.
    pub enable_idle_check: bool,

    // === Framing ===
    /// Maximum accepted incoming frame size (anti-OOM protection).
    pub max_frame_size: usize,

    // === Compression ===
    /// Deflate level used for outgoing frames flagged compressible (1-9).
    pub compress_level: u32,

    /// Frames below this size are never compressed.
    pub compress_min_size: usize,

    // === Decoding ===
    /// Maximum class-graph nesting depth accepted by the codec.
    pub max_graph_depth: usize,

    // === Diagnostics ===
    /// Log unusual connection closures at warn level.
    pub warn_connections: bool,

    /// Trace verbosity.
    pub trace: TraceConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            enable_idle_check: true,
            max_frame_size: 1024 * 1024,
            compress_level: 6,
            compress_min_size: 100,
            max_graph_depth: 100,
            warn_connections: false,
            trace: TraceConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Check the configuration for unusable values.
    ///
    /// An out-of-range compression level is rejected here rather than
    /// silently clamped, so a misconfiguration surfaces at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=9).contains(&self.compress_level) {
            return Err(ConfigError::CompressLevel(self.compress_level));
        }
        if self.max_frame_size < crate::protocol::HEADER_SIZE {
            return Err(ConfigError::FrameSizeTooSmall(self.max_frame_size));
        }
        if self.max_graph_depth == 0 {
            return Err(ConfigError::ZeroGraphDepth);
        }
        Ok(())
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Compression level outside 1-9.
    CompressLevel(u32),
    /// Frame size cap below the protocol header size.
    FrameSizeTooSmall(usize),
    /// A zero class-graph depth would reject every instance.
    ZeroGraphDepth,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::CompressLevel(level) => {
                write!(f, "compression level {} outside 1-9", level)
            }
            ConfigError::FrameSizeTooSmall(size) => {
                write!(f, "max frame size {} below protocol header size", size)
            }
            ConfigError::ZeroGraphDepth => write!(f, "max class-graph depth must be nonzero"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_compress_level_range_rejected() {
        let config = RuntimeConfig {
            compress_level: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CompressLevel(0)));

        let config = RuntimeConfig {
            compress_level: 10,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CompressLevel(10)));

        let config = RuntimeConfig {
            compress_level: 9,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiny_frame_cap_rejected() {
        let config = RuntimeConfig {
            max_frame_size: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FrameSizeTooSmall(8))
        ));
    }
}
