//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Minimum SSH channel packet size recommended by RFC 4254.
const MIN_PACKET_SIZE: u32 = 32768;

/// SFTP session configuration.
///
/// Paths are exchanged as UTF-8; servers using another encoding are not
/// supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout applied to each request/response round trip, in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Write buffer size for remote file streams
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Maximum number of in-flight read-ahead requests per file
    #[serde(default = "default_max_pending_reads")]
    pub max_pending_reads: usize,

    /// Maximum packet size we accept on the channel (RFC 4254 recommends
    /// 32768 bytes minimum)
    #[serde(default = "default_packet_size")]
    pub local_max_packet_size: u32,

    /// Maximum packet size the remote side accepts on the channel
    #[serde(default = "default_packet_size")]
    pub remote_max_packet_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout(),
            write_buffer_size: default_write_buffer_size(),
            max_pending_reads: default_max_pending_reads(),
            local_max_packet_size: default_packet_size(),
            remote_max_packet_size: default_packet_size(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.operation_timeout_secs == 0 {
            return Err(crate::Error::argument(
                "operation_timeout_secs",
                "operation timeout must be non-zero",
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(crate::Error::argument(
                "write_buffer_size",
                "write buffer size must be non-zero",
            ));
        }
        if self.max_pending_reads == 0 {
            return Err(crate::Error::argument(
                "max_pending_reads",
                "at least one in-flight read is required",
            ));
        }
        if self.local_max_packet_size < MIN_PACKET_SIZE
            || self.remote_max_packet_size < MIN_PACKET_SIZE
        {
            return Err(crate::Error::argument(
                "packet_size",
                format!(
                    "packet size below the RFC 4254 minimum of {} bytes",
                    MIN_PACKET_SIZE
                ),
            ));
        }
        Ok(())
    }

    /// The per-operation timeout as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_write_buffer_size() -> usize {
    32 * 1024
}

fn default_max_pending_reads() -> usize {
    10
}

fn default_packet_size() -> u32 {
    MIN_PACKET_SIZE
}
