use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DfuError;

/// Pacing and sizing parameters of a transfer.
///
/// The bootloader gives no per-packet acknowledgement on the data channel, so
/// writes are paced with fixed delays. Every delay is named here so it can be
/// tuned from a TOML file without touching the protocol code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// Largest image object accepted by the bootloader.
    pub max_object_size: usize,
    /// Bytes per write on the data channel.
    pub max_link_chunk_size: usize,
    /// Pause after a create command before streaming object data.
    pub create_settle_ms: u64,
    /// Pause between two link chunks.
    pub link_chunk_delay_ms: u64,
    /// Pause between the init checksum and execute commands.
    pub init_checksum_delay_ms: u64,
    /// Pause after the last link chunk of an image object.
    pub object_complete_delay_ms: u64,
    /// Pause between an image checksum and execute command.
    pub image_checksum_delay_ms: u64,
    /// Pause after an image execute command.
    pub image_execute_delay_ms: u64,
    /// Pause before the final select command.
    pub finalize_delay_ms: u64,
    /// Upper bound on any wait for a response notification.
    pub response_timeout_ms: u64,
    /// Compare checksum reports against locally computed CRC32 values.
    pub verify_checksums: bool,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            max_object_size: 4096,
            max_link_chunk_size: 20,
            create_settle_ms: 500,
            link_chunk_delay_ms: 10,
            init_checksum_delay_ms: 1000,
            object_complete_delay_ms: 500,
            image_checksum_delay_ms: 500,
            image_execute_delay_ms: 500,
            finalize_delay_ms: 500,
            response_timeout_ms: 10_000,
            verify_checksums: true,
        }
    }
}

impl DfuConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DfuError> {
        let content = std::fs::read_to_string(path)?;
        let config: DfuConfig = toml::from_str(&content).map_err(|e| DfuError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DfuError> {
        if self.max_object_size == 0 {
            return Err(DfuError::Config("max_object_size must be non-zero".into()));
        }
        if self.max_link_chunk_size == 0 {
            return Err(DfuError::Config("max_link_chunk_size must be non-zero".into()));
        }
        if self.max_link_chunk_size > self.max_object_size {
            return Err(DfuError::Config(format!(
                "max_link_chunk_size ({}) exceeds max_object_size ({})",
                self.max_link_chunk_size, self.max_object_size
            )));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Shorthand used by the engine for the `*_ms` fields.
pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
