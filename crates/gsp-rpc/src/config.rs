use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::layout::{SharedLayout, GSP_PAGE_SIZE, MAX_ELEMENT_SLOTS};

/// Transport tunables.
///
/// Every field has a default, so a JSON document only needs the keys it
/// changes. `GSP_RPC_*` environment variables override either source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Page size, which is also the minimum element size.
    pub page_size: usize,
    /// Command queue bytes, header page included.
    pub cmd_queue_bytes: usize,
    /// Status queue bytes, header page included.
    pub status_queue_bytes: usize,
    /// Upper bound on one element; `0` means the largest the layout allows.
    pub max_element_bytes: usize,
    /// Per-call response deadline.
    pub timeout_ms: u64,
    pub encryption: bool,
    /// Log expected send/poll failures at debug level.
    pub quiet: bool,
    pub meter: bool,
    pub hibernation: HibernationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HibernationConfig {
    /// Shared circular buffer size in bytes, header excluded.
    pub buffer_bytes: usize,
    pub staging_initial_bytes: usize,
    pub staging_max_bytes: usize,
    pub timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            page_size: GSP_PAGE_SIZE,
            cmd_queue_bytes: 0x40000,
            status_queue_bytes: 0x40000,
            max_element_bytes: 0,
            timeout_ms: 4000,
            encryption: false,
            quiet: false,
            meter: false,
            hibernation: HibernationConfig::default(),
        }
    }
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 0x10000,
            staging_initial_bytes: 1 << 20,
            staging_max_bytes: 256 << 20,
            timeout_ms: 4000,
        }
    }
}

impl TransportConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `GSP_RPC_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        override_num(&lookup, "GSP_RPC_PAGE_SIZE", &mut self.page_size)?;
        override_num(&lookup, "GSP_RPC_CMD_QUEUE_BYTES", &mut self.cmd_queue_bytes)?;
        override_num(&lookup, "GSP_RPC_STATUS_QUEUE_BYTES", &mut self.status_queue_bytes)?;
        override_num(&lookup, "GSP_RPC_MAX_ELEMENT_BYTES", &mut self.max_element_bytes)?;
        override_num(&lookup, "GSP_RPC_TIMEOUT_MS", &mut self.timeout_ms)?;
        override_bool(&lookup, "GSP_RPC_ENCRYPTION", &mut self.encryption)?;
        override_bool(&lookup, "GSP_RPC_QUIET", &mut self.quiet)?;
        override_bool(&lookup, "GSP_RPC_METER", &mut self.meter)?;
        let hib = &mut self.hibernation;
        override_num(&lookup, "GSP_RPC_HIBERNATION_BUFFER_BYTES", &mut hib.buffer_bytes)?;
        override_num(&lookup, "GSP_RPC_HIBERNATION_STAGING_INITIAL", &mut hib.staging_initial_bytes)?;
        override_num(&lookup, "GSP_RPC_HIBERNATION_STAGING_MAX", &mut hib.staging_max_bytes)?;
        override_num(&lookup, "GSP_RPC_HIBERNATION_TIMEOUT_MS", &mut hib.timeout_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = self.layout()?;
        if self.max_element_bytes != 0 {
            if self.max_element_bytes % self.page_size != 0 {
                return Err(ConfigError::Invalid("max element size must be a multiple of the page size"));
            }
            if self.max_element_bytes > layout.max_element_bytes() {
                return Err(ConfigError::Invalid("max element size exceeds what the queues can hold"));
            }
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout must be non-zero"));
        }
        let hib = &self.hibernation;
        if hib.buffer_bytes < 2 {
            return Err(ConfigError::Invalid("hibernation buffer needs at least two bytes"));
        }
        if hib.buffer_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid("hibernation buffer too large"));
        }
        if hib.staging_initial_bytes == 0 || hib.staging_initial_bytes > hib.staging_max_bytes {
            return Err(ConfigError::Invalid("hibernation staging sizes out of order"));
        }
        if hib.timeout_ms == 0 {
            return Err(ConfigError::Invalid("hibernation timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn layout(&self) -> Result<SharedLayout, ConfigError> {
        SharedLayout::new(self.page_size, self.cmd_queue_bytes, self.status_queue_bytes)
    }

    /// Record capacity used to split large messages.
    pub fn max_record_bytes(&self) -> Result<usize, ConfigError> {
        let layout = self.layout()?;
        Ok(match self.max_element_bytes {
            0 => layout.max_record_bytes(),
            n => n.min(MAX_ELEMENT_SLOTS * self.page_size) - crate::layout::MsgElementHeader::SIZE_BYTES,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HibernationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn override_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(());
    };
    let trimmed = value.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| v.to_string().parse().ok()),
        None => trimmed.parse().ok(),
    };
    *slot = parsed.ok_or(ConfigError::InvalidValue { key, value })?;
    Ok(())
}

fn override_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut bool,
) -> Result<(), ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(());
    };
    *slot = match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(ConfigError::InvalidValue { key, value }),
    };
    Ok(())
}
