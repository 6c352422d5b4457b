//! Platform configuration.
//!
//! Loaded from TOML. Every field has a default so an empty document is a valid
//! single-core host platform.

use crate::error::{Error, Result};
use crate::invariant_ppt::{assert_invariant, CONFIG_VALID};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a DP thread is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DpWake {
    /// Counting semaphore, kernel-mode threads.
    #[default]
    Semaphore,
    /// Event bits, userspace-isolated threads.
    Event,
}

/// Static description of the simulated DSP platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Number of DSP cores.
    pub cores: usize,
    /// Timer ticks per millisecond at boot frequency.
    pub ticks_per_msec: u64,
    /// LL tick period in microseconds.
    pub ll_period_us: u64,
    /// Width of the LL pending window in microseconds.
    pub ll_window_us: u64,
    /// DP thread wake primitive.
    pub dp_wake: DpWake,
    /// Largest configuration blob a module may receive.
    pub max_config_blob: usize,
    /// System zone budget in bytes.
    pub system_zone: usize,
    /// Runtime zone budget in bytes (task private data, module state).
    pub runtime_zone: usize,
    /// Buffer zone budget in bytes (audio buffers, staging).
    pub buffer_zone: usize,
    /// Number of DMA channels on the host gateway controller.
    pub dma_channels: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            cores: 1,
            ticks_per_msec: 1000,
            ll_period_us: 1000,
            ll_window_us: 2000,
            dp_wake: DpWake::Semaphore,
            max_config_blob: 4096,
            system_zone: 64 * 1024,
            runtime_zone: 256 * 1024,
            buffer_zone: 1024 * 1024,
            dma_channels: 8,
        }
    }
}

impl PlatformConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PlatformConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject configurations the schedulers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(Error::Config("cores must be at least 1".into()));
        }
        if self.ticks_per_msec == 0 {
            return Err(Error::Config("ticks_per_msec must be non-zero".into()));
        }
        if self.ll_period_us == 0 {
            return Err(Error::Config("ll_period_us must be non-zero".into()));
        }
        if self.ll_window_us < self.ll_period_us {
            return Err(Error::Config(
                "ll_window_us must cover at least one period".into(),
            ));
        }
        assert_invariant(CONFIG_VALID, self.ll_window_us >= self.ll_period_us, "platform config validated", None);
        Ok(())
    }

    /// Set the core count.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    /// Set the timer rate.
    pub fn with_ticks_per_msec(mut self, tpm: u64) -> Self {
        self.ticks_per_msec = tpm;
        self
    }

    /// Set the runtime zone budget.
    pub fn with_runtime_zone(mut self, bytes: usize) -> Self {
        self.runtime_zone = bytes;
        self
    }

    /// Set the buffer zone budget.
    pub fn with_buffer_zone(mut self, bytes: usize) -> Self {
        self.buffer_zone = bytes;
        self
    }

    /// Set the DP wake primitive.
    pub fn with_dp_wake(mut self, wake: DpWake) -> Self {
        self.dp_wake = wake;
        self
    }

    /// LL period in timer ticks.
    pub fn ll_period_ticks(&self) -> u64 {
        self.ticks_per_msec * self.ll_period_us / 1000
    }
}
