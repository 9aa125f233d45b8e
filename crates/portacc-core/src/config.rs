//! Runtime configuration.
//!
//! Values come from, in order of precedence: explicit construction,
//! [`RuntimeConfig::from_json_str`], and the `PORTACC_*` environment
//! variables read by [`RuntimeConfig::from_env`]. [`RuntimeConfig::global`]
//! is initialised once from the environment on first use.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a queue does when a backend operation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the fault and abort the process.
    #[default]
    Abort,
    /// Return the fault to the caller and mark the queue as faulted.
    Propagate,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "propagate" | "error" => Ok(Self::Propagate),
            other => Err(Error::invalid_config(
                "PORTACC_FAILURE_POLICY",
                format!("expected `abort` or `propagate`, got `{other}`"),
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => f.write_str("abort"),
            FailurePolicy::Propagate => f.write_str("propagate"),
        }
    }
}

/// Process-wide runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default failure policy for new queues.
    pub failure_policy: FailurePolicy,
    /// Number of logical devices exposed by the emulated GPU runtime.
    pub emu_device_count: usize,
    /// Row pitch alignment of pitched emulated allocations, in bytes.
    pub emu_pitch_alignment: usize,
    /// Threads per block on emulated devices.
    pub emu_max_threads_per_block: usize,
    /// Block-shared memory per block on emulated devices, in bytes.
    pub emu_shared_mem_bytes: usize,
    /// Global memory per emulated device, in bytes.
    pub emu_global_mem_bytes: usize,
    /// Threads per block for `AccCpuThreads`; `None` derives it from the host.
    pub cpu_threads_max_block_threads: Option<usize>,
    /// Block-shared memory per block on CPU accelerators, in bytes.
    pub cpu_shared_mem_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Abort,
            emu_device_count: 2,
            emu_pitch_alignment: 256,
            emu_max_threads_per_block: 1024,
            emu_shared_mem_bytes: 48 * 1024,
            emu_global_mem_bytes: 1 << 30,
            cpu_threads_max_block_threads: None,
            cpu_shared_mem_bytes: 64 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the environment on top of the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `PORTACC_FAILURE_POLICY` - `abort` (default) or `propagate`
    /// - `PORTACC_EMU_DEVICES` - emulated device count
    /// - `PORTACC_EMU_PITCH_ALIGN` - pitch alignment in bytes (power of two)
    /// - `PORTACC_EMU_MAX_THREADS_PER_BLOCK` - emulated threads per block
    /// - `PORTACC_EMU_SHARED_MEM_BYTES` - emulated shared memory per block
    /// - `PORTACC_CPU_THREADS_MAX_BLOCK_THREADS` - `AccCpuThreads` threads per block
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(policy) = env::var("PORTACC_FAILURE_POLICY") {
            config.failure_policy = policy.parse()?;
        }
        if let Some(count) = env_usize("PORTACC_EMU_DEVICES")? {
            config.emu_device_count = count;
        }
        if let Some(align) = env_usize("PORTACC_EMU_PITCH_ALIGN")? {
            config.emu_pitch_alignment = align;
        }
        if let Some(threads) = env_usize("PORTACC_EMU_MAX_THREADS_PER_BLOCK")? {
            config.emu_max_threads_per_block = threads;
        }
        if let Some(bytes) = env_usize("PORTACC_EMU_SHARED_MEM_BYTES")? {
            config.emu_shared_mem_bytes = bytes;
        }
        if let Some(threads) = env_usize("PORTACC_CPU_THREADS_MAX_BLOCK_THREADS")? {
            config.cpu_threads_max_block_threads = Some(threads);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.emu_pitch_alignment.is_power_of_two() {
            return Err(Error::invalid_config(
                "emu_pitch_alignment",
                format!("{} is not a power of two", self.emu_pitch_alignment),
            ));
        }
        if self.emu_max_threads_per_block == 0 {
            return Err(Error::invalid_config("emu_max_threads_per_block", "must be positive"));
        }
        if self.cpu_threads_max_block_threads == Some(0) {
            return Err(Error::invalid_config("cpu_threads_max_block_threads", "must be positive"));
        }
        Ok(())
    }

    /// Threads per block for `AccCpuThreads`.
    pub fn cpu_block_threads(&self) -> usize {
        self.cpu_threads_max_block_threads.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            (cores * 4).clamp(1, 64)
        })
    }

    /// The process-wide configuration.
    ///
    /// Initialised from the environment on first use; an invalid environment
    /// logs a warning and falls back to the defaults.
    pub fn global() -> &'static RuntimeConfig {
        static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Self::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "ignoring invalid runtime configuration from environment");
                Self::default()
            })
        })
    }
}

fn env_usize(key: &'static str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|err| Error::invalid_config(key, err.to_string())),
        Err(_) => Ok(None),
    }
}
