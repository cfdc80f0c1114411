use serde::Deserialize;

use crate::engine::errors::CacheError;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Fifo,
    Lru,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Smallest allocatable block, power of two, at least 8.
    pub min_alloc: usize,
    /// Largest allocatable block, power of two, at most `arena_size`.
    pub max_alloc: usize,
    /// Bytes per arena, power of two, divides `total_size`.
    pub arena_size: usize,
    /// Upper bound on outstanding allocated bytes across all arenas.
    pub total_size: usize,
    pub policy_kind: PolicyKind,
    /// Retry budget when a reservation waits on eviction.
    #[serde(default = "default_reserve_attempts")]
    pub reserve_attempts: u32,
    /// Stale-entry sweep interval in milliseconds (0 disables the sweeper).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_reserve_attempts() -> u32 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl CacheConfig {
    /// Construction-time validation; violations prevent startup.
    pub fn validate(&self) -> Result<(), CacheError> {
        let invalid = |msg: String| Err(CacheError::InvalidConfig(msg));

        if !self.min_alloc.is_power_of_two() || self.min_alloc < 8 {
            return invalid(format!(
                "min_alloc must be a power of two >= 8, got {}",
                self.min_alloc
            ));
        }
        if !self.max_alloc.is_power_of_two() || self.max_alloc < self.min_alloc {
            return invalid(format!(
                "max_alloc must be a power of two >= min_alloc, got {}",
                self.max_alloc
            ));
        }
        if !self.arena_size.is_power_of_two() || self.arena_size > (1 << 31) {
            return invalid(format!(
                "arena_size must be a power of two <= 2^31, got {}",
                self.arena_size
            ));
        }
        if self.max_alloc > self.arena_size {
            return invalid(format!(
                "max_alloc {} exceeds arena_size {}",
                self.max_alloc, self.arena_size
            ));
        }
        if self.total_size == 0 || self.total_size % self.arena_size != 0 {
            return invalid(format!(
                "total_size {} must be a non-zero multiple of arena_size {}",
                self.total_size, self.arena_size
            ));
        }
        Ok(())
    }

    pub fn max_arenas(&self) -> usize {
        self.total_size / self.arena_size
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Compression block size: one block is one cache entry, and no block
    /// may decompress to more than this.
    pub buffer_size: usize,
    /// Bounded depth of the decode pipeline queue.
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
}

fn default_pipeline_depth() -> usize {
    16
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives for the subscriber installed by `logging::init`,
    /// e.g. `"info"` or `"stria_db=debug"`.
    pub level: String,
}

use std::env;

pub fn load_settings() -> Result<Settings, config::ConfigError> {
    let config_path = env::var("STRIADB_CONFIG").unwrap_or_else(|_| "config".to_string());

    let settings: Settings = config::Config::builder()
        .add_source(config::File::with_name(&config_path))
        .build()?
        .try_deserialize()?;

    Ok(settings)
}
