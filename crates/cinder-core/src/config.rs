//! Engine configuration and the string parsers the outer server layers
//! feed it from ("100M", "allkeys-lru", "write-back").

use crate::evict::EvictionPolicy;

/// Whether writes reach the storage provider inline or from the
/// periodic flush worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryModel {
    /// Serialise every write into the provider as it happens.
    #[default]
    WriteThrough,
    /// Collect dirty keys and flush them once per flush period.
    WriteBack,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of logical databases.
    pub databases: usize,
    /// Memory cap in bytes across the engine. `None` means unlimited.
    pub max_memory: Option<usize>,
    /// Storage footprint cap in bytes. `None` means unlimited.
    pub max_storage: Option<usize>,
    /// What to do when the memory cap is hit.
    pub eviction_policy: EvictionPolicy,
    /// Keys sampled per eviction round.
    pub maxmemory_samples: usize,
    /// Periodic driver rate, ticks per second.
    pub hz: u32,
    /// Write policy toward the storage provider.
    pub memory_model: MemoryModel,
    /// Minimum interval between write-back flushes.
    pub storage_flush_period_ms: u64,
    /// How long a snapshot may lag the live database before the driver
    /// starts collapsing released levels.
    pub snapshot_slip_ms: u64,
    /// LFU increment damping factor.
    pub lfu_log_factor: u8,
    /// Minutes per LFU decay period.
    pub lfu_decay_time_min: u64,
    /// Replica mode: expired keys read as absent but are only deleted
    /// when the primary says so.
    pub replica: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            databases: 16,
            max_memory: None,
            max_storage: None,
            eviction_policy: EvictionPolicy::default(),
            maxmemory_samples: 5,
            hz: 10,
            memory_model: MemoryModel::default(),
            storage_flush_period_ms: 500,
            snapshot_slip_ms: 500,
            lfu_log_factor: 10,
            lfu_decay_time_min: 1,
            replica: false,
        }
    }
}

/// The slice of configuration one database needs.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub index: usize,
    pub max_memory: Option<usize>,
    pub eviction_policy: EvictionPolicy,
    pub maxmemory_samples: usize,
    pub memory_model: MemoryModel,
    pub lfu_log_factor: u8,
    pub lfu_decay_time_min: u64,
    pub replica: bool,
}

impl Config {
    /// Derives the per-database configuration for database `index`.
    /// The memory cap is divided evenly; rounding down is conservative.
    pub fn db_config(&self, index: usize) -> DbConfig {
        DbConfig {
            index,
            max_memory: self.max_memory.map(|total| total / self.databases.max(1)),
            eviction_policy: self.eviction_policy,
            maxmemory_samples: self.maxmemory_samples,
            memory_model: self.memory_model,
            lfu_log_factor: self.lfu_log_factor,
            lfu_decay_time_min: self.lfu_decay_time_min,
            replica: self.replica,
        }
    }
}

/// Parses a human-readable byte size ("1024", "100K", "50M", "2G").
/// Case insensitive; plain numbers are bytes.
pub fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty byte size string".into());
    }

    let upper = input.to_ascii_uppercase();
    let (num_str, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, 1024)
    } else {
        (upper.as_str(), 1)
    };

    let num: usize = num_str
        .parse()
        .map_err(|_| format!("invalid byte size: '{input}'"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: '{input}'"))
}

/// Parses an eviction policy name.
pub fn parse_eviction_policy(input: &str) -> Result<EvictionPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "noeviction" => Ok(EvictionPolicy::NoEviction),
        "allkeys-lru" => Ok(EvictionPolicy::AllKeysLru),
        "allkeys-lfu" => Ok(EvictionPolicy::AllKeysLfu),
        "allkeys-random" => Ok(EvictionPolicy::AllKeysRandom),
        "volatile-lru" => Ok(EvictionPolicy::VolatileLru),
        "volatile-lfu" => Ok(EvictionPolicy::VolatileLfu),
        "volatile-random" => Ok(EvictionPolicy::VolatileRandom),
        "volatile-ttl" => Ok(EvictionPolicy::VolatileTtl),
        _ => Err(format!(
            "unknown eviction policy '{input}'. valid options: noeviction, \
             allkeys-lru, allkeys-lfu, allkeys-random, volatile-lru, \
             volatile-lfu, volatile-random, volatile-ttl"
        )),
    }
}

/// Parses a memory-model name.
pub fn parse_memory_model(input: &str) -> Result<MemoryModel, String> {
    match input.to_ascii_lowercase().as_str() {
        "write-through" | "writethrough" => Ok(MemoryModel::WriteThrough),
        "write-back" | "writeback" => Ok(MemoryModel::WriteBack),
        _ => Err(format!(
            "unknown memory model '{input}'. valid options: write-through, write-back"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parse_suffixes() {
        assert_eq!(parse_byte_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("100kb").unwrap(), 100 * 1024);
        assert_eq!(parse_byte_size("50M").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_byte_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("12X").is_err());
        assert!(parse_byte_size("K").is_err());
    }

    #[test]
    fn parse_policies() {
        assert_eq!(
            parse_eviction_policy("allkeys-LRU").unwrap(),
            EvictionPolicy::AllKeysLru
        );
        assert_eq!(
            parse_eviction_policy("volatile-ttl").unwrap(),
            EvictionPolicy::VolatileTtl
        );
        assert!(parse_eviction_policy("nonsense").is_err());
    }

    #[test]
    fn parse_models() {
        assert_eq!(
            parse_memory_model("write-back").unwrap(),
            MemoryModel::WriteBack
        );
        assert_eq!(
            parse_memory_model("WRITETHROUGH").unwrap(),
            MemoryModel::WriteThrough
        );
        assert!(parse_memory_model("sometimes").is_err());
    }

    #[test]
    fn db_config_divides_memory() {
        let config = Config {
            max_memory: Some(1600),
            databases: 16,
            ..Config::default()
        };
        assert_eq!(config.db_config(0).max_memory, Some(100));
    }
}
