use std::env;

use log::warn;

pub const LRU_LIMIT_ENV: &str = "SMALL_STORE_LRU_LIMIT";

/// Tunables of the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Number of cached entries above which unreferenced clean entries
    /// are evicted from the LRU tail.
    pub lru_limit: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        // 16 MiB with 16 KiB pages
        Self { lru_limit: 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub buffer_pool: BufferPoolConfig,
}

impl EngineConfig {
    pub fn with_lru_limit(lru_limit: usize) -> Self {
        Self {
            buffer_pool: BufferPoolConfig { lru_limit },
        }
    }

    /// Default configuration, with `lru_limit` taken from
    /// `SMALL_STORE_LRU_LIMIT` when it is set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = env::var(LRU_LIMIT_ENV) {
            match value.parse::<usize>() {
                Ok(limit) if limit > 0 => config.buffer_pool.lru_limit = limit,
                _ => warn!("ignore invalid {}: {:?}", LRU_LIMIT_ENV, value),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_limit_from_env() {
        env::set_var(LRU_LIMIT_ENV, "32");
        assert_eq!(32, EngineConfig::from_env().buffer_pool.lru_limit);

        env::set_var(LRU_LIMIT_ENV, "zero");
        assert_eq!(1024, EngineConfig::from_env().buffer_pool.lru_limit);

        env::remove_var(LRU_LIMIT_ENV);
        assert_eq!(EngineConfig::default().buffer_pool, EngineConfig::from_env().buffer_pool);
    }
}
