use serde::{Deserialize, Serialize};

use crate::block::MAX_INMEMORY_BLOCK_SIZE;
use crate::encoding::DEFAULT_COMPRESS_LEVEL;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOptions {
    // Number of independently locked ingestion shards
    pub shards: usize,
    // A shard hands its blocks over to merging once it holds this many blocks
    pub max_blocks_per_shard: usize,
    // Size cap of an ingestion block in bytes, also the max item size
    pub max_block_size: usize,
    // Blocks merged together into one in-memory part, also the max parts per compaction
    pub parts_to_merge: usize,
    pub compress_level: i32,
    // Pending items older than this become searchable
    pub flush_interval_ms: u64,
    pub merge_interval_ms: u64,
    pub enable_background_merge: bool,
    // Decoded index blocks cached per part
    pub index_cache_capacity: u64,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_blocks_per_shard: 16,
            max_block_size: MAX_INMEMORY_BLOCK_SIZE,
            parts_to_merge: 15,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            flush_interval_ms: 1000,
            merge_interval_ms: 1000,
            enable_background_merge: true,
            index_cache_capacity: 64,
        }
    }
}

impl TableOptions {
    /// Small blocks and short intervals, so that tests hit flushes and merges quickly.
    pub fn default_for_test() -> Self {
        Self {
            shards: 2,
            max_blocks_per_shard: 4,
            max_block_size: 4096,
            parts_to_merge: 4,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            flush_interval_ms: 50,
            merge_interval_ms: 50,
            enable_background_merge: true,
            index_cache_capacity: 16,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 || self.max_blocks_per_shard == 0 {
            return Err(Error::Validation(format!(
                "shards ({}) and max_blocks_per_shard ({}) must be positive",
                self.shards, self.max_blocks_per_shard
            )));
        }
        if self.max_block_size == 0 || self.max_block_size > MAX_INMEMORY_BLOCK_SIZE {
            return Err(Error::Validation(format!(
                "max_block_size must be in 1..={MAX_INMEMORY_BLOCK_SIZE}; got {}",
                self.max_block_size
            )));
        }
        if self.parts_to_merge < 2 {
            return Err(Error::Validation(format!(
                "parts_to_merge must be at least 2; got {}",
                self.parts_to_merge
            )));
        }
        if self.flush_interval_ms == 0 || self.merge_interval_ms == 0 {
            return Err(Error::Validation(
                "flush and merge intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = TableOptions::default();
        assert!(options.shards >= 1);
        assert_eq!(options.parts_to_merge, 15);
        assert_eq!(options.compress_level, -5);
        options.validate().unwrap();
        TableOptions::default_for_test().validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let mut options = TableOptions::default_for_test();
        options.max_block_size = MAX_INMEMORY_BLOCK_SIZE + 1;
        assert!(options.validate().is_err());
        let mut options = TableOptions::default_for_test();
        options.parts_to_merge = 1;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let options: TableOptions =
            serde_json::from_str(r#"{"shards": 3, "enable_background_merge": false}"#).unwrap();
        assert_eq!(options.shards, 3);
        assert!(!options.enable_background_merge);
        assert_eq!(options.max_blocks_per_shard, 16);
    }
}
