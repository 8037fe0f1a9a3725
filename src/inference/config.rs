//! Decode engine configuration.
//!
//! Holds the device description (SM count) and the per-path tile cost models
//! the tile scheduler balances against. Loadable from YAML or JSON.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tile shape and fixed per-split cost for one execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostModel {
    /// Query rows handled per tile (heads sharing one KV head × query tokens)
    #[serde(default = "default_block_size_m")]
    pub block_size_m: usize,

    /// KV positions (or top-k slots) per tile
    #[serde(default = "default_block_size_n")]
    pub block_size_n: usize,

    /// Fixed cost of starting a split, expressed in KV tiles
    #[serde(default = "default_fixed_overhead")]
    pub fixed_overhead_num_blocks: usize,
}

fn default_block_size_m() -> usize {
    64
}

fn default_block_size_n() -> usize {
    64
}

fn default_fixed_overhead() -> usize {
    5
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            block_size_m: default_block_size_m(),
            block_size_n: default_block_size_n(),
            fixed_overhead_num_blocks: default_fixed_overhead(),
        }
    }
}

impl CostModel {
    fn validate(&self, name: &str) -> Result<()> {
        if self.block_size_m == 0 || self.block_size_n == 0 {
            return Err(Error::Config {
                reason: format!("{name}: block sizes must be > 0"),
            });
        }
        Ok(())
    }

    /// Number of SM partitions the device is carved into for this path.
    ///
    /// Each KV head and each `block_size_m` group of query rows occupies its own
    /// slice of the SMs, so the partition count shrinks as those grow.
    pub fn num_sm_parts(&self, num_sms: usize, num_heads_k: usize, rows_per_head_k: usize) -> usize {
        let m_tiles = rows_per_head_k.div_ceil(self.block_size_m).max(1);
        (num_sms / num_heads_k.max(1) / m_tiles).max(1)
    }
}

/// MLA decode engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlaDecodeConfig {
    /// Streaming multiprocessors available to one decode step
    #[serde(default = "default_num_sms")]
    pub num_sms: usize,

    /// Cost model for the BF16/F32 paged cache
    #[serde(default)]
    pub bf16: CostModel,

    /// Cost model for the 656-byte FP8 paged cache (also used with top-k)
    #[serde(default)]
    pub fp8_kvcache: CostModel,

    /// Cost model for the uniformly FP8 cache of the dense-FP8 variant
    #[serde(default)]
    pub dense_fp8: CostModel,

    /// Run the merge-time consistency check on split log-sum-exp values
    #[serde(default = "default_check_numerics")]
    pub check_numerics: bool,
}

fn default_num_sms() -> usize {
    132
}

fn default_check_numerics() -> bool {
    true
}

impl Default for MlaDecodeConfig {
    fn default() -> Self {
        Self {
            num_sms: default_num_sms(),
            bf16: CostModel::default(),
            fp8_kvcache: CostModel::default(),
            dense_fp8: CostModel::default(),
            check_numerics: default_check_numerics(),
        }
    }
}

impl MlaDecodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_sms == 0 {
            return Err(Error::Config {
                reason: "num_sms must be > 0".into(),
            });
        }
        self.bf16.validate("bf16")?;
        self.fp8_kvcache.validate("fp8_kvcache")?;
        self.dense_fp8.validate("dense_fp8")?;
        Ok(())
    }

    /// Cost model for the paged path, selected by cache encoding.
    pub fn paged_cost_model(&self, is_fp8_kvcache: bool) -> &CostModel {
        if is_fp8_kvcache {
            &self.fp8_kvcache
        } else {
            &self.bf16
        }
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::Config {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}
