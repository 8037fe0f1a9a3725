//! Validated shape parameters shared by the decode paths

use crate::error::{Error, Result};

/// Shapes and flags of one decode step, checked once at entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeParams {
    pub batch_size: usize,
    pub seq_len_q: usize,
    pub num_heads_q: usize,
    pub num_heads_k: usize,
    /// K width
    pub head_size: usize,
    /// V width, a prefix of K
    pub head_size_v: usize,
    pub num_pages: usize,
    pub page_block_size: usize,
    /// Block table row width
    pub max_num_blocks: usize,
    /// Tile width the metadata was built with
    pub block_size_n: usize,
    pub softmax_scale: f32,
    pub is_causal: bool,
}

impl DecodeParams {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid_argument("q", "batch is empty"));
        }
        if self.seq_len_q == 0 {
            return Err(Error::invalid_argument("q", "seq_len_q must be > 0"));
        }
        if self.num_heads_k == 0 || self.num_heads_q % self.num_heads_k != 0 {
            return Err(Error::invalid_argument(
                "num_heads_k",
                format!(
                    "{} query heads cannot be grouped over {} KV heads",
                    self.num_heads_q, self.num_heads_k
                ),
            ));
        }
        if self.head_size_v == 0 || self.head_size_v > self.head_size {
            return Err(Error::invalid_argument(
                "head_size_v",
                format!("must be in 1..={}, got {}", self.head_size, self.head_size_v),
            ));
        }
        if self.page_block_size == 0 || self.block_size_n == 0 {
            return Err(Error::invalid_argument(
                "kcache",
                "page and tile sizes must be > 0",
            ));
        }
        if !self.softmax_scale.is_finite() {
            return Err(Error::invalid_argument(
                "softmax_scale",
                format!("must be finite, got {}", self.softmax_scale),
            ));
        }
        Ok(())
    }

    /// Query heads sharing one KV head
    pub fn q_heads_per_k(&self) -> usize {
        self.num_heads_q / self.num_heads_k
    }

    /// Query rows per batch item (`seq_len_q * num_heads_q`)
    pub fn rows(&self) -> usize {
        self.seq_len_q * self.num_heads_q
    }
}

/// Per-batch FP8 descale factors
#[derive(Debug, Clone, PartialEq)]
pub struct Descale {
    pub q: Vec<f32>,
    pub k: Vec<f32>,
}

impl Descale {
    /// Pair up the descale vectors of an FP8 step; both are required.
    pub fn pair(q: Option<Vec<f32>>, k: Option<Vec<f32>>, batch_size: usize) -> Result<Self> {
        match (q, k) {
            (Some(q), Some(k)) => {
                if q.len() != batch_size || k.len() != batch_size {
                    return Err(Error::invalid_argument(
                        "descale_q",
                        format!(
                            "descale factors must have {batch_size} entries, got {} and {}",
                            q.len(),
                            k.len()
                        ),
                    ));
                }
                if let Some(bad) = q.iter().chain(&k).find(|d| !d.is_finite() || **d <= 0.0) {
                    return Err(Error::invalid_argument(
                        "descale_q",
                        format!("descale factors must be finite and positive, got {bad}"),
                    ));
                }
                Ok(Self { q, k })
            }
            (None, None) => Err(Error::inconsistent(
                "fp8 decode needs descale_q and descale_k",
            )),
            _ => Err(Error::inconsistent(
                "descale_q and descale_k must be given together",
            )),
        }
    }

}

/// Dense FP8 decode parameters: the common shapes plus the FP8 extras.
#[derive(Debug, Clone, PartialEq)]
pub struct Fp8DecodeParams {
    pub base: DecodeParams,
    pub h_h_k_ratio: usize,
    pub descale: Descale,
}

impl Fp8DecodeParams {
    pub fn new(base: DecodeParams, descale: Descale) -> Result<Self> {
        base.validate()?;
        if descale.q.len() != base.batch_size || descale.k.len() != base.batch_size {
            return Err(Error::invalid_argument(
                "descale_q",
                format!("descale factors must have {} entries", base.batch_size),
            ));
        }
        Ok(Self {
            h_h_k_ratio: base.q_heads_per_k(),
            base,
            descale,
        })
    }
}
