//! Split-KV MLA decode attention traits

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Inputs of one split-KV decode step over a paged cache.
///
/// # Layout contract
///
/// - `q`: `[batch, seq_len_q, num_heads_q, head_size]` (F32)
/// - `kcache`: `[num_pages, page_block_size, num_heads_k, head_size]` (F32). When
///   `is_fp8_kvcache` it holds 656-byte rows (U8, see [`crate::quant::fp8`];
///   `head_size` is then 576), either token-major as
///   `[num_pages, page_block_size, num_heads_k, 656]` or head-major as
///   `[num_pages, num_heads_k, page_block_size * 656]`
/// - V is the first `head_size_v` channels of K
/// - `seqlens_k`: `[batch]` (I32)
/// - `block_table`: `[batch, max_num_blocks]` (I32)
/// - `tile_scheduler_metadata`, `num_splits`: output of
///   [`MlaDecodeOps::get_mla_decoding_metadata`] for the same lengths and flags
/// - `indices`: `[batch, seq_len_q, topk]` (I32) token positions, `-1` padded
pub struct MlaDecodeArgs<'a, R: Runtime> {
    pub q: &'a Tensor<R>,
    pub kcache: &'a Tensor<R>,
    pub head_size_v: usize,
    pub seqlens_k: &'a Tensor<R>,
    pub block_table: &'a Tensor<R>,
    pub tile_scheduler_metadata: &'a Tensor<R>,
    pub num_splits: &'a Tensor<R>,
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub is_fp8_kvcache: bool,
    pub indices: Option<&'a Tensor<R>>,
}

/// Multi-head latent attention decode with split-KV load balancing.
///
/// A decode step is two calls: build the scheduling metadata from the KV
/// lengths, then run attention against it. The metadata only depends on the
/// lengths and flags, so it can be built once and reused by every layer of
/// the step.
pub trait MlaDecodeOps<R: Runtime> {
    /// Build tile scheduler metadata.
    ///
    /// Returns `(tile_scheduler_metadata [num_sm_parts, 8], num_splits [batch + 1])`,
    /// both I32. `num_heads_q`, when given, must be a multiple of `num_heads_k`.
    /// With `topk`, every item is scheduled as `topk` index slots instead of its
    /// KV length.
    fn get_mla_decoding_metadata(
        &self,
        seqlens_k: &Tensor<R>,
        num_q_tokens_per_head_k: usize,
        num_heads_k: usize,
        num_heads_q: Option<usize>,
        is_fp8_kvcache: bool,
        topk: Option<usize>,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Run split-KV attention and merge the splits.
    ///
    /// Returns `(output [batch, seq_len_q, num_heads_q, head_size_v],
    /// lse [batch, num_heads_q, seq_len_q])`. Rows that attend to nothing get a
    /// zero output and `lse = -inf`.
    fn fwd_kvcache_mla(&self, args: &MlaDecodeArgs<'_, R>) -> Result<(Tensor<R>, Tensor<R>)>;
}
