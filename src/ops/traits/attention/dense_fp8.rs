//! Dense FP8 MLA decode traits

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Inputs of a decode step whose Q and KV cache are uniformly E4M3.
///
/// - `q`: `[batch, seq_len_q, num_heads_q, head_size]` (U8, E4M3)
/// - `kcache`: `[num_pages, page_block_size, num_heads_k, head_size]` (U8, E4M3)
/// - `descale_q`, `descale_k`: `[batch]` (F32), both required; a missing one is `Inconsistent`
///
/// Other fields as in [`super::MlaDecodeArgs`]. There is no sparse path.
pub struct DenseFp8DecodeArgs<'a, R: Runtime> {
    pub q: &'a Tensor<R>,
    pub kcache: &'a Tensor<R>,
    pub head_size_v: usize,
    pub seqlens_k: &'a Tensor<R>,
    pub block_table: &'a Tensor<R>,
    pub tile_scheduler_metadata: &'a Tensor<R>,
    pub num_splits: &'a Tensor<R>,
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub descale_q: Option<&'a Tensor<R>>,
    pub descale_k: Option<&'a Tensor<R>>,
}

/// MLA decode over a dense FP8 cache with grouped query heads.
pub trait MlaDenseFp8Ops<R: Runtime> {
    /// Metadata for [`MlaDenseFp8Ops::fwd_kvcache_mla_fp8`], built with the
    /// dense-FP8 cost model.
    fn get_mla_decoding_metadata_dense_fp8(
        &self,
        seqlens_k: &Tensor<R>,
        num_heads_per_head_k: usize,
        num_heads_k: usize,
    ) -> Result<(Tensor<R>, Tensor<R>)>;

    /// Returns `(output [batch, seq_len_q, num_heads_q, head_size_v],
    /// lse [batch, num_heads_q, seq_len_q])`.
    fn fwd_kvcache_mla_fp8(&self, args: &DenseFp8DecodeArgs<'_, R>)
    -> Result<(Tensor<R>, Tensor<R>)>;
}
