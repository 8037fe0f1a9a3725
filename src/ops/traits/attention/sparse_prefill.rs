//! Top-k sparse prefill attention trait

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Single-pass attention where every query row reads a selected set of KV rows.
///
/// # Layout contract
///
/// - `q`: `[s_q, num_heads_q, d_qk]` (F32)
/// - `kv`: `[s_kv, num_heads_kv, d_qk]` (F32); V is `kv[..., :d_v]`
/// - `indices`: `[s_q, num_heads_kv, topk]` (I32) rows of `kv`; `-1` or
///   `>= s_kv` is padding
/// - `num_heads_q` must be a multiple of `num_heads_kv`
pub trait SparsePrefillOps<R: Runtime> {
    /// Returns `(output [s_q, num_heads_q, d_v], max_logits [s_q, num_heads_q],
    /// lse [s_q, num_heads_q])`. Logits are scaled by `sm_scale`; rows without a
    /// valid index get zero output and `-inf` for both statistics.
    fn sparse_prefill_fwd(
        &self,
        q: &Tensor<R>,
        kv: &Tensor<R>,
        indices: &Tensor<R>,
        sm_scale: f32,
        d_v: usize,
    ) -> Result<(Tensor<R>, Tensor<R>, Tensor<R>)>;
}
