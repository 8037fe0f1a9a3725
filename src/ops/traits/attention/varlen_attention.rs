//! Variable-length (ragged/packed) attention traits

use crate::error::Result;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Shape and masking parameters of a packed attention call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarLenParams {
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    /// Defaults to `1 / sqrt(d_qk)`
    pub softmax_scale: Option<f32>,
    /// Bottom-right aligned causal mask
    pub causal: bool,
    /// Sliding window width, `0` disables
    pub window: usize,
}

/// Variable-length attention over packed sequences with cu_seqlens indexing
///
/// # Layout contract
///
/// - `q`: `[total_tokens_q, num_heads, d_qk]`: packed queries
/// - `k`: `[total_tokens_k, num_heads_k, d_qk]`: packed keys
/// - `v`: `[total_tokens_k, num_heads_k, d_v]`: packed values
/// - `cu_seqlens_q`: `[batch_size + 1]`: cumulative query sequence lengths (I32)
/// - `cu_seqlens_k`: `[batch_size + 1]`: cumulative key sequence lengths (I32)
/// - Output: `[total_tokens_q, num_heads, d_v]`
/// - Logsumexp: `[total_tokens_q, num_heads]` (F32)
///
/// `num_heads` must be a multiple of `num_heads_k`.
///
/// # Masking
///
/// With `s_q`/`s_k` the lengths of one sequence, query `i` may see key `j` when
/// `j <= i + s_k - s_q` (causal) and, for a window `w > 0`,
/// `i + s_k - s_q - w < j <= i + s_k - s_q + w - 1`.
pub trait VarLenAttentionOps<R: Runtime> {
    /// Returns `(output, logsumexp)`.
    fn varlen_attention_fwd(
        &self,
        q: &Tensor<R>,
        k: &Tensor<R>,
        v: &Tensor<R>,
        cu_seqlens_q: &Tensor<R>,
        cu_seqlens_k: &Tensor<R>,
        params: &VarLenParams,
    ) -> Result<(Tensor<R>, Tensor<R>)>;
}
