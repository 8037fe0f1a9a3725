//! CPU variable-length (ragged) attention
//!
//! Walks the packed buffer sequence by sequence and runs standard attention
//! per (token, head), mapping query heads onto their KV head for GQA.

use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;
use rayon::prelude::*;

use super::mla_decode::{MlaDecodeContext, expect_tensor};
use crate::error::{Error, Result};
use crate::ops::traits::{VarLenAttentionOps, VarLenParams};

/// Key range `[lo, hi)` visible to query `i` of a sequence with `s_q`
/// queries and `s_k` keys.
fn visible_keys(i: usize, s_q: usize, s_k: usize, params: &VarLenParams) -> (usize, usize) {
    // diagonal = i + s_k - s_q, may be negative
    let diag = i as i64 + s_k as i64 - s_q as i64;
    let mut lo = 0i64;
    let mut hi = s_k as i64;
    if params.causal {
        hi = hi.min(diag + 1);
    }
    if params.window > 0 {
        let w = params.window as i64;
        lo = lo.max(diag - w + 1);
        hi = hi.min(diag + w);
    }
    (lo.max(0) as usize, hi.max(lo.max(0)) as usize)
}

fn cu_seqlens(t: &Tensor<CpuRuntime>, arg: &'static str, total: usize) -> Result<Vec<usize>> {
    expect_tensor(t, arg, DType::I32, 1)?;
    let cu = t.contiguous().to_vec::<i32>();
    if cu.first() != Some(&0)
        || cu.windows(2).any(|w| w[0] > w[1])
        || cu.last().map(|&l| l as usize) != Some(total)
    {
        return Err(Error::invalid_argument(
            arg,
            format!("{cu:?} is not a prefix sum from 0 to {total}"),
        ));
    }
    Ok(cu.into_iter().map(|x| x as usize).collect())
}

fn varlen_attention(
    q: &Tensor<CpuRuntime>,
    k: &Tensor<CpuRuntime>,
    v: &Tensor<CpuRuntime>,
    cu_seqlens_q: &Tensor<CpuRuntime>,
    cu_seqlens_k: &Tensor<CpuRuntime>,
    params: &VarLenParams,
) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
    let q_shape = expect_tensor(q, "q", DType::F32, 3)?;
    let k_shape = expect_tensor(k, "k", DType::F32, 3)?;
    let v_shape = expect_tensor(v, "v", DType::F32, 3)?;
    let (total_q, num_heads, d_qk) = (q_shape[0], q_shape[1], q_shape[2]);
    let (total_k, num_heads_k) = (k_shape[0], k_shape[1]);
    let d_v = v_shape[2];

    if k_shape[2] != d_qk || v_shape[0] != total_k || v_shape[1] != num_heads_k {
        return Err(Error::invalid_argument(
            "k",
            format!("k {k_shape:?} / v {v_shape:?} do not match q {q_shape:?}"),
        ));
    }
    if num_heads_k == 0 || num_heads % num_heads_k != 0 {
        return Err(Error::invalid_argument(
            "k",
            format!("{num_heads} query heads cannot be grouped over {num_heads_k} KV heads"),
        ));
    }
    let cu_q = cu_seqlens(cu_seqlens_q, "cu_seqlens_q", total_q)?;
    let cu_k = cu_seqlens(cu_seqlens_k, "cu_seqlens_k", total_k)?;
    if cu_q.len() != cu_k.len() {
        return Err(Error::inconsistent(format!(
            "cu_seqlens_q has {} entries, cu_seqlens_k has {}",
            cu_q.len(),
            cu_k.len()
        )));
    }
    if let Some(b) = (0..cu_q.len() - 1).find(|&b| {
        cu_q[b + 1] - cu_q[b] > params.max_seqlen_q || cu_k[b + 1] - cu_k[b] > params.max_seqlen_k
    }) {
        return Err(Error::invalid_argument(
            "max_seqlen_q",
            format!("sequence {b} exceeds max_seqlen_q/max_seqlen_k"),
        ));
    }

    let q_data = q.contiguous().to_vec::<f32>();
    let k_data = k.contiguous().to_vec::<f32>();
    let v_data = v.contiguous().to_vec::<f32>();
    let scale = params
        .softmax_scale
        .unwrap_or_else(|| (d_qk as f32).sqrt().recip()) as f64;
    let heads_per_k = num_heads / num_heads_k;

    // sequence of every packed query token
    let mut seq_of = vec![0usize; total_q];
    for b in 0..cu_q.len() - 1 {
        seq_of[cu_q[b]..cu_q[b + 1]].fill(b);
    }

    let mut out = vec![0.0f32; total_q * num_heads * d_v];
    let mut lse = vec![f32::NEG_INFINITY; total_q * num_heads];

    out.par_chunks_mut(num_heads * d_v)
        .zip(lse.par_chunks_mut(num_heads))
        .enumerate()
        .for_each(|(tq, (out_t, lse_t))| {
            let b = seq_of[tq];
            let (sq_start, sk_start) = (cu_q[b], cu_k[b]);
            let (s_q, s_k) = (cu_q[b + 1] - sq_start, cu_k[b + 1] - sk_start);
            let (lo, hi) = visible_keys(tq - sq_start, s_q, s_k, params);
            if lo >= hi {
                return;
            }

            let mut scores = vec![0.0f64; hi - lo];
            for h in 0..num_heads {
                let kh = h / heads_per_k;
                let q_row = &q_data[(tq * num_heads + h) * d_qk..][..d_qk];
                for (s, j) in scores.iter_mut().zip(lo..hi) {
                    let k_row = &k_data[((sk_start + j) * num_heads_k + kh) * d_qk..][..d_qk];
                    let dot: f64 = q_row.iter().zip(k_row).map(|(&a, &b)| a as f64 * b as f64).sum();
                    *s = dot * scale;
                }

                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut sum = 0.0f64;
                let mut acc = vec![0.0f64; d_v];
                for (&s, j) in scores.iter().zip(lo..hi) {
                    let w = (s - max).exp();
                    sum += w;
                    let v_row = &v_data[((sk_start + j) * num_heads_k + kh) * d_v..][..d_v];
                    for (a, &x) in acc.iter_mut().zip(v_row) {
                        *a += w * x as f64;
                    }
                }
                for (dst, a) in out_t[h * d_v..(h + 1) * d_v].iter_mut().zip(acc) {
                    *dst = (a / sum) as f32;
                }
                lse_t[h] = (max + sum.ln()) as f32;
            }
        });

    tracing::debug!(
        batch_size = cu_q.len() - 1,
        total_q,
        total_k,
        causal = params.causal,
        window = params.window,
        "varlen attention"
    );

    let device = q.device();
    Ok((
        Tensor::<CpuRuntime>::from_slice(&out, &[total_q, num_heads, d_v], device),
        Tensor::<CpuRuntime>::from_slice(&lse, &[total_q, num_heads], device),
    ))
}

impl VarLenAttentionOps<CpuRuntime> for CpuClient {
    fn varlen_attention_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        cu_seqlens_q: &Tensor<CpuRuntime>,
        cu_seqlens_k: &Tensor<CpuRuntime>,
        params: &VarLenParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        varlen_attention(q, k, v, cu_seqlens_q, cu_seqlens_k, params)
    }
}

impl VarLenAttentionOps<CpuRuntime> for MlaDecodeContext {
    fn varlen_attention_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        k: &Tensor<CpuRuntime>,
        v: &Tensor<CpuRuntime>,
        cu_seqlens_q: &Tensor<CpuRuntime>,
        cu_seqlens_k: &Tensor<CpuRuntime>,
        params: &VarLenParams,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        varlen_attention(q, k, v, cu_seqlens_q, cu_seqlens_k, params)
    }
}
