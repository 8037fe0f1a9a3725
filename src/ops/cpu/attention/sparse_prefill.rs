//! CPU implementation of SparsePrefillOps

use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;
use rayon::prelude::*;

use super::mla_decode::{MlaDecodeContext, expect_tensor};
use crate::error::{Error, Result};
use crate::ops::traits::SparsePrefillOps;

fn sparse_prefill(
    q: &Tensor<CpuRuntime>,
    kv: &Tensor<CpuRuntime>,
    indices: &Tensor<CpuRuntime>,
    sm_scale: f32,
    d_v: usize,
) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
    let q_shape = expect_tensor(q, "q", DType::F32, 3)?;
    let kv_shape = expect_tensor(kv, "kv", DType::F32, 3)?;
    let idx_shape = expect_tensor(indices, "indices", DType::I32, 3)?;
    let (s_q, h_q, d_qk) = (q_shape[0], q_shape[1], q_shape[2]);
    let (s_kv, h_kv) = (kv_shape[0], kv_shape[1]);
    let topk = idx_shape[2];

    if kv_shape[2] != d_qk {
        return Err(Error::invalid_argument(
            "kv",
            format!("head size {} differs from q's {d_qk}", kv_shape[2]),
        ));
    }
    if h_kv == 0 || h_q % h_kv != 0 {
        return Err(Error::invalid_argument(
            "kv",
            format!("{h_q} query heads cannot be grouped over {h_kv} KV heads"),
        ));
    }
    if idx_shape[0] != s_q || idx_shape[1] != h_kv {
        return Err(Error::inconsistent(format!(
            "indices {idx_shape:?} do not match [{s_q}, {h_kv}, topk]"
        )));
    }
    if d_v == 0 || d_v > d_qk {
        return Err(Error::invalid_argument(
            "d_v",
            format!("must be in 1..={d_qk}, got {d_v}"),
        ));
    }

    let q_data = q.contiguous().to_vec::<f32>();
    let kv_data = kv.contiguous().to_vec::<f32>();
    let idx = indices.contiguous().to_vec::<i32>();
    let heads_per_kv = h_q / h_kv;
    let scale = sm_scale as f64;

    let mut out = vec![0.0f32; s_q * h_q * d_v];
    let mut max_logits = vec![f32::NEG_INFINITY; s_q * h_q];
    let mut lse = vec![f32::NEG_INFINITY; s_q * h_q];

    out.par_chunks_mut(h_q * d_v)
        .zip(max_logits.par_chunks_mut(h_q))
        .zip(lse.par_chunks_mut(h_q))
        .enumerate()
        .for_each(|(i, ((out_i, max_i), lse_i))| {
            let mut scores = Vec::with_capacity(topk);
            let mut rows = Vec::with_capacity(topk);
            for h in 0..h_q {
                let kvh = h / heads_per_kv;
                let q_row = &q_data[(i * h_q + h) * d_qk..][..d_qk];
                let slots = &idx[(i * h_kv + kvh) * topk..][..topk];

                scores.clear();
                rows.clear();
                for &t in slots {
                    if t < 0 || t as usize >= s_kv {
                        continue;
                    }
                    let k_row = &kv_data[(t as usize * h_kv + kvh) * d_qk..][..d_qk];
                    let s: f64 = q_row.iter().zip(k_row).map(|(&a, &b)| a as f64 * b as f64).sum();
                    scores.push(s * scale);
                    rows.push(k_row);
                }
                if scores.is_empty() {
                    continue;
                }

                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut sum = 0.0f64;
                let mut acc = vec![0.0f64; d_v];
                for (&s, k_row) in scores.iter().zip(&rows) {
                    let w = (s - max).exp();
                    sum += w;
                    for (a, &v) in acc.iter_mut().zip(&k_row[..d_v]) {
                        *a += w * v as f64;
                    }
                }
                for (dst, a) in out_i[h * d_v..(h + 1) * d_v].iter_mut().zip(acc) {
                    *dst = (a / sum) as f32;
                }
                max_i[h] = max as f32;
                lse_i[h] = (max + sum.ln()) as f32;
            }
        });

    tracing::debug!(s_q, s_kv, h_q, topk, "sparse prefill");

    let device = q.device();
    Ok((
        Tensor::<CpuRuntime>::from_slice(&out, &[s_q, h_q, d_v], device),
        Tensor::<CpuRuntime>::from_slice(&max_logits, &[s_q, h_q], device),
        Tensor::<CpuRuntime>::from_slice(&lse, &[s_q, h_q], device),
    ))
}

impl SparsePrefillOps<CpuRuntime> for MlaDecodeContext {
    fn sparse_prefill_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        kv: &Tensor<CpuRuntime>,
        indices: &Tensor<CpuRuntime>,
        sm_scale: f32,
        d_v: usize,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        sparse_prefill(q, kv, indices, sm_scale, d_v)
    }
}

impl SparsePrefillOps<CpuRuntime> for CpuClient {
    fn sparse_prefill_fwd(
        &self,
        q: &Tensor<CpuRuntime>,
        kv: &Tensor<CpuRuntime>,
        indices: &Tensor<CpuRuntime>,
        sm_scale: f32,
        d_v: usize,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        sparse_prefill(q, kv, indices, sm_scale, d_v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;

    #[test]
    fn test_single_index_copies_value() {
        let (client, device) = cpu_setup();
        // s_q=1, h_q=2, d=4; kv: 3 rows, one head
        let q = Tensor::<CpuRuntime>::from_slice(&[0.5f32; 8], &[1, 2, 4], &device);
        let kv_data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let kv = Tensor::<CpuRuntime>::from_slice(&kv_data, &[3, 1, 4], &device);
        let idx = Tensor::<CpuRuntime>::from_slice(&[2i32, -1, 7], &[1, 1, 3], &device);

        let (out, max_logits, lse) = client.sparse_prefill_fwd(&q, &kv, &idx, 1.0, 2).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.to_vec::<f32>(), vec![8.0, 9.0, 8.0, 9.0]);
        // logit = 0.5 * (8 + 9 + 10 + 11)
        let max_logits = max_logits.to_vec::<f32>();
        assert!((max_logits[0] - 19.0).abs() < 1e-5);
        assert_eq!(lse.to_vec::<f32>(), max_logits);
    }

    #[test]
    fn test_no_valid_index() {
        let (client, device) = cpu_setup();
        let q = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 4], &[1, 1, 4], &device);
        let kv = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 8], &[2, 1, 4], &device);
        let idx = Tensor::<CpuRuntime>::from_slice(&[-1i32, 2], &[1, 1, 2], &device);
        let (out, max_logits, lse) = client.sparse_prefill_fwd(&q, &kv, &idx, 1.0, 4).unwrap();
        assert!(out.to_vec::<f32>().iter().all(|&x| x == 0.0));
        assert_eq!(max_logits.to_vec::<f32>(), vec![f32::NEG_INFINITY]);
        assert_eq!(lse.to_vec::<f32>(), vec![f32::NEG_INFINITY]);
    }

    #[test]
    fn test_shape_errors() {
        let (client, device) = cpu_setup();
        let q = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 12], &[1, 3, 4], &device);
        let kv = Tensor::<CpuRuntime>::from_slice(&[1.0f32; 16], &[2, 2, 4], &device);
        let idx = Tensor::<CpuRuntime>::from_slice(&[0i32; 4], &[1, 2, 2], &device);
        assert!(client.sparse_prefill_fwd(&q, &kv, &idx, 1.0, 4).is_err());
    }
}
