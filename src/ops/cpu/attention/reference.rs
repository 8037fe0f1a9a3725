//! Non-split decode attention
//!
//! Scores every visible position of an item in one pass with a two-pass
//! softmax. This is the path callers fall back to when a split-KV step fails,
//! and the baseline the split path is checked against.

use super::split_kv::SplitKvProblem;
use crate::error::Result;

/// Returns `(out [batch, seq_len_q, num_heads_q, head_size_v],
/// lse [batch, seq_len_q, num_heads_q])`.
pub fn dense_decode_reference(problem: &SplitKvProblem<'_>) -> Result<(Vec<f32>, Vec<f32>)> {
    problem.validate()?;
    let p = problem.params;
    let (d, dv, h_q) = (p.head_size, p.head_size_v, p.num_heads_q);
    let heads_per_k = p.q_heads_per_k();
    let rows = p.rows();

    let mut out = vec![0.0f32; p.batch_size * rows * dv];
    let mut lse = vec![f32::NEG_INFINITY; p.batch_size * rows];
    let mut k = vec![0.0f32; d];

    for b in 0..p.batch_size {
        let q = problem.query_rows(b);
        for qi in 0..p.seq_len_q {
            let tokens: Vec<usize> = (0..problem.axis_len(b))
                .filter_map(|j| problem.position(b, qi, j))
                .collect();
            if tokens.is_empty() {
                continue;
            }
            for h in 0..h_q {
                let row = qi * h_q + h;
                let q_row = &q[row * d..(row + 1) * d];
                let mut scores = Vec::with_capacity(tokens.len());
                let mut values = Vec::with_capacity(tokens.len() * dv);
                for &token in &tokens {
                    problem.load_k(b, token, h / heads_per_k, &mut k)?;
                    let s: f64 = q_row.iter().zip(&k).map(|(&x, &y)| x as f64 * y as f64).sum();
                    scores.push(s * p.softmax_scale as f64);
                    values.extend_from_slice(&k[..dv]);
                }

                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f64 = weights.iter().sum();

                let o = &mut out[(b * rows + row) * dv..(b * rows + row + 1) * dv];
                for (c, dst) in o.iter_mut().enumerate() {
                    let acc: f64 = weights
                        .iter()
                        .enumerate()
                        .map(|(t, w)| w * values[t * dv + c] as f64)
                        .sum();
                    *dst = (acc / sum) as f32;
                }
                lse[b * rows + row] = (max + sum.ln()) as f32;
            }
        }
    }
    Ok((out, lse))
}
