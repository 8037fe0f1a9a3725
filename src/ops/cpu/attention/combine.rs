//! Log-sum-exp merge of split-KV partial results

use rayon::prelude::*;

use super::split_kv::PartialResults;
use crate::error::{Error, Result};

/// Merge the partial results of one query row.
///
/// `lses[i]` and `outs[i]` belong to split `i`; each output is normalized within
/// its own split. Writes the merged row into `out` and returns the merged lse.
/// Splits with `lse = -inf` contribute nothing. With `check`, a NaN or `+inf`
/// lse next to a finite one is reported instead of propagated.
pub fn merge_row(lses: &[f32], outs: &[&[f32]], out: &mut [f32], check: bool) -> Result<f32> {
    if check && lses.iter().any(|l| l.is_finite()) {
        if let Some(bad) = lses.iter().find(|l| l.is_nan() || **l == f32::INFINITY) {
            return Err(Error::inconsistent(format!(
                "split lse {bad} next to finite splits in {lses:?}"
            )));
        }
    }
    if lses.iter().any(|l| l.is_nan()) {
        tracing::warn!(?lses, "NaN split lse, propagating to the merged row");
        out.fill(f32::NAN);
        return Ok(f32::NAN);
    }

    let m = lses.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if m == f32::NEG_INFINITY {
        out.fill(0.0);
        return Ok(f32::NEG_INFINITY);
    }

    let mut acc = vec![0.0f64; out.len()];
    let mut sum = 0.0f64;
    for (&lse, o) in lses.iter().zip(outs) {
        let w = ((lse - m) as f64).exp();
        sum += w;
        for (a, &x) in acc.iter_mut().zip(o.iter()) {
            *a += w * x as f64;
        }
    }
    for (dst, a) in out.iter_mut().zip(acc) {
        *dst = (a / sum) as f32;
    }
    Ok(m + sum.ln() as f32)
}

/// Reduce every item's splits.
///
/// Returns `(out [batch, rows, head_size_v], lse [batch, rows])`. Items with a
/// single split are copied through; items with none get zeros and `-inf`.
pub fn combine_splits(
    partials: &PartialResults,
    num_splits: &[i32],
    check: bool,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let batch_size = num_splits.len().saturating_sub(1);
    let (rows, dv) = (partials.rows, partials.head_size_v);
    let mut out = vec![0.0f32; batch_size * rows * dv];
    let mut lse = vec![f32::NEG_INFINITY; batch_size * rows];
    if rows == 0 || dv == 0 {
        return Ok((out, lse));
    }

    out.par_chunks_mut(rows * dv)
        .zip(lse.par_chunks_mut(rows))
        .enumerate()
        .try_for_each(|(b, (item_out, item_lse))| -> Result<()> {
            let first = num_splits[b] as usize;
            let last = num_splits[b + 1] as usize;
            match last - first {
                0 => Ok(()),
                1 => {
                    item_out.copy_from_slice(partials.output(first));
                    item_lse.copy_from_slice(partials.lse(first));
                    Ok(())
                }
                _ => {
                    let mut row_lses = Vec::with_capacity(last - first);
                    let mut row_outs = Vec::with_capacity(last - first);
                    for row in 0..rows {
                        row_lses.clear();
                        row_outs.clear();
                        for slot in first..last {
                            row_lses.push(partials.lse(slot)[row]);
                            row_outs.push(&partials.output(slot)[row * dv..(row + 1) * dv]);
                        }
                        item_lse[row] = merge_row(
                            &row_lses,
                            &row_outs,
                            &mut item_out[row * dv..(row + 1) * dv],
                            check,
                        )?;
                    }
                    Ok(())
                }
            }
        })?;

    tracing::trace!(batch_size, total_splits = partials.num_slots, "combined split results");
    Ok((out, lse))
}
