//! Split-KV attention executor
//!
//! Every SM partition record names a contiguous run of KV tiles, possibly
//! spanning several batch items. The executor expands each record into
//! per-item work units and computes one partial result per unit:
//!
//!   1. Resolve the unit's KV positions (dense range or top-k slots), dropping
//!      padding and, when causal, positions after the query token
//!   2. Dequantize Q and K rows (descales applied before the dot product)
//!   3. Online softmax over tiles with an f64 accumulator
//!   4. Normalize within the split; `lse = -inf` when nothing was scored
//!
//! Partitions run on rayon with no shared state. Their results are written to
//! disjoint slots afterwards; a slot written twice or never is an error.

use rayon::prelude::*;

use super::params::{DecodeParams, Descale};
use crate::error::{Error, Result};
use crate::inference::scheduler::{MetadataArena, WorkUnit};
use crate::quant::fp8::{KV_HEAD_DIM, KV_ROW_BYTES, decode_kv_row, fp8_e4m3_to_f32};

/// Query storage, fixed for the whole step
#[derive(Debug, Clone, Copy)]
pub enum QuerySource<'a> {
    /// `[batch, seq_len_q, num_heads_q, head_size]`
    F32(&'a [f32]),
    /// Same layout, E4M3 bytes scaled by `descale_q`
    Fp8(&'a [u8]),
}

/// KV cache storage, fixed for the whole step
#[derive(Debug, Clone, Copy)]
pub enum KvSource<'a> {
    /// `[num_pages, page_block_size, num_heads_k, head_size]`
    Dense(&'a [f32]),
    /// 656-byte rows with per-tile scales, see [`Fp8PageLayout`]
    PagedFp8 {
        rows: &'a [u8],
        layout: Fp8PageLayout,
    },
    /// `[num_pages, page_block_size, num_heads_k, head_size]` E4M3 scaled by `descale_k`
    DenseFp8(&'a [u8]),
}

/// Byte order of the 656-byte rows inside a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fp8PageLayout {
    /// `[num_pages, page_block_size, num_heads_k, 656]`
    TokenMajor,
    /// `[num_pages, num_heads_k, page_block_size * 656]`
    HeadMajor,
}

impl KvSource<'_> {
    fn row_width(&self, head_size: usize) -> usize {
        match self {
            Self::PagedFp8 { .. } => KV_ROW_BYTES,
            Self::Dense(_) | Self::DenseFp8(_) => head_size,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Dense(cache) => cache.len(),
            Self::PagedFp8 { rows: cache, .. } | Self::DenseFp8(cache) => cache.len(),
        }
    }
}

/// What the tiles of a batch item count
#[derive(Debug, Clone, Copy)]
pub enum WorkAxis<'a> {
    /// KV positions `0..seqlen`
    Dense,
    /// Top-k slots, `indices: [batch, seq_len_q, topk]`
    Sparse { indices: &'a [i32], topk: usize },
}

/// Everything the executor reads during one decode step
#[derive(Debug, Clone, Copy)]
pub struct SplitKvProblem<'a> {
    pub params: &'a DecodeParams,
    pub query: QuerySource<'a>,
    pub kv: KvSource<'a>,
    pub axis: WorkAxis<'a>,
    pub descale: Option<&'a Descale>,
    pub seqlens: &'a [i32],
    pub block_table: &'a [i32],
}

impl SplitKvProblem<'_> {
    /// Check buffer sizes and every page reference the step will follow.
    pub fn validate(&self) -> Result<()> {
        let p = self.params;
        p.validate()?;

        let q_len = p.batch_size * p.rows() * p.head_size;
        let actual_q = match self.query {
            QuerySource::F32(q) => q.len(),
            QuerySource::Fp8(q) => q.len(),
        };
        if actual_q != q_len {
            return Err(Error::invalid_argument(
                "q",
                format!("expected {q_len} elements, got {actual_q}"),
            ));
        }

        if matches!(self.kv, KvSource::PagedFp8 { .. }) && p.head_size != KV_HEAD_DIM {
            return Err(Error::invalid_argument(
                "q",
                format!("FP8 KV rows dequantize to {KV_HEAD_DIM} channels, q has {}", p.head_size),
            ));
        }
        let kv_len = p.num_pages * p.page_block_size * p.num_heads_k * self.kv.row_width(p.head_size);
        if self.kv.len() != kv_len {
            return Err(Error::invalid_argument(
                "kcache",
                format!("expected {kv_len} elements, got {}", self.kv.len()),
            ));
        }

        let needs_descale = matches!(self.query, QuerySource::Fp8(_))
            || matches!(self.kv, KvSource::DenseFp8(_));
        match (needs_descale, self.descale) {
            (false, Some(_)) => {
                return Err(Error::inconsistent("descale factors given for a non-FP8 step"));
            }
            (true, None) => {
                return Err(Error::inconsistent("FP8 operands given without descale factors"));
            }
            (true, Some(d)) if d.q.len() != p.batch_size || d.k.len() != p.batch_size => {
                return Err(Error::invalid_argument(
                    "descale_q",
                    format!("descale factors must have {} entries", p.batch_size),
                ));
            }
            _ => {}
        }

        if self.seqlens.len() != p.batch_size {
            return Err(Error::invalid_argument(
                "seqlens_k",
                format!("expected {} entries, got {}", p.batch_size, self.seqlens.len()),
            ));
        }
        if self.block_table.len() != p.batch_size * p.max_num_blocks {
            return Err(Error::invalid_argument(
                "block_table",
                format!(
                    "expected [{}, {}], got {} entries",
                    p.batch_size,
                    p.max_num_blocks,
                    self.block_table.len()
                ),
            ));
        }
        for (b, &len) in self.seqlens.iter().enumerate() {
            if len < 0 {
                return Err(Error::invalid_argument(
                    "seqlens_k",
                    format!("item {b} has negative length {len}"),
                ));
            }
            let pages = (len as usize).div_ceil(p.page_block_size);
            if pages > p.max_num_blocks {
                return Err(Error::invalid_argument(
                    "block_table",
                    format!("item {b} needs {pages} pages, rows hold {}", p.max_num_blocks),
                ));
            }
            let row = &self.block_table[b * p.max_num_blocks..][..pages];
            if let Some(bad) = row.iter().find(|&&pg| pg < 0 || pg as usize >= p.num_pages) {
                return Err(Error::inconsistent(format!(
                    "item {b} maps to page {bad}, cache has {}",
                    p.num_pages
                )));
            }
        }

        if let WorkAxis::Sparse { indices, topk } = self.axis {
            if topk == 0 {
                return Err(Error::invalid_argument("indices", "topk must be > 0"));
            }
            if indices.len() != p.batch_size * p.seq_len_q * topk {
                return Err(Error::invalid_argument(
                    "indices",
                    format!(
                        "expected [{}, {}, {topk}], got {} entries",
                        p.batch_size,
                        p.seq_len_q,
                        indices.len()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Length of item `batch` along the work axis
    pub fn axis_len(&self, batch: usize) -> usize {
        match self.axis {
            WorkAxis::Dense => self.seqlens[batch].max(0) as usize,
            WorkAxis::Sparse { topk, .. } => topk,
        }
    }

    /// Tile count of every item along the work axis
    pub fn item_blocks(&self) -> Vec<usize> {
        (0..self.params.batch_size)
            .map(|b| self.axis_len(b).div_ceil(self.params.block_size_n))
            .collect()
    }

    /// Token scored by query row `qi` at axis slot `j`, if any.
    ///
    /// Sparse slots drop padding first, then the causal bound applies to
    /// whatever remains.
    pub fn position(&self, batch: usize, qi: usize, j: usize) -> Option<usize> {
        let p = self.params;
        let seqlen = self.seqlens[batch].max(0) as usize;
        let token = match self.axis {
            WorkAxis::Dense => j,
            WorkAxis::Sparse { indices, topk } => {
                let idx = indices[(batch * p.seq_len_q + qi) * topk + j];
                if idx < 0 {
                    return None;
                }
                idx as usize
            }
        };
        if token >= seqlen {
            return None;
        }
        if p.is_causal && token + p.seq_len_q > seqlen + qi {
            return None;
        }
        Some(token)
    }

    /// Query rows of one item, dequantized: `[seq_len_q * num_heads_q, head_size]`
    pub fn query_rows(&self, batch: usize) -> Vec<f32> {
        let n = self.params.rows() * self.params.head_size;
        match self.query {
            QuerySource::F32(q) => q[batch * n..(batch + 1) * n].to_vec(),
            QuerySource::Fp8(q) => {
                let descale = self.descale.map_or(1.0, |d| d.q[batch]);
                q[batch * n..(batch + 1) * n]
                    .iter()
                    .map(|&b| fp8_e4m3_to_f32(b) * descale)
                    .collect()
            }
        }
    }

    /// Dequantize the K row of `token` on KV head `head_k` into `out`.
    pub fn load_k(&self, batch: usize, token: usize, head_k: usize, out: &mut [f32]) -> Result<()> {
        let p = self.params;
        let page = self.block_table[batch * p.max_num_blocks + token / p.page_block_size] as usize;
        let slot = token % p.page_block_size;
        let width = self.kv.row_width(p.head_size);
        let row = match self.kv {
            KvSource::PagedFp8 {
                layout: Fp8PageLayout::HeadMajor,
                ..
            } => (page * p.num_heads_k + head_k) * p.page_block_size + slot,
            _ => (page * p.page_block_size + slot) * p.num_heads_k + head_k,
        };
        let off = row * width;
        match self.kv {
            KvSource::Dense(cache) => out.copy_from_slice(&cache[off..off + width]),
            KvSource::PagedFp8 { rows, .. } => decode_kv_row(&rows[off..off + width], out)?,
            KvSource::DenseFp8(cache) => {
                let descale = self.descale.map_or(1.0, |d| d.k[batch]);
                for (dst, &b) in out.iter_mut().zip(&cache[off..off + width]) {
                    *dst = fp8_e4m3_to_f32(b) * descale;
                }
            }
        }
        Ok(())
    }
}

/// Partial outputs and log-sum-exp of every split slot.
///
/// `o_accum` is `[num_slots, seq_len_q, num_heads_q, head_size_v]` and
/// `lse_accum` is `[num_slots, seq_len_q, num_heads_q]`.
#[derive(Debug, Clone)]
pub struct PartialResults {
    pub o_accum: Vec<f32>,
    pub lse_accum: Vec<f32>,
    pub num_slots: usize,
    pub rows: usize,
    pub head_size_v: usize,
}

impl PartialResults {
    pub fn new(num_slots: usize, rows: usize, head_size_v: usize) -> Self {
        Self {
            o_accum: vec![0.0; num_slots * rows * head_size_v],
            lse_accum: vec![f32::NEG_INFINITY; num_slots * rows],
            num_slots,
            rows,
            head_size_v,
        }
    }

    pub fn output(&self, slot: usize) -> &[f32] {
        let n = self.rows * self.head_size_v;
        &self.o_accum[slot * n..(slot + 1) * n]
    }

    pub fn lse(&self, slot: usize) -> &[f32] {
        &self.lse_accum[slot * self.rows..(slot + 1) * self.rows]
    }

    fn write(&mut self, slot: usize, out: &[f32], lse: &[f32]) {
        let n = self.rows * self.head_size_v;
        self.o_accum[slot * n..(slot + 1) * n].copy_from_slice(out);
        self.lse_accum[slot * self.rows..(slot + 1) * self.rows].copy_from_slice(lse);
    }
}

/// Check the split prefix sums against the batch size.
pub fn validate_num_splits(num_splits: &[i32], batch_size: usize) -> Result<()> {
    if num_splits.len() != batch_size + 1 {
        return Err(Error::invalid_argument(
            "num_splits",
            format!("expected {} entries, got {}", batch_size + 1, num_splits.len()),
        ));
    }
    if num_splits[0] != 0 || num_splits.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::inconsistent(format!(
            "num_splits {num_splits:?} is not a prefix sum starting at 0"
        )));
    }
    Ok(())
}

struct UnitOutput {
    unit: WorkUnit,
    out: Vec<f32>,
    lse: Vec<f32>,
}

/// Run every partition of `metadata` and gather the partial results.
pub fn run_partitions(
    problem: &SplitKvProblem<'_>,
    metadata: &MetadataArena,
    num_splits: &[i32],
) -> Result<PartialResults> {
    let p = problem.params;
    problem.validate()?;
    validate_num_splits(num_splits, p.batch_size)?;

    let item_blocks = problem.item_blocks();
    let expected_blocks: usize = item_blocks.iter().sum();
    if metadata.total_blocks() != expected_blocks {
        return Err(Error::inconsistent(format!(
            "metadata assigns {} tiles, the batch has {expected_blocks}",
            metadata.total_blocks()
        )));
    }
    let units = (0..metadata.len())
        .map(|part| metadata.work_units(part, &item_blocks, num_splits))
        .collect::<Result<Vec<_>>>()?;

    let outputs = units
        .par_iter()
        .enumerate()
        .map(|(part, part_units)| {
            tracing::trace!(partition = part, units = part_units.len(), "split-kv partition");
            part_units
                .iter()
                .map(|unit| compute_unit(problem, unit))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    let num_slots = num_splits[p.batch_size] as usize;
    let mut partials = PartialResults::new(num_slots, p.rows(), p.head_size_v);
    let mut written = vec![false; num_slots];
    for UnitOutput { unit, out, lse } in outputs.into_iter().flatten() {
        if unit.slot >= num_splits[unit.batch + 1] as usize {
            return Err(Error::inconsistent(format!(
                "partition {} writes slot {} outside item {}'s splits",
                unit.partition, unit.slot, unit.batch
            )));
        }
        if std::mem::replace(&mut written[unit.slot], true) {
            return Err(Error::inconsistent(format!(
                "split slot {} written twice (partition {})",
                unit.slot, unit.partition
            )));
        }
        partials.write(unit.slot, &out, &lse);
    }
    if let Some(slot) = written.iter().position(|&w| !w) {
        return Err(Error::inconsistent(format!(
            "split slot {slot} was never written"
        )));
    }
    Ok(partials)
}

fn compute_unit(problem: &SplitKvProblem<'_>, unit: &WorkUnit) -> Result<UnitOutput> {
    let p = problem.params;
    let (d, dv) = (p.head_size, p.head_size_v);
    let (h_q, h_k) = (p.num_heads_q, p.num_heads_k);
    let heads_per_k = p.q_heads_per_k();
    let rows = p.rows();
    let bn = p.block_size_n;
    let scale = p.softmax_scale as f64;
    let b = unit.batch;

    let q = problem.query_rows(b);
    let lo = unit.block_begin * bn;
    let hi = (unit.block_end * bn).min(problem.axis_len(b));

    let mut m = vec![f64::NEG_INFINITY; rows];
    let mut l = vec![0.0f64; rows];
    let mut acc = vec![0.0f64; rows * dv];
    let mut tokens = Vec::with_capacity(bn);
    let mut tile_k = vec![0.0f32; bn * h_k * d];
    let mut scores = Vec::with_capacity(bn);

    for qi in 0..p.seq_len_q {
        for tile_start in (lo..hi).step_by(bn) {
            let tile_end = (tile_start + bn).min(hi);
            tokens.clear();
            tokens.extend((tile_start..tile_end).filter_map(|j| problem.position(b, qi, j)));
            if tokens.is_empty() {
                continue;
            }

            for (t, &token) in tokens.iter().enumerate() {
                for kh in 0..h_k {
                    let off = (t * h_k + kh) * d;
                    problem.load_k(b, token, kh, &mut tile_k[off..off + d])?;
                }
            }

            for h in 0..h_q {
                let kh = h / heads_per_k;
                let row = qi * h_q + h;
                let q_row = &q[row * d..(row + 1) * d];

                scores.clear();
                scores.extend((0..tokens.len()).map(|t| {
                    let k_row = &tile_k[(t * h_k + kh) * d..][..d];
                    dot(q_row, k_row) * scale
                }));

                let tile_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let m_new = m[row].max(tile_max);
                if m_new == f64::NEG_INFINITY {
                    continue;
                }
                let correction = (m[row] - m_new).exp();
                let acc_row = &mut acc[row * dv..(row + 1) * dv];
                l[row] *= correction;
                acc_row.iter_mut().for_each(|a| *a *= correction);

                for (t, &s) in scores.iter().enumerate() {
                    let w = (s - m_new).exp();
                    l[row] += w;
                    let v_row = &tile_k[(t * h_k + kh) * d..][..dv];
                    for (a, &v) in acc_row.iter_mut().zip(v_row) {
                        *a += w * v as f64;
                    }
                }
                m[row] = m_new;
            }
        }
    }

    let mut out = vec![0.0f32; rows * dv];
    let mut lse = vec![f32::NEG_INFINITY; rows];
    for row in 0..rows {
        if l[row] == 0.0 {
            continue;
        }
        lse[row] = (m[row] + l[row].ln()) as f32;
        let inv = 1.0 / l[row];
        for (o, &a) in out[row * dv..(row + 1) * dv]
            .iter_mut()
            .zip(&acc[row * dv..(row + 1) * dv])
        {
            *o = (a * inv) as f32;
        }
    }

    Ok(UnitOutput {
        unit: *unit,
        out,
        lse,
    })
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}
