//! CPU implementation of MlaDecodeOps
//!
//! Metadata comes from the tile scheduler; the forward pass validates every
//! input, runs the split-KV executor over the partition records and merges the
//! splits. [`MlaDecodeContext`] carries the engine configuration; the plain
//! `CpuClient` impl uses the default one.

use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

use super::combine::combine_splits;
use super::params::DecodeParams;
use super::reference::dense_decode_reference;
use super::split_kv::{
    Fp8PageLayout, KvSource, QuerySource, SplitKvProblem, WorkAxis, run_partitions,
};
use crate::error::{Error, Result};
use crate::inference::config::{CostModel, MlaDecodeConfig};
use crate::inference::scheduler::{
    MetadataArena, TILE_SCHEDULER_METADATA_SIZE, TileScheduler, TileSchedulerParams,
};
use crate::ops::traits::{MlaDecodeArgs, MlaDecodeOps};
use crate::quant::fp8::KV_ROW_BYTES;

/// Decode engine bound to a configuration
#[derive(Debug, Clone, Default)]
pub struct MlaDecodeContext {
    config: MlaDecodeConfig,
}

impl MlaDecodeContext {
    pub fn new(config: MlaDecodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MlaDecodeConfig {
        &self.config
    }

    /// Run the scheduler for `seqlens` under `cost` and lay the plan out as tensors.
    pub(super) fn build_metadata(
        &self,
        seqlens: &[i32],
        cost: &CostModel,
        num_heads_k: usize,
        rows_per_head_k: usize,
        device: &CpuDevice,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        if num_heads_k == 0 {
            return Err(Error::invalid_argument("num_heads_k", "must be > 0"));
        }
        if rows_per_head_k == 0 {
            return Err(Error::invalid_argument(
                "num_q_tokens_per_head_k",
                "must be > 0",
            ));
        }
        let num_sm_parts = cost.num_sm_parts(self.config.num_sms, num_heads_k, rows_per_head_k);
        let plan = TileScheduler::new(TileSchedulerParams {
            block_size_n: cost.block_size_n,
            fixed_overhead_num_blocks: cost.fixed_overhead_num_blocks,
            num_sm_parts,
        })?
        .plan(seqlens)?;

        tracing::debug!(
            batch_size = seqlens.len(),
            num_sm_parts,
            total_splits = plan.total_splits(),
            "built mla decoding metadata"
        );

        let metadata = Tensor::<CpuRuntime>::from_slice(
            &plan.metadata.to_words(),
            &[plan.num_sm_parts(), TILE_SCHEDULER_METADATA_SIZE],
            device,
        );
        let num_splits =
            Tensor::<CpuRuntime>::from_slice(&plan.num_splits, &[plan.num_splits.len()], device);
        Ok((metadata, num_splits))
    }

    /// Split-KV forward pass: execute partitions, then merge.
    ///
    /// Returns `(out [batch, s_q, h_q, dv], lse [batch, s_q, h_q])`.
    pub(super) fn run_split(
        &self,
        problem: &SplitKvProblem<'_>,
        tile_scheduler_metadata: &Tensor<CpuRuntime>,
        num_splits: &Tensor<CpuRuntime>,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let shape = expect_tensor(tile_scheduler_metadata, "tile_scheduler_metadata", DType::I32, 2)?;
        if shape[1] != TILE_SCHEDULER_METADATA_SIZE {
            return Err(Error::invalid_argument(
                "tile_scheduler_metadata",
                format!("expected [num_sm_parts, {TILE_SCHEDULER_METADATA_SIZE}], got {shape:?}"),
            ));
        }
        expect_tensor(num_splits, "num_splits", DType::I32, 1)?;

        let metadata = MetadataArena::from_words(&tile_scheduler_metadata.contiguous().to_vec::<i32>())?;
        let num_splits = num_splits.contiguous().to_vec::<i32>();

        tracing::debug!(
            batch_size = problem.params.batch_size,
            seq_len_q = problem.params.seq_len_q,
            num_sm_parts = metadata.len(),
            sparse = matches!(problem.axis, WorkAxis::Sparse { .. }),
            "split-kv decode"
        );
        let partials = run_partitions(problem, &metadata, &num_splits)?;
        combine_splits(&partials, &num_splits, self.config.check_numerics)
    }

    /// Same contract as [`MlaDecodeOps::fwd_kvcache_mla`] without split-KV:
    /// ignores the metadata and scores each item in one pass.
    pub fn fwd_kvcache_mla_unsplit(
        &self,
        args: &MlaDecodeArgs<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let inputs = PagedInputs::from_args(args, self.cost_for(args))?;
        let (out, lse) = dense_decode_reference(&inputs.problem())?;
        Ok(decode_outputs(&inputs.params, out, lse, args.q.device()))
    }

    fn cost_for(&self, args: &MlaDecodeArgs<'_, CpuRuntime>) -> &CostModel {
        self.config.paged_cost_model(args.is_fp8_kvcache)
    }
}

/// Check dtype and rank, returning the shape.
pub(super) fn expect_tensor(
    t: &Tensor<CpuRuntime>,
    arg: &'static str,
    dtype: DType,
    rank: usize,
) -> Result<Vec<usize>> {
    if t.dtype() != dtype {
        return Err(Error::invalid_argument(
            arg,
            format!("expected {dtype:?}, got {:?}", t.dtype()),
        ));
    }
    let shape = t.shape().to_vec();
    if shape.len() != rank {
        return Err(Error::invalid_argument(
            arg,
            format!("expected rank {rank}, got shape {shape:?}"),
        ));
    }
    Ok(shape)
}

/// Wrap executor output as tensors, moving lse to `[batch, h_q, s_q]`.
pub(super) fn decode_outputs(
    params: &DecodeParams,
    out: Vec<f32>,
    lse: Vec<f32>,
    device: &CpuDevice,
) -> (Tensor<CpuRuntime>, Tensor<CpuRuntime>) {
    let (b, s_q, h_q) = (params.batch_size, params.seq_len_q, params.num_heads_q);
    let mut lse_t = vec![0.0f32; lse.len()];
    for bi in 0..b {
        for qi in 0..s_q {
            for h in 0..h_q {
                lse_t[(bi * h_q + h) * s_q + qi] = lse[(bi * s_q + qi) * h_q + h];
            }
        }
    }
    (
        Tensor::<CpuRuntime>::from_slice(&out, &[b, s_q, h_q, params.head_size_v], device),
        Tensor::<CpuRuntime>::from_slice(&lse_t, &[b, h_q, s_q], device),
    )
}

enum KvData {
    F32(Vec<f32>),
    Fp8Rows(Vec<u8>, Fp8PageLayout),
}

/// `(num_pages, page_block_size, num_heads_k)` and row order of a 656-byte-row cache.
fn fp8_cache_geometry(
    kcache: &Tensor<CpuRuntime>,
) -> Result<((usize, usize, usize), Fp8PageLayout)> {
    if kcache.dtype() != DType::U8 {
        return Err(Error::invalid_argument(
            "kcache",
            format!("expected U8, got {:?}", kcache.dtype()),
        ));
    }
    match kcache.shape() {
        &[pages, page_size, heads, row] if row == KV_ROW_BYTES => {
            Ok(((pages, page_size, heads), Fp8PageLayout::TokenMajor))
        }
        &[pages, heads, bytes] if bytes % KV_ROW_BYTES == 0 => Ok((
            (pages, bytes / KV_ROW_BYTES, heads),
            Fp8PageLayout::HeadMajor,
        )),
        shape => Err(Error::invalid_argument(
            "kcache",
            format!(
                "expected [pages, page_block_size, num_heads_k, {KV_ROW_BYTES}] or \
                 [pages, num_heads_k, page_block_size * {KV_ROW_BYTES}], got {shape:?}"
            ),
        )),
    }
}

/// Host copies of the paged decode inputs
struct PagedInputs {
    params: DecodeParams,
    q: Vec<f32>,
    kcache: KvData,
    seqlens: Vec<i32>,
    block_table: Vec<i32>,
    indices: Option<(Vec<i32>, usize)>,
}

impl PagedInputs {
    fn from_args(args: &MlaDecodeArgs<'_, CpuRuntime>, cost: &CostModel) -> Result<Self> {
        let q_shape = expect_tensor(args.q, "q", DType::F32, 4)?;
        let (batch_size, seq_len_q, num_heads_q, head_size) =
            (q_shape[0], q_shape[1], q_shape[2], q_shape[3]);

        let ((num_pages, page_block_size, num_heads_k), fp8_layout) = if args.is_fp8_kvcache {
            let (geometry, layout) = fp8_cache_geometry(args.kcache)?;
            (geometry, Some(layout))
        } else {
            let kv_shape = expect_tensor(args.kcache, "kcache", DType::F32, 4)?;
            if kv_shape[3] != head_size {
                return Err(Error::invalid_argument(
                    "kcache",
                    format!("last dim must be {head_size}, got {}", kv_shape[3]),
                ));
            }
            ((kv_shape[0], kv_shape[1], kv_shape[2]), None)
        };

        let seq_shape = expect_tensor(args.seqlens_k, "seqlens_k", DType::I32, 1)?;
        let bt_shape = expect_tensor(args.block_table, "block_table", DType::I32, 2)?;
        if seq_shape[0] != batch_size || bt_shape[0] != batch_size {
            return Err(Error::inconsistent(format!(
                "batch size {batch_size} of q disagrees with seqlens_k {seq_shape:?} or block_table {bt_shape:?}"
            )));
        }

        let indices = match args.indices {
            Some(indices) => {
                let shape = expect_tensor(indices, "indices", DType::I32, 3)?;
                if shape[0] != batch_size || shape[1] != seq_len_q {
                    return Err(Error::inconsistent(format!(
                        "indices {shape:?} do not match q [{batch_size}, {seq_len_q}, ..]"
                    )));
                }
                Some((indices.contiguous().to_vec::<i32>(), shape[2]))
            }
            None => None,
        };

        let params = DecodeParams {
            batch_size,
            seq_len_q,
            num_heads_q,
            num_heads_k,
            head_size,
            head_size_v: args.head_size_v,
            num_pages,
            page_block_size,
            max_num_blocks: bt_shape[1],
            block_size_n: cost.block_size_n,
            softmax_scale: args.softmax_scale,
            is_causal: args.is_causal,
        };
        params.validate()?;

        let kcache = match fp8_layout {
            Some(layout) => KvData::Fp8Rows(args.kcache.contiguous().to_vec::<u8>(), layout),
            None => KvData::F32(args.kcache.contiguous().to_vec::<f32>()),
        };

        Ok(Self {
            params,
            q: args.q.contiguous().to_vec::<f32>(),
            kcache,
            seqlens: args.seqlens_k.contiguous().to_vec::<i32>(),
            block_table: args.block_table.contiguous().to_vec::<i32>(),
            indices,
        })
    }

    fn problem(&self) -> SplitKvProblem<'_> {
        SplitKvProblem {
            params: &self.params,
            query: QuerySource::F32(&self.q),
            kv: match &self.kcache {
                KvData::F32(cache) => KvSource::Dense(cache),
                KvData::Fp8Rows(rows, layout) => KvSource::PagedFp8 {
                    rows,
                    layout: *layout,
                },
            },
            axis: match &self.indices {
                Some((indices, topk)) => WorkAxis::Sparse {
                    indices,
                    topk: *topk,
                },
                None => WorkAxis::Dense,
            },
            descale: None,
            seqlens: &self.seqlens,
            block_table: &self.block_table,
        }
    }
}

impl MlaDecodeOps<CpuRuntime> for MlaDecodeContext {
    fn get_mla_decoding_metadata(
        &self,
        seqlens_k: &Tensor<CpuRuntime>,
        num_q_tokens_per_head_k: usize,
        num_heads_k: usize,
        num_heads_q: Option<usize>,
        is_fp8_kvcache: bool,
        topk: Option<usize>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        expect_tensor(seqlens_k, "seqlens_k", DType::I32, 1)?;
        if let Some(h_q) = num_heads_q {
            if num_heads_k == 0 || h_q % num_heads_k != 0 {
                return Err(Error::invalid_argument(
                    "num_heads_q",
                    format!("{h_q} is not a multiple of num_heads_k {num_heads_k}"),
                ));
            }
        }

        let seqlens = seqlens_k.contiguous().to_vec::<i32>();
        let lengths = match topk {
            Some(0) => return Err(Error::invalid_argument("topk", "must be > 0")),
            Some(k) => vec![k as i32; seqlens.len()],
            None => seqlens,
        };
        self.build_metadata(
            &lengths,
            self.config.paged_cost_model(is_fp8_kvcache),
            num_heads_k,
            num_q_tokens_per_head_k,
            seqlens_k.device(),
        )
    }

    fn fwd_kvcache_mla(
        &self,
        args: &MlaDecodeArgs<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let inputs = PagedInputs::from_args(args, self.cost_for(args))?;
        let (out, lse) = self.run_split(
            &inputs.problem(),
            args.tile_scheduler_metadata,
            args.num_splits,
        )?;
        Ok(decode_outputs(&inputs.params, out, lse, args.q.device()))
    }
}

impl MlaDecodeOps<CpuRuntime> for CpuClient {
    fn get_mla_decoding_metadata(
        &self,
        seqlens_k: &Tensor<CpuRuntime>,
        num_q_tokens_per_head_k: usize,
        num_heads_k: usize,
        num_heads_q: Option<usize>,
        is_fp8_kvcache: bool,
        topk: Option<usize>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        MlaDecodeContext::default().get_mla_decoding_metadata(
            seqlens_k,
            num_q_tokens_per_head_k,
            num_heads_k,
            num_heads_q,
            is_fp8_kvcache,
            topk,
        )
    }

    fn fwd_kvcache_mla(
        &self,
        args: &MlaDecodeArgs<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        MlaDecodeContext::default().fwd_kvcache_mla(args)
    }
}
