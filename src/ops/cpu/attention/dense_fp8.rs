//! CPU implementation of MlaDenseFp8Ops
//!
//! Q and the cache are E4M3 throughout. Both are dequantized with their
//! per-batch descale before scoring, then the step runs through the same
//! split-KV executor and merge as the paged path.

use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

use super::mla_decode::{MlaDecodeContext, decode_outputs, expect_tensor};
use super::params::{DecodeParams, Descale, Fp8DecodeParams};
use super::split_kv::{KvSource, QuerySource, SplitKvProblem, WorkAxis};
use crate::error::{Error, Result};
use crate::ops::traits::{DenseFp8DecodeArgs, MlaDenseFp8Ops};

fn read_descale(t: Option<&Tensor<CpuRuntime>>, arg: &'static str) -> Result<Option<Vec<f32>>> {
    t.map(|t| {
        expect_tensor(t, arg, DType::F32, 1)?;
        Ok(t.contiguous().to_vec::<f32>())
    })
    .transpose()
}

impl MlaDenseFp8Ops<CpuRuntime> for MlaDecodeContext {
    fn get_mla_decoding_metadata_dense_fp8(
        &self,
        seqlens_k: &Tensor<CpuRuntime>,
        num_heads_per_head_k: usize,
        num_heads_k: usize,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        expect_tensor(seqlens_k, "seqlens_k", DType::I32, 1)?;
        let seqlens = seqlens_k.contiguous().to_vec::<i32>();
        self.build_metadata(
            &seqlens,
            &self.config().dense_fp8,
            num_heads_k,
            num_heads_per_head_k,
            seqlens_k.device(),
        )
    }

    fn fwd_kvcache_mla_fp8(
        &self,
        args: &DenseFp8DecodeArgs<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        let q_shape = expect_tensor(args.q, "q", DType::U8, 4)?;
        let kv_shape = expect_tensor(args.kcache, "kcache", DType::U8, 4)?;
        let seq_shape = expect_tensor(args.seqlens_k, "seqlens_k", DType::I32, 1)?;
        let bt_shape = expect_tensor(args.block_table, "block_table", DType::I32, 2)?;
        let batch_size = q_shape[0];
        if kv_shape[3] != q_shape[3] {
            return Err(Error::invalid_argument(
                "kcache",
                format!("head size {} differs from q's {}", kv_shape[3], q_shape[3]),
            ));
        }
        if seq_shape[0] != batch_size || bt_shape[0] != batch_size {
            return Err(Error::inconsistent(format!(
                "batch size {batch_size} of q disagrees with seqlens_k {seq_shape:?} or block_table {bt_shape:?}"
            )));
        }

        let descale = Descale::pair(
            read_descale(args.descale_q, "descale_q")?,
            read_descale(args.descale_k, "descale_k")?,
            batch_size,
        )?;
        let fp8 = Fp8DecodeParams::new(
            DecodeParams {
                batch_size,
                seq_len_q: q_shape[1],
                num_heads_q: q_shape[2],
                num_heads_k: kv_shape[2],
                head_size: q_shape[3],
                head_size_v: args.head_size_v,
                num_pages: kv_shape[0],
                page_block_size: kv_shape[1],
                max_num_blocks: bt_shape[1],
                block_size_n: self.config().dense_fp8.block_size_n,
                softmax_scale: args.softmax_scale,
                is_causal: args.is_causal,
            },
            descale,
        )?;

        let q = args.q.contiguous().to_vec::<u8>();
        let kcache = args.kcache.contiguous().to_vec::<u8>();
        let seqlens = args.seqlens_k.contiguous().to_vec::<i32>();
        let block_table = args.block_table.contiguous().to_vec::<i32>();
        tracing::debug!(h_h_k_ratio = fp8.h_h_k_ratio, "dense fp8 decode");

        let problem = SplitKvProblem {
            params: &fp8.base,
            query: QuerySource::Fp8(&q),
            kv: KvSource::DenseFp8(&kcache),
            axis: WorkAxis::Dense,
            descale: Some(&fp8.descale),
            seqlens: &seqlens,
            block_table: &block_table,
        };
        let (out, lse) = self.run_split(&problem, args.tile_scheduler_metadata, args.num_splits)?;
        Ok(decode_outputs(&fp8.base, out, lse, args.q.device()))
    }
}

impl MlaDenseFp8Ops<CpuRuntime> for CpuClient {
    fn get_mla_decoding_metadata_dense_fp8(
        &self,
        seqlens_k: &Tensor<CpuRuntime>,
        num_heads_per_head_k: usize,
        num_heads_k: usize,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        MlaDecodeContext::default().get_mla_decoding_metadata_dense_fp8(
            seqlens_k,
            num_heads_per_head_k,
            num_heads_k,
        )
    }

    fn fwd_kvcache_mla_fp8(
        &self,
        args: &DenseFp8DecodeArgs<'_, CpuRuntime>,
    ) -> Result<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)> {
        MlaDecodeContext::default().fwd_kvcache_mla_fp8(args)
    }
}
