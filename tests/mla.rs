use flashmla::inference::scheduler::{MetadataArena, TileSchedulerMetadata};
use flashmla::inference::{CostModel, MlaDecodeConfig};
use flashmla::ops::cpu::attention::{
    DecodeParams, KvSource, QuerySource, SplitKvProblem, WorkAxis, combine_splits, merge_row,
    run_partitions,
};
use flashmla::ops::{MlaDecodeArgs, MlaDecodeContext, MlaDecodeOps};
use flashmla::quant::fp8::{KV_HEAD_DIM, KV_ROW_BYTES, decode_kv_row, encode_kv_row};
use flashmla::Error;
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

fn cpu_setup() -> (CpuClient, CpuDevice) {
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (client, device)
}

fn wave(n: usize, phase: f32) -> Vec<f32> {
    (0..n)
        .map(|i| (i as f32 * 0.37 + phase).sin() * 0.5 + (i as f32 * 0.011).cos() * 0.1)
        .collect()
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        if e == f32::NEG_INFINITY {
            assert_eq!(a, f32::NEG_INFINITY, "{what}[{i}]");
            continue;
        }
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "{what}[{i}]: {a} vs {e}"
        );
    }
}

/// Context whose bf16 path uses small tiles so short sequences still split.
fn small_tile_context(num_sms: usize) -> MlaDecodeContext {
    MlaDecodeContext::new(MlaDecodeConfig {
        num_sms,
        bf16: CostModel {
            block_size_m: 64,
            block_size_n: 8,
            fixed_overhead_num_blocks: 1,
        },
        ..Default::default()
    })
    .unwrap()
}

/// Paged F32 cache with pages handed out in reverse order and page 0 left as
/// poisoned spare.
struct PagedCache {
    cache: Vec<f32>,
    block_table: Vec<i32>,
    width: usize,
    num_pages: usize,
    page: usize,
    h_k: usize,
    d: usize,
    /// Per item `[seqlen, h_k, d]`
    keys: Vec<Vec<f32>>,
}

impl PagedCache {
    fn new(seqlens: &[usize], page: usize, h_k: usize, d: usize) -> Self {
        let pages: Vec<usize> = seqlens.iter().map(|&s| s.div_ceil(page)).collect();
        let width = pages.iter().copied().max().unwrap_or(0).max(1);
        let num_pages = pages.iter().sum::<usize>() + 1;
        let mut cache = vec![1.0e3f32; num_pages * page * h_k * d];
        let mut block_table = vec![-1i32; seqlens.len() * width];
        let mut keys = Vec::new();

        let mut next = num_pages - 1;
        for (b, &len) in seqlens.iter().enumerate() {
            for j in 0..pages[b] {
                block_table[b * width + j] = next as i32;
                next -= 1;
            }
            let item = wave(len * h_k * d, 1.0 + b as f32);
            for t in 0..len {
                let pg = block_table[b * width + t / page] as usize;
                let off = (pg * page + t % page) * h_k * d;
                cache[off..off + h_k * d].copy_from_slice(&item[t * h_k * d..(t + 1) * h_k * d]);
            }
            keys.push(item);
        }
        Self {
            cache,
            block_table,
            width,
            num_pages,
            page,
            h_k,
            d,
            keys,
        }
    }

    fn cache_tensor(&self, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(
            &self.cache,
            &[self.num_pages, self.page, self.h_k, self.d],
            device,
        )
    }

    fn table_tensor(&self, device: &CpuDevice) -> Tensor<CpuRuntime> {
        let batch = self.keys.len();
        Tensor::<CpuRuntime>::from_slice(&self.block_table, &[batch, self.width], device)
    }
}

#[derive(Clone, Copy)]
struct Shape {
    s_q: usize,
    h_q: usize,
    h_k: usize,
    d: usize,
    dv: usize,
    causal: bool,
}

impl Shape {
    fn scale(&self) -> f32 {
        1.0 / (self.d as f32).sqrt()
    }
}

/// Brute-force attention. Returns `(out [b, s_q, h_q, dv], lse [b, h_q, s_q])`.
fn naive(
    q: &[f32],
    keys: &[Vec<f32>],
    sh: Shape,
    indices: Option<(&[i32], usize)>,
) -> (Vec<f32>, Vec<f32>) {
    let batch = keys.len();
    let Shape {
        s_q, h_q, h_k, d, dv, ..
    } = sh;
    let mut out = vec![0.0f32; batch * s_q * h_q * dv];
    let mut lse = vec![f32::NEG_INFINITY; batch * h_q * s_q];
    for b in 0..batch {
        let seqlen = keys[b].len() / (h_k * d);
        for qi in 0..s_q {
            let candidates: Vec<i64> = match indices {
                Some((idx, topk)) => idx[(b * s_q + qi) * topk..][..topk]
                    .iter()
                    .map(|&i| i as i64)
                    .collect(),
                None => (0..seqlen as i64).collect(),
            };
            let visible: Vec<usize> = candidates
                .into_iter()
                .filter(|&t| t >= 0 && (t as usize) < seqlen)
                .map(|t| t as usize)
                .filter(|&t| !sh.causal || t + s_q <= seqlen + qi)
                .collect();
            for h in 0..h_q {
                if visible.is_empty() {
                    continue;
                }
                let kh = h / (h_q / h_k);
                let q_row = &q[((b * s_q + qi) * h_q + h) * d..][..d];
                let scores: Vec<f64> = visible
                    .iter()
                    .map(|&t| {
                        let k_row = &keys[b][(t * h_k + kh) * d..][..d];
                        q_row
                            .iter()
                            .zip(k_row)
                            .map(|(&x, &y)| x as f64 * y as f64)
                            .sum::<f64>()
                            * sh.scale() as f64
                    })
                    .collect();
                let m = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let sum: f64 = scores.iter().map(|s| (s - m).exp()).sum();
                let o = &mut out[((b * s_q + qi) * h_q + h) * dv..][..dv];
                for (&t, s) in visible.iter().zip(&scores) {
                    let w = (s - m).exp() / sum;
                    let v_row = &keys[b][(t * h_k + kh) * d..][..dv];
                    for (dst, &v) in o.iter_mut().zip(v_row) {
                        *dst += (w * v as f64) as f32;
                    }
                }
                lse[(b * h_q + h) * s_q + qi] = (m + sum.ln()) as f32;
            }
        }
    }
    (out, lse)
}

fn run_decode(
    ops: &impl MlaDecodeOps<CpuRuntime>,
    device: &CpuDevice,
    kv: &PagedCache,
    q: &[f32],
    sh: Shape,
    indices: Option<(&[i32], usize)>,
) -> flashmla::Result<(Vec<f32>, Vec<f32>)> {
    let batch = kv.keys.len();
    let seqlens: Vec<i32> = kv
        .keys
        .iter()
        .map(|k| (k.len() / (sh.h_k * sh.d)) as i32)
        .collect();
    let seqlens_t = Tensor::<CpuRuntime>::from_slice(&seqlens, &[batch], device);
    let q_t = Tensor::<CpuRuntime>::from_slice(q, &[batch, sh.s_q, sh.h_q, sh.d], device);
    let cache_t = kv.cache_tensor(device);
    let table_t = kv.table_tensor(device);
    let indices_t = indices
        .map(|(idx, topk)| Tensor::<CpuRuntime>::from_slice(idx, &[batch, sh.s_q, topk], device));

    let (meta, splits) = ops.get_mla_decoding_metadata(
        &seqlens_t,
        sh.s_q * sh.h_q / sh.h_k,
        sh.h_k,
        Some(sh.h_q),
        false,
        indices.map(|(_, topk)| topk),
    )?;
    let (out, lse) = ops.fwd_kvcache_mla(&MlaDecodeArgs {
        q: &q_t,
        kcache: &cache_t,
        head_size_v: sh.dv,
        seqlens_k: &seqlens_t,
        block_table: &table_t,
        tile_scheduler_metadata: &meta,
        num_splits: &splits,
        softmax_scale: sh.scale(),
        is_causal: sh.causal,
        is_fp8_kvcache: false,
        indices: indices_t.as_ref(),
    })?;
    assert_eq!(out.shape(), &[batch, sh.s_q, sh.h_q, sh.dv]);
    assert_eq!(lse.shape(), &[batch, sh.h_q, sh.s_q]);
    Ok((out.to_vec::<f32>(), lse.to_vec::<f32>()))
}

#[test]
fn test_split_decode_matches_naive() {
    let (_, device) = cpu_setup();
    let ctx = small_tile_context(6);
    let sh = Shape {
        s_q: 1,
        h_q: 4,
        h_k: 1,
        d: 16,
        dv: 8,
        causal: false,
    };
    let kv = PagedCache::new(&[37, 0, 5, 130], 16, sh.h_k, sh.d);
    let q = wave(4 * sh.h_q * sh.d, 0.3);

    let (out, lse) = run_decode(&ctx, &device, &kv, &q, sh, None).unwrap();
    let (ref_out, ref_lse) = naive(&q, &kv.keys, sh, None);
    assert_close(&out, &ref_out, 1e-4, "out");
    assert_close(&lse, &ref_lse, 1e-4, "lse");

    // empty item: zeros and -inf
    let item = sh.s_q * sh.h_q * sh.dv;
    assert!(out[item..2 * item].iter().all(|&x| x == 0.0));
    assert!(lse[sh.h_q..2 * sh.h_q].iter().all(|&l| l == f32::NEG_INFINITY));
}

#[test]
fn test_causal_multi_token_gqa() {
    let (_, device) = cpu_setup();
    let ctx = small_tile_context(12);
    let sh = Shape {
        s_q: 3,
        h_q: 4,
        h_k: 2,
        d: 12,
        dv: 12,
        causal: true,
    };
    let kv = PagedCache::new(&[20, 2, 9], 4, sh.h_k, sh.d);
    let q = wave(3 * sh.s_q * sh.h_q * sh.d, 2.1);

    let (out, lse) = run_decode(&ctx, &device, &kv, &q, sh, None).unwrap();
    let (ref_out, ref_lse) = naive(&q, &kv.keys, sh, None);
    assert_close(&out, &ref_out, 1e-4, "out");
    assert_close(&lse, &ref_lse, 1e-4, "lse");

    // item 1 has 2 tokens for 3 queries: the first query sees nothing
    for h in 0..sh.h_q {
        assert_eq!(lse[(sh.h_q + h) * sh.s_q], f32::NEG_INFINITY);
        assert!(lse[(sh.h_q + h) * sh.s_q + 1].is_finite());
    }
}

#[test]
fn test_default_client_decode() {
    let (client, device) = cpu_setup();
    let sh = Shape {
        s_q: 1,
        h_q: 2,
        h_k: 1,
        d: 8,
        dv: 8,
        causal: false,
    };
    let kv = PagedCache::new(&[100, 3], 64, sh.h_k, sh.d);
    let q = wave(2 * sh.h_q * sh.d, 0.9);

    let (out, lse) = run_decode(&client, &device, &kv, &q, sh, None).unwrap();
    let (ref_out, ref_lse) = naive(&q, &kv.keys, sh, None);
    assert_close(&out, &ref_out, 1e-4, "out");
    assert_close(&lse, &ref_lse, 1e-4, "lse");
}

#[test]
fn test_result_independent_of_partitioning() {
    let (_, device) = cpu_setup();
    let sh = Shape {
        s_q: 2,
        h_q: 2,
        h_k: 1,
        d: 16,
        dv: 16,
        causal: true,
    };
    let kv = PagedCache::new(&[300, 17, 64], 32, sh.h_k, sh.d);
    let q = wave(3 * sh.s_q * sh.h_q * sh.d, 4.2);

    let (one, one_lse) = run_decode(&small_tile_context(1), &device, &kv, &q, sh, None).unwrap();
    for num_sms in [3, 16, 200] {
        let (many, many_lse) =
            run_decode(&small_tile_context(num_sms), &device, &kv, &q, sh, None).unwrap();
        assert_close(&many, &one, 1e-5, "out");
        assert_close(&many_lse, &one_lse, 1e-5, "lse");
    }
}

#[test]
fn test_unsplit_path_agrees() {
    let (_, device) = cpu_setup();
    let ctx = small_tile_context(8);
    let sh = Shape {
        s_q: 2,
        h_q: 2,
        h_k: 1,
        d: 16,
        dv: 8,
        causal: true,
    };
    let kv = PagedCache::new(&[45, 1], 8, sh.h_k, sh.d);
    let q = wave(2 * sh.s_q * sh.h_q * sh.d, 0.5);
    let (split_out, split_lse) = run_decode(&ctx, &device, &kv, &q, sh, None).unwrap();

    let seqlens = Tensor::<CpuRuntime>::from_slice(&[45i32, 1], &[2], &device);
    let q_t = Tensor::<CpuRuntime>::from_slice(&q, &[2, sh.s_q, sh.h_q, sh.d], &device);
    let cache = kv.cache_tensor(&device);
    let table = kv.table_tensor(&device);
    let (meta, splits) = ctx
        .get_mla_decoding_metadata(&seqlens, sh.s_q * sh.h_q, 1, Some(sh.h_q), false, None)
        .unwrap();
    let (out, lse) = ctx
        .fwd_kvcache_mla_unsplit(&MlaDecodeArgs {
            q: &q_t,
            kcache: &cache,
            head_size_v: sh.dv,
            seqlens_k: &seqlens,
            block_table: &table,
            tile_scheduler_metadata: &meta,
            num_splits: &splits,
            softmax_scale: sh.scale(),
            is_causal: true,
            is_fp8_kvcache: false,
            indices: None,
        })
        .unwrap();
    assert_close(&out.to_vec::<f32>(), &split_out, 1e-5, "out");
    assert_close(&lse.to_vec::<f32>(), &split_lse, 1e-5, "lse");
}

#[test]
fn test_sparse_indices_with_causal_bound() {
    let (_, device) = cpu_setup();
    let ctx = small_tile_context(4);
    let sh = Shape {
        s_q: 2,
        h_q: 2,
        h_k: 1,
        d: 8,
        dv: 8,
        causal: true,
    };
    let kv = PagedCache::new(&[30, 12], 8, sh.h_k, sh.d);
    let q = wave(2 * sh.s_q * sh.h_q * sh.d, 1.7);
    let topk = 8;
    #[rustfmt::skip]
    let indices: Vec<i32> = vec![
        // item 0, query 0 cannot see token 29
        0, 5, 29, -1, 17, 40, 3, 28,
        // item 0, query 1 sees everything below 30
        29, 28, -1, -1, 1, 2, 30, 11,
        // item 1, query 0: only padding, out-of-range and causally hidden slots
        -1, 11, 40, -1, -1, 12, -1, -1,
        // item 1, query 1
        11, 0, 7, -1, 6, 10, 9, 8,
    ];

    let (out, lse) = run_decode(&ctx, &device, &kv, &q, sh, Some((&indices, topk))).unwrap();
    let (ref_out, ref_lse) = naive(&q, &kv.keys, sh, Some((&indices, topk)));
    assert_close(&out, &ref_out, 1e-4, "out");
    assert_close(&lse, &ref_lse, 1e-4, "lse");

    for h in 0..sh.h_q {
        assert_eq!(lse[(sh.h_q + h) * sh.s_q], f32::NEG_INFINITY);
    }
    let row = sh.h_q * sh.dv;
    // out is [b, s_q, h_q, dv]: item 1, query 0
    assert!(out[sh.s_q * row..][..row].iter().all(|&x| x == 0.0));
}

#[test]
fn test_one_split_equals_three() {
    let sh = Shape {
        s_q: 1,
        h_q: 2,
        h_k: 1,
        d: 8,
        dv: 8,
        causal: false,
    };
    let kv = PagedCache::new(&[24], 8, sh.h_k, sh.d);
    let q = wave(sh.h_q * sh.d, 0.2);
    let params = DecodeParams {
        batch_size: 1,
        seq_len_q: 1,
        num_heads_q: sh.h_q,
        num_heads_k: sh.h_k,
        head_size: sh.d,
        head_size_v: sh.dv,
        num_pages: kv.num_pages,
        page_block_size: kv.page,
        max_num_blocks: kv.width,
        block_size_n: 8,
        softmax_scale: sh.scale(),
        is_causal: false,
    };
    let seqlens = [24i32];
    let problem = SplitKvProblem {
        params: &params,
        query: QuerySource::F32(&q),
        kv: KvSource::Dense(&kv.cache),
        axis: WorkAxis::Dense,
        descale: None,
        seqlens: &seqlens,
        block_table: &kv.block_table,
    };

    let mut whole = MetadataArena::new();
    whole
        .push(TileSchedulerMetadata::new((0, 0), (0, 3), 0, 3))
        .unwrap();
    let mut thirds = MetadataArena::new();
    for i in 0..3 {
        thirds
            .push(TileSchedulerMetadata::new((0, i), (0, i + 1), i, 1))
            .unwrap();
    }

    let single = run_partitions(&problem, &whole, &[0, 1]).unwrap();
    let (single_out, single_lse) = combine_splits(&single, &[0, 1], true).unwrap();
    let split = run_partitions(&problem, &thirds, &[0, 3]).unwrap();
    assert_eq!(split.num_slots, 3);
    let (split_out, split_lse) = combine_splits(&split, &[0, 3], true).unwrap();

    assert_close(&split_out, &single_out, 1e-5, "out");
    assert_close(&split_lse, &single_lse, 1e-5, "lse");
}

#[test]
fn test_merge_is_order_independent() {
    let lses = [0.3f32, -1.2, 2.0, f32::NEG_INFINITY, 0.9];
    let outs: Vec<Vec<f32>> = (0..lses.len())
        .map(|i| wave(6, i as f32 * 1.3))
        .collect();
    let refs: Vec<&[f32]> = outs.iter().map(Vec::as_slice).collect();
    let mut merged = vec![0.0f32; 6];
    let lse = merge_row(&lses, &refs, &mut merged, true).unwrap();

    let expected_lse = lses
        .iter()
        .map(|&l| (l as f64).exp())
        .sum::<f64>()
        .ln() as f32;
    assert!((lse - expected_lse).abs() < 1e-5);

    let order = [4usize, 2, 0, 3, 1];
    let perm_lses: Vec<f32> = order.iter().map(|&i| lses[i]).collect();
    let perm_refs: Vec<&[f32]> = order.iter().map(|&i| refs[i]).collect();
    let mut permuted = vec![0.0f32; 6];
    let perm_lse = merge_row(&perm_lses, &perm_refs, &mut permuted, true).unwrap();

    assert!((perm_lse - lse).abs() <= 1e-5 * lse.abs().max(1.0));
    assert_close(&permuted, &merged, 1e-5, "merged");
}

#[test]
fn test_fp8_kvcache_decode() {
    let (client, device) = cpu_setup();
    let sh = Shape {
        s_q: 1,
        h_q: 2,
        h_k: 1,
        d: KV_HEAD_DIM,
        dv: 512,
        causal: false,
    };
    let page = 64;
    let kv = PagedCache::new(&[70, 9], page, sh.h_k, sh.d);

    // poison every row, then encode the live tokens
    let mut fp8 = vec![0x7Fu8; kv.num_pages * page * KV_ROW_BYTES];
    let mut dequant = Vec::new();
    for (b, keys) in kv.keys.iter().enumerate() {
        let mut item = vec![0.0f32; keys.len()];
        for t in 0..keys.len() / sh.d {
            let row = encode_kv_row(&keys[t * sh.d..(t + 1) * sh.d]).unwrap();
            decode_kv_row(&row, &mut item[t * sh.d..(t + 1) * sh.d]).unwrap();
            let pg = kv.block_table[b * kv.width + t / page] as usize;
            let off = (pg * page + t % page) * KV_ROW_BYTES;
            fp8[off..off + KV_ROW_BYTES].copy_from_slice(&row);
        }
        dequant.push(item);
    }

    let q = wave(2 * sh.h_q * sh.d, 0.6);
    let seqlens = Tensor::<CpuRuntime>::from_slice(&[70i32, 9], &[2], &device);
    let q_t = Tensor::<CpuRuntime>::from_slice(&q, &[2, 1, sh.h_q, sh.d], &device);
    let cache = Tensor::<CpuRuntime>::from_slice(&fp8, &[kv.num_pages, page, 1, KV_ROW_BYTES], &device);
    let table = kv.table_tensor(&device);
    let (meta, splits) = client
        .get_mla_decoding_metadata(&seqlens, sh.h_q, 1, Some(sh.h_q), true, None)
        .unwrap();
    let (out, lse) = client
        .fwd_kvcache_mla(&MlaDecodeArgs {
            q: &q_t,
            kcache: &cache,
            head_size_v: sh.dv,
            seqlens_k: &seqlens,
            block_table: &table,
            tile_scheduler_metadata: &meta,
            num_splits: &splits,
            softmax_scale: sh.scale(),
            is_causal: false,
            is_fp8_kvcache: true,
            indices: None,
        })
        .unwrap();
    let (out, lse) = (out.to_vec::<f32>(), lse.to_vec::<f32>());

    let (deq_out, deq_lse) = naive(&q, &dequant, sh, None);
    assert_close(&out, &deq_out, 1e-4, "out vs dequantized cache");
    assert_close(&lse, &deq_lse, 1e-4, "lse vs dequantized cache");

    let (f32_out, f32_lse) = naive(&q, &kv.keys, sh, None);
    assert_close(&out, &f32_out, 0.05, "out vs unquantized cache");
    assert_close(&lse, &f32_lse, 0.05, "lse vs unquantized cache");
}

#[test]
fn test_fp8_kvcache_head_major_layout() {
    let (client, device) = cpu_setup();
    let sh = Shape {
        s_q: 1,
        h_q: 4,
        h_k: 2,
        d: KV_HEAD_DIM,
        dv: 512,
        causal: true,
    };
    let page = 16;
    let lens = [40usize, 3];
    let kv = PagedCache::new(&lens, page, sh.h_k, sh.d);

    // the same rows, laid out per page as [h_k, page, 656] and as [page, h_k, 656]
    let bytes = kv.num_pages * page * sh.h_k * KV_ROW_BYTES;
    let mut head_major = vec![0x7Fu8; bytes];
    let mut token_major = vec![0x7Fu8; bytes];
    let mut dequant = Vec::new();
    for (b, keys) in kv.keys.iter().enumerate() {
        let mut item = vec![0.0f32; keys.len()];
        for t in 0..lens[b] {
            let pg = kv.block_table[b * kv.width + t / page] as usize;
            for kh in 0..sh.h_k {
                let src = (t * sh.h_k + kh) * sh.d;
                let row = encode_kv_row(&keys[src..src + sh.d]).unwrap();
                decode_kv_row(&row, &mut item[src..src + sh.d]).unwrap();
                let off = ((pg * sh.h_k + kh) * page + t % page) * KV_ROW_BYTES;
                head_major[off..off + KV_ROW_BYTES].copy_from_slice(&row);
                let off = ((pg * page + t % page) * sh.h_k + kh) * KV_ROW_BYTES;
                token_major[off..off + KV_ROW_BYTES].copy_from_slice(&row);
            }
        }
        dequant.push(item);
    }

    let q = wave(lens.len() * sh.h_q * sh.d, 0.2);
    let q_t = Tensor::<CpuRuntime>::from_slice(&q, &[lens.len(), 1, sh.h_q, sh.d], &device);
    let seqlens = Tensor::<CpuRuntime>::from_slice(&[40i32, 3], &[2], &device);
    let table = kv.table_tensor(&device);
    let (meta, splits) = client
        .get_mla_decoding_metadata(&seqlens, sh.h_q / sh.h_k, sh.h_k, Some(sh.h_q), true, None)
        .unwrap();
    let decode = |cache: &Tensor<CpuRuntime>| {
        client.fwd_kvcache_mla(&MlaDecodeArgs {
            q: &q_t,
            kcache: cache,
            head_size_v: sh.dv,
            seqlens_k: &seqlens,
            block_table: &table,
            tile_scheduler_metadata: &meta,
            num_splits: &splits,
            softmax_scale: sh.scale(),
            is_causal: sh.causal,
            is_fp8_kvcache: true,
            indices: None,
        })
    };

    let cache = Tensor::<CpuRuntime>::from_slice(
        &head_major,
        &[kv.num_pages, sh.h_k, page * KV_ROW_BYTES],
        &device,
    );
    let (out, lse) = decode(&cache).unwrap();
    let (out, lse) = (out.to_vec::<f32>(), lse.to_vec::<f32>());
    let (deq_out, deq_lse) = naive(&q, &dequant, sh, None);
    assert_close(&out, &deq_out, 1e-4, "out");
    assert_close(&lse, &deq_lse, 1e-4, "lse");

    let cache = Tensor::<CpuRuntime>::from_slice(
        &token_major,
        &[kv.num_pages, page, sh.h_k, KV_ROW_BYTES],
        &device,
    );
    let (tm_out, tm_lse) = decode(&cache).unwrap();
    assert_eq!(tm_out.to_vec::<f32>(), out);
    assert_eq!(tm_lse.to_vec::<f32>(), lse);

    // rank 3 rows must hold whole 656-byte records
    let ragged = Tensor::<CpuRuntime>::from_slice(
        &head_major[..kv.num_pages * sh.h_k * (page * KV_ROW_BYTES - 1)],
        &[kv.num_pages, sh.h_k, page * KV_ROW_BYTES - 1],
        &device,
    );
    assert!(matches!(decode(&ragged), Err(Error::InvalidArgument { .. })));
}

#[test]
fn test_mismatched_metadata_rejected() {
    let (client, device) = cpu_setup();
    let kv = PagedCache::new(&[200], 64, 1, 8);
    let q = wave(8, 0.0);
    let q_t = Tensor::<CpuRuntime>::from_slice(&q, &[1, 1, 1, 8], &device);
    let cache = kv.cache_tensor(&device);
    let table = kv.table_tensor(&device);
    let seqlens = Tensor::<CpuRuntime>::from_slice(&[200i32], &[1], &device);

    // built for a shorter sequence
    let short = Tensor::<CpuRuntime>::from_slice(&[10i32], &[1], &device);
    let (meta, splits) = client
        .get_mla_decoding_metadata(&short, 1, 1, None, false, None)
        .unwrap();
    let args = MlaDecodeArgs {
        q: &q_t,
        kcache: &cache,
        head_size_v: 8,
        seqlens_k: &seqlens,
        block_table: &table,
        tile_scheduler_metadata: &meta,
        num_splits: &splits,
        softmax_scale: 0.3,
        is_causal: false,
        is_fp8_kvcache: false,
        indices: None,
    };
    assert!(matches!(
        client.fwd_kvcache_mla(&args),
        Err(Error::Inconsistent { .. })
    ));

    // num_splits for a different batch size
    let (meta, _) = client
        .get_mla_decoding_metadata(&seqlens, 1, 1, None, false, None)
        .unwrap();
    let wrong_splits = Tensor::<CpuRuntime>::from_slice(&[0i32, 1, 2], &[3], &device);
    let args = MlaDecodeArgs {
        tile_scheduler_metadata: &meta,
        num_splits: &wrong_splits,
        ..args
    };
    assert!(client.fwd_kvcache_mla(&args).is_err());
}

#[test]
fn test_invalid_inputs() {
    let (client, device) = cpu_setup();
    let kv = PagedCache::new(&[20], 16, 1, 8);
    let q = wave(8, 0.0);
    let q_t = Tensor::<CpuRuntime>::from_slice(&q, &[1, 1, 1, 8], &device);
    let cache = kv.cache_tensor(&device);
    let table = kv.table_tensor(&device);
    let seqlens = Tensor::<CpuRuntime>::from_slice(&[20i32], &[1], &device);
    let (meta, splits) = client
        .get_mla_decoding_metadata(&seqlens, 1, 1, None, false, None)
        .unwrap();
    let good = MlaDecodeArgs {
        q: &q_t,
        kcache: &cache,
        head_size_v: 8,
        seqlens_k: &seqlens,
        block_table: &table,
        tile_scheduler_metadata: &meta,
        num_splits: &splits,
        softmax_scale: 0.3,
        is_causal: false,
        is_fp8_kvcache: false,
        indices: None,
    };
    assert!(client.fwd_kvcache_mla(&good).is_ok());

    // V wider than K
    let args = MlaDecodeArgs {
        head_size_v: 9,
        ..good
    };
    assert!(matches!(
        client.fwd_kvcache_mla(&args),
        Err(Error::InvalidArgument { .. })
    ));

    // q width disagrees with the cache rows
    let wide_q = Tensor::<CpuRuntime>::from_slice(&wave(16, 0.0), &[1, 1, 1, 16], &device);
    let args = MlaDecodeArgs { q: &wide_q, ..good };
    assert!(matches!(
        client.fwd_kvcache_mla(&args),
        Err(Error::InvalidArgument { .. })
    ));

    // page id past the end of the cache
    let bad_table =
        Tensor::<CpuRuntime>::from_slice(&[0i32, kv.num_pages as i32], &[1, 2], &device);
    let args = MlaDecodeArgs {
        block_table: &bad_table,
        ..good
    };
    assert!(matches!(
        client.fwd_kvcache_mla(&args),
        Err(Error::Inconsistent { .. })
    ));

    // FP8 flag with an F32 cache
    let args = MlaDecodeArgs {
        is_fp8_kvcache: true,
        ..good
    };
    assert!(matches!(
        client.fwd_kvcache_mla(&args),
        Err(Error::InvalidArgument { .. })
    ));
}
