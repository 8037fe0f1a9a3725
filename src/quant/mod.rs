pub mod fp8;

pub use fp8::{
    FP8_E4M3_MAX, KV_HEAD_DIM, KV_NOPE_DIM, KV_QUANT_TILE, KV_ROPE_DIM, KV_ROW_BYTES,
    decode_kv_row, encode_kv_row, f32_to_fp8_e4m3, fp8_e4m3_to_f32, quantize_per_tensor,
};
