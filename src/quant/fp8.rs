//! FP8 E4M3 codec and the paged FP8 KV-cache row format.
//!
//! E4M3: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits. Finite range
//! is [-448, 448]; `0x7F`/`0xFF` are NaN and there is no infinity. Encoding
//! rounds to nearest-even, keeps subnormals, and saturates out-of-range values
//! (including infinities) to ±448.
//!
//! # KV row layout
//!
//! One token of one KV head occupies [`KV_ROW_BYTES`] bytes:
//!
//! ```text
//! [0, 512)    512 E4M3 bytes        NoPE channels, 4 tiles of 128
//! [512, 528)  4 × f32 little-endian per-tile dequantization scales
//! [528, 656)  64 × bf16 little-endian  RoPE channels, unquantized
//! ```
//!
//! Dequantized K has [`KV_HEAD_DIM`] = 576 channels (NoPE then RoPE), and V is
//! the first [`KV_NOPE_DIM`] = 512 of them.

use crate::error::{Error, Result};
use half::bf16;

/// Largest finite E4M3 magnitude
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Quantized (NoPE) channels per KV row
pub const KV_NOPE_DIM: usize = 512;
/// Unquantized (RoPE) channels per KV row
pub const KV_ROPE_DIM: usize = 64;
/// Channels sharing one scale
pub const KV_QUANT_TILE: usize = 128;
/// Dequantized K width
pub const KV_HEAD_DIM: usize = KV_NOPE_DIM + KV_ROPE_DIM;
/// Bytes per token per KV head
pub const KV_ROW_BYTES: usize = KV_NOPE_DIM + 4 * (KV_NOPE_DIM / KV_QUANT_TILE) + 2 * KV_ROPE_DIM;

const SCALES_OFFSET: usize = KV_NOPE_DIM;
const ROPE_OFFSET: usize = SCALES_OFFSET + 4 * (KV_NOPE_DIM / KV_QUANT_TILE);

// 2^-9, the smallest subnormal
const MIN_SUBNORMAL: f32 = 1.0 / 512.0;
// 2^-6, the smallest normal
const MIN_NORMAL: f32 = 1.0 / 64.0;

/// Convert f32 to FP8 E4M3 (round to nearest even, saturating).
pub fn f32_to_fp8_e4m3(x: f32) -> u8 {
    let sign = ((x.to_bits() >> 24) & 0x80) as u8;
    if x.is_nan() {
        return sign | 0x7F;
    }
    let abs = x.abs();
    if abs >= FP8_E4M3_MAX {
        return sign | 0x7E;
    }
    if abs < MIN_NORMAL {
        // m == 8 lands exactly on the smallest normal encoding
        let m = (abs / MIN_SUBNORMAL).round_ties_even() as u8;
        return sign | m;
    }

    let mut exp = ((abs.to_bits() >> 23) & 0xFF) as i32 - 127;
    let frac = abs / 2f32.powi(exp) - 1.0;
    let mut mant = (frac * 8.0).round_ties_even() as i32;
    if mant == 8 {
        mant = 0;
        exp += 1;
    }
    sign | (((exp + 7) as u8) << 3) | mant as u8
}

/// Convert FP8 E4M3 to f32.
pub fn fp8_e4m3_to_f32(b: u8) -> f32 {
    let sign = if b & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((b >> 3) & 0x0F) as i32;
    let mant = (b & 0x07) as f32;
    if exp == 0x0F && b & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        return sign * mant * MIN_SUBNORMAL;
    }
    sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
}

/// Amax-based per-tensor quantization.
///
/// Returns the E4M3 bytes and the descale factor that maps them back
/// (`x ≈ fp8_e4m3_to_f32(q) * descale`).
pub fn quantize_per_tensor(data: &[f32]) -> (Vec<u8>, f32) {
    let descale = amax_descale(data);
    let bytes = data.iter().map(|&x| f32_to_fp8_e4m3(x / descale)).collect();
    (bytes, descale)
}

fn amax_descale(data: &[f32]) -> f32 {
    let amax = data.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
    if amax > 0.0 && amax.is_finite() {
        amax / FP8_E4M3_MAX
    } else {
        1.0
    }
}

/// Encode one K row of [`KV_HEAD_DIM`] channels into the paged FP8 layout.
pub fn encode_kv_row(k: &[f32]) -> Result<[u8; KV_ROW_BYTES]> {
    if k.len() != KV_HEAD_DIM {
        return Err(Error::invalid_argument(
            "k",
            format!("FP8 KV row needs {KV_HEAD_DIM} channels, got {}", k.len()),
        ));
    }
    let mut row = [0u8; KV_ROW_BYTES];

    for (tile, chunk) in k[..KV_NOPE_DIM].chunks_exact(KV_QUANT_TILE).enumerate() {
        let scale = amax_descale(chunk);
        let base = tile * KV_QUANT_TILE;
        for (i, &x) in chunk.iter().enumerate() {
            row[base + i] = f32_to_fp8_e4m3(x / scale);
        }
        let off = SCALES_OFFSET + 4 * tile;
        row[off..off + 4].copy_from_slice(&scale.to_le_bytes());
    }

    for (i, &x) in k[KV_NOPE_DIM..].iter().enumerate() {
        let off = ROPE_OFFSET + 2 * i;
        row[off..off + 2].copy_from_slice(&bf16::from_f32(x).to_le_bytes());
    }
    Ok(row)
}

/// Dequantize one paged FP8 row into `out` ([`KV_HEAD_DIM`] channels).
pub fn decode_kv_row(row: &[u8], out: &mut [f32]) -> Result<()> {
    if row.len() != KV_ROW_BYTES || out.len() != KV_HEAD_DIM {
        return Err(Error::invalid_argument(
            "kcache",
            format!(
                "FP8 row of {} bytes into {} channels, expected {KV_ROW_BYTES} into {KV_HEAD_DIM}",
                row.len(),
                out.len()
            ),
        ));
    }

    for tile in 0..KV_NOPE_DIM / KV_QUANT_TILE {
        let off = SCALES_OFFSET + 4 * tile;
        let scale = f32::from_le_bytes([row[off], row[off + 1], row[off + 2], row[off + 3]]);
        let base = tile * KV_QUANT_TILE;
        for i in base..base + KV_QUANT_TILE {
            out[i] = fp8_e4m3_to_f32(row[i]) * scale;
        }
    }

    for (i, dst) in out[KV_NOPE_DIM..].iter_mut().enumerate() {
        let off = ROPE_OFFSET + 2 * i;
        *dst = bf16::from_le_bytes([row[off], row[off + 1]]).to_f32();
    }
    Ok(())
}
