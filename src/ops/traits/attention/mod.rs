pub mod dense_fp8;
pub mod mla_decode;
pub mod sparse_prefill;
pub mod varlen_attention;

pub use dense_fp8::{DenseFp8DecodeArgs, MlaDenseFp8Ops};
pub use mla_decode::{MlaDecodeArgs, MlaDecodeOps};
pub use sparse_prefill::SparsePrefillOps;
pub use varlen_attention::{VarLenAttentionOps, VarLenParams};
