pub mod cpu;
pub mod traits;

pub use cpu::attention::MlaDecodeContext;
pub use traits::{
    DenseFp8DecodeArgs, MlaDecodeArgs, MlaDecodeOps, MlaDenseFp8Ops, SparsePrefillOps,
    VarLenAttentionOps, VarLenParams,
};
