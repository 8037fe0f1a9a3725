pub mod attention;

pub use attention::{
    DenseFp8DecodeArgs, MlaDecodeArgs, MlaDecodeOps, MlaDenseFp8Ops, SparsePrefillOps,
    VarLenAttentionOps, VarLenParams,
};
