pub mod combine;
pub mod dense_fp8;
pub mod mla_decode;
pub mod params;
pub mod reference;
pub mod sparse_prefill;
pub mod split_kv;
pub mod varlen_attention;

pub use combine::{combine_splits, merge_row};
pub use mla_decode::MlaDecodeContext;
pub use params::{DecodeParams, Descale, Fp8DecodeParams};
pub use reference::dense_decode_reference;
pub use split_kv::{
    Fp8PageLayout, KvSource, PartialResults, QuerySource, SplitKvProblem, WorkAxis, run_partitions,
};
