//! # flashmla
//!
//! **Split-KV multi-head latent attention decode, built on numr.**
//!
//! flashmla balances a batch of variable-length KV sequences across SM
//! partitions, runs attention against a paged (optionally FP8, optionally
//! top-k sparse) KV cache one partition at a time, and merges the partial
//! results with log-sum-exp renormalization.
//!
//! ## Decode step
//!
//! ```text
//! seqlens ──► TileScheduler ──► metadata + num_splits
//!                                     │
//! q, kcache, block_table ──► split-KV executor ──► partials ──► LSE merge ──► out, lse
//! ```
//!
//! ## Design
//!
//! - **Extension traits**: ops (`MlaDecodeOps`, `MlaDenseFp8Ops`,
//!   `SparsePrefillOps`, `VarLenAttentionOps`) are implemented on numr's clients
//! - **MlaDecodeContext**: the same ops bound to a loaded [`MlaDecodeConfig`]
//! - **Fixed-capacity metadata**: one `#[repr(C)]` record per SM partition
//! - **Closed dispatch**: KV encoding and dense/sparse work are enums picked once

pub mod error;
pub mod inference;
pub mod ops;
pub mod quant;

pub use error::{Error, Result};
pub use inference::{
    BlockTable, DecodeBatch, MlaDecodeConfig, SchedulerPlan, SequenceDescriptor, TileScheduler,
    TileSchedulerMetadata,
};
pub use ops::{
    DenseFp8DecodeArgs, MlaDecodeArgs, MlaDecodeContext, MlaDecodeOps, MlaDenseFp8Ops,
    SparsePrefillOps, VarLenAttentionOps, VarLenParams,
};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error as NumrError, Result as NumrResult};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
