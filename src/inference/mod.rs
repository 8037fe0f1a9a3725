pub mod batch;
pub mod config;
pub mod memory;
pub mod scheduler;

pub use batch::{DecodeBatch, SequenceDescriptor};
pub use config::{CostModel, MlaDecodeConfig};
pub use memory::{BlockId, BlockTable};
pub use scheduler::{
    MAX_SM_PARTS, MetadataArena, SchedulerPlan, TILE_SCHEDULER_METADATA_SIZE, TileScheduler,
    TileSchedulerMetadata, TileSchedulerParams, WorkUnit,
};
