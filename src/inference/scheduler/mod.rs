pub mod core;
pub mod types;

pub use core::TileScheduler;
pub use types::{
    MAX_SM_PARTS, MetadataArena, SchedulerPlan, TILE_SCHEDULER_METADATA_SIZE,
    TileSchedulerMetadata, TileSchedulerParams, WorkUnit,
};
