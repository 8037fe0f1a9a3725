//! Tile scheduler types: per-partition metadata records and their arena

use crate::error::{Error, Result};

/// Number of i32 words in one serialized metadata record
pub const TILE_SCHEDULER_METADATA_SIZE: usize = 8;

/// Capacity of the metadata arena (maximum SM partitions per step)
pub const MAX_SM_PARTS: usize = 256;

/// Inputs of the tile scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSchedulerParams {
    /// KV positions per tile
    pub block_size_n: usize,
    /// Fixed cost of a split, in tiles
    pub fixed_overhead_num_blocks: usize,
    /// Number of SM partitions to balance across
    pub num_sm_parts: usize,
}

/// Work assignment of one SM partition.
///
/// The partition processes tiles `[begin_block, ..)` of batch item
/// `begin_batch`, every tile of the items in between, and tiles `[.., end_block)`
/// of `end_batch`. Block offsets count tiles of `block_size_n`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileSchedulerMetadata {
    pub begin_batch: i32,
    pub begin_block: i32,
    pub end_batch: i32,
    /// Exclusive
    pub end_block: i32,
    /// Split index of `begin_batch` this partition writes
    pub begin_split_idx: i32,
    pub num_blocks: i32,
    reserved: [i32; 2],
}

impl TileSchedulerMetadata {
    pub fn new(
        begin: (usize, usize),
        end: (usize, usize),
        begin_split_idx: usize,
        num_blocks: usize,
    ) -> Self {
        Self {
            begin_batch: begin.0 as i32,
            begin_block: begin.1 as i32,
            end_batch: end.0 as i32,
            end_block: end.1 as i32,
            begin_split_idx: begin_split_idx as i32,
            num_blocks: num_blocks as i32,
            reserved: [0; 2],
        }
    }

    /// Record for a partition with nothing to do.
    pub fn empty(at: (usize, usize)) -> Self {
        Self::new(at, at, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    pub fn to_words(&self) -> [i32; TILE_SCHEDULER_METADATA_SIZE] {
        [
            self.begin_batch,
            self.begin_block,
            self.end_batch,
            self.end_block,
            self.begin_split_idx,
            self.num_blocks,
            self.reserved[0],
            self.reserved[1],
        ]
    }

    pub fn from_words(words: &[i32]) -> Result<Self> {
        if words.len() != TILE_SCHEDULER_METADATA_SIZE {
            return Err(Error::invalid_argument(
                "tile_scheduler_metadata",
                format!(
                    "record must have {TILE_SCHEDULER_METADATA_SIZE} words, got {}",
                    words.len()
                ),
            ));
        }
        if words[..6].iter().any(|&w| w < 0) {
            return Err(Error::invalid_argument(
                "tile_scheduler_metadata",
                format!("negative field in record {words:?}"),
            ));
        }
        Ok(Self {
            begin_batch: words[0],
            begin_block: words[1],
            end_batch: words[2],
            end_block: words[3],
            begin_split_idx: words[4],
            num_blocks: words[5],
            reserved: [words[6], words[7]],
        })
    }
}

/// One contiguous run of tiles of a single batch item, owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub partition: usize,
    pub batch: usize,
    pub block_begin: usize,
    pub block_end: usize,
    /// Partial-result slot (`num_splits[batch] + split index`)
    pub slot: usize,
}

/// Fixed-capacity arena of metadata records, indexed by partition id.
#[derive(Debug, Clone)]
pub struct MetadataArena {
    records: Box<[TileSchedulerMetadata; MAX_SM_PARTS]>,
    num_used: usize,
}

impl Default for MetadataArena {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataArena {
    pub fn new() -> Self {
        Self {
            records: Box::new([TileSchedulerMetadata::default(); MAX_SM_PARTS]),
            num_used: 0,
        }
    }

    pub fn push(&mut self, record: TileSchedulerMetadata) -> Result<()> {
        if self.num_used == MAX_SM_PARTS {
            return Err(Error::ResourceExhausted {
                reason: format!("metadata arena holds at most {MAX_SM_PARTS} partitions"),
            });
        }
        self.records[self.num_used] = record;
        self.num_used += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.num_used
    }

    pub fn is_empty(&self) -> bool {
        self.num_used == 0
    }

    pub fn as_slice(&self) -> &[TileSchedulerMetadata] {
        &self.records[..self.num_used]
    }

    pub fn total_blocks(&self) -> usize {
        self.as_slice().iter().map(|r| r.num_blocks as usize).sum()
    }

    /// Flatten to `[num_used * TILE_SCHEDULER_METADATA_SIZE]` words.
    pub fn to_words(&self) -> Vec<i32> {
        self.as_slice().iter().flat_map(|r| r.to_words()).collect()
    }

    pub fn from_words(words: &[i32]) -> Result<Self> {
        if words.len() % TILE_SCHEDULER_METADATA_SIZE != 0 {
            return Err(Error::invalid_argument(
                "tile_scheduler_metadata",
                format!(
                    "length {} is not a multiple of {TILE_SCHEDULER_METADATA_SIZE}",
                    words.len()
                ),
            ));
        }
        let mut arena = Self::new();
        for chunk in words.chunks_exact(TILE_SCHEDULER_METADATA_SIZE) {
            arena.push(TileSchedulerMetadata::from_words(chunk)?)?;
        }
        Ok(arena)
    }

    /// Expand one partition's record into per-item work units.
    ///
    /// `item_blocks[b]` is the tile count of batch item `b`; items without
    /// tiles inside the range yield no unit.
    pub fn work_units(
        &self,
        partition: usize,
        item_blocks: &[usize],
        num_splits: &[i32],
    ) -> Result<Vec<WorkUnit>> {
        let record = self.as_slice().get(partition).ok_or_else(|| {
            Error::invalid_argument(
                "partition",
                format!("{partition} out of range ({} partitions)", self.num_used),
            )
        })?;
        if record.is_empty() {
            return Ok(Vec::new());
        }

        let begin = record.begin_batch as usize;
        let end = record.end_batch as usize;
        if end < begin || end >= item_blocks.len() || num_splits.len() != item_blocks.len() + 1 {
            return Err(Error::inconsistent(format!(
                "partition {partition} spans items {begin}..={end} of a batch of {}",
                item_blocks.len()
            )));
        }

        let mut units = Vec::new();
        let mut covered = 0usize;
        for (batch, &nblocks) in item_blocks.iter().enumerate().take(end + 1).skip(begin) {
            let block_begin = if batch == begin {
                record.begin_block as usize
            } else {
                0
            };
            let block_end = if batch == end {
                record.end_block as usize
            } else {
                nblocks
            };
            if block_end > nblocks {
                return Err(Error::inconsistent(format!(
                    "partition {partition} reads tile {block_end} of item {batch} which has {nblocks}"
                )));
            }
            if block_end <= block_begin {
                continue;
            }
            let split_idx = if batch == begin {
                record.begin_split_idx as usize
            } else {
                0
            };
            units.push(WorkUnit {
                partition,
                batch,
                block_begin,
                block_end,
                slot: num_splits[batch] as usize + split_idx,
            });
            covered += block_end - block_begin;
        }

        if covered != record.num_blocks as usize {
            return Err(Error::inconsistent(format!(
                "partition {partition} records {} tiles but its range covers {covered}",
                record.num_blocks
            )));
        }
        Ok(units)
    }
}

/// Output of one scheduling pass
#[derive(Debug, Clone)]
pub struct SchedulerPlan {
    pub metadata: MetadataArena,
    /// Prefix sums, `[batch_size + 1]`
    pub num_splits: Vec<i32>,
}

impl SchedulerPlan {
    pub fn num_sm_parts(&self) -> usize {
        self.metadata.len()
    }

    pub fn batch_size(&self) -> usize {
        self.num_splits.len().saturating_sub(1)
    }

    /// Total partial-result slots the executor writes
    pub fn total_splits(&self) -> usize {
        self.num_splits.last().copied().unwrap_or(0) as usize
    }

    /// Number of partial passes batch item `batch` was divided into
    pub fn splits_of(&self, batch: usize) -> usize {
        (self.num_splits[batch + 1] - self.num_splits[batch]) as usize
    }
}
