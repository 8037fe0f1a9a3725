//! Greedy tile scheduler for split-KV decode

use crate::error::{Error, Result};

use super::types::{
    MAX_SM_PARTS, MetadataArena, SchedulerPlan, TileSchedulerMetadata, TileSchedulerParams,
};

/// Balances the KV tiles of a decode batch across SM partitions.
///
/// Items are walked in batch order and packed into partitions without
/// reordering. An item that does not fit the remaining budget of a partition
/// is split, and each piece becomes one partial result the reducer merges.
#[derive(Debug, Clone)]
pub struct TileScheduler {
    params: TileSchedulerParams,
}

impl TileScheduler {
    pub fn new(params: TileSchedulerParams) -> Result<Self> {
        if params.block_size_n == 0 {
            return Err(Error::invalid_argument("block_size_n", "must be > 0"));
        }
        if params.num_sm_parts == 0 {
            return Err(Error::invalid_argument("num_sm_parts", "must be > 0"));
        }
        if params.num_sm_parts > MAX_SM_PARTS {
            return Err(Error::ResourceExhausted {
                reason: format!(
                    "num_sm_parts {} exceeds metadata capacity {MAX_SM_PARTS}",
                    params.num_sm_parts
                ),
            });
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &TileSchedulerParams {
        &self.params
    }

    /// Tile count of every item.
    pub fn item_blocks(&self, seqlens: &[i32]) -> Result<Vec<usize>> {
        seqlens
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                if len < 0 {
                    return Err(Error::invalid_argument(
                        "seqlens_k",
                        format!("item {i} has negative length {len}"),
                    ));
                }
                Ok((len as usize).div_ceil(self.params.block_size_n))
            })
            .collect()
    }

    /// Per-partition budget in tiles, overhead included.
    pub fn budget(&self, item_blocks: &[usize]) -> usize {
        let overhead = self.params.fixed_overhead_num_blocks;
        let total: usize = item_blocks.iter().map(|&n| n + overhead).sum();
        (total.div_ceil(self.params.num_sm_parts) + overhead).max(2 * overhead)
    }

    /// Build the metadata records and split prefix sums for one decode step.
    pub fn plan(&self, seqlens: &[i32]) -> Result<SchedulerPlan> {
        let batch_size = seqlens.len();
        if batch_size == 0 {
            return Err(Error::invalid_argument("seqlens_k", "batch is empty"));
        }

        let nblocks = self.item_blocks(seqlens)?;
        let overhead = self.params.fixed_overhead_num_blocks;
        let budget = self.budget(&nblocks);

        let mut metadata = MetadataArena::new();
        let mut num_splits = vec![0i32; batch_size + 1];

        let mut now_idx = 0usize;
        let mut now_block = 0usize;
        let mut now_split_idx = 0usize;
        let mut cum_splits = 0usize;

        for part in 0..self.params.num_sm_parts {
            while now_idx < batch_size && nblocks[now_idx] == 0 {
                num_splits[now_idx + 1] = cum_splits as i32;
                now_idx += 1;
            }

            let begin = (now_idx.min(batch_size - 1), now_block);
            let begin_split_idx = now_split_idx;
            let mut end = begin;
            let mut remain_budget = budget;
            let mut taken = 0usize;

            while now_idx < batch_size {
                let total = nblocks[now_idx];
                if total == 0 {
                    num_splits[now_idx + 1] = cum_splits as i32;
                    now_idx += 1;
                    continue;
                }

                let remain = total - now_block;
                // Ties go to the current partition.
                if remain + overhead <= remain_budget {
                    remain_budget -= remain + overhead;
                    taken += remain;
                    end = (now_idx, total);
                    cum_splits += now_split_idx + 1;
                    num_splits[now_idx + 1] = cum_splits as i32;
                    now_idx += 1;
                    now_block = 0;
                    now_split_idx = 0;
                } else {
                    if remain_budget > overhead {
                        let take = remain_budget - overhead;
                        now_block += take;
                        taken += take;
                        end = (now_idx, now_block);
                        now_split_idx += 1;
                    }
                    break;
                }
            }

            let record = if taken == 0 {
                TileSchedulerMetadata::empty(begin)
            } else {
                TileSchedulerMetadata::new(begin, end, begin_split_idx, taken)
            };
            tracing::trace!(part, ?record, "tile scheduler partition");
            metadata.push(record)?;
        }

        while now_idx < batch_size && nblocks[now_idx] == 0 {
            num_splits[now_idx + 1] = cum_splits as i32;
            now_idx += 1;
        }
        if now_idx < batch_size {
            return Err(Error::ResourceExhausted {
                reason: format!(
                    "{} partitions could not hold the batch (stopped at item {now_idx} tile {now_block})",
                    self.params.num_sm_parts
                ),
            });
        }
        if cum_splits > batch_size + self.params.num_sm_parts {
            return Err(Error::ResourceExhausted {
                reason: format!(
                    "{cum_splits} splits exceed the partial-result capacity {}",
                    batch_size + self.params.num_sm_parts
                ),
            });
        }

        tracing::debug!(
            batch_size,
            num_sm_parts = self.params.num_sm_parts,
            budget,
            total_splits = cum_splits,
            "tile scheduler plan"
        );

        Ok(SchedulerPlan {
            metadata,
            num_splits,
        })
    }
}
