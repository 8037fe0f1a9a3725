//! Per-sequence page map of the paged KV cache

use super::BlockId;
use crate::error::{Error, Result};

/// Pages holding one sequence's KV tokens, in logical order.
///
/// Token `t` lives at slot `t % page_block_size` of page
/// `blocks[t / page_block_size]`. The pages belong to the caller's cache
/// allocator; the table only records which ones the sequence reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    pub blocks: Vec<BlockId>,
    pub num_tokens: usize,
    pub page_block_size: usize,
}

impl BlockTable {
    pub fn with_blocks(page_block_size: usize, blocks: Vec<BlockId>, num_tokens: usize) -> Self {
        Self {
            blocks,
            num_tokens,
            page_block_size,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Pages needed to hold `num_tokens` tokens
    pub fn blocks_needed(num_tokens: usize, page_block_size: usize) -> Result<usize> {
        if page_block_size == 0 {
            return Err(Error::invalid_argument("page_block_size", "must be > 0"));
        }
        Ok(num_tokens.div_ceil(page_block_size))
    }

    /// Pages that must be mapped before `new_tokens` more tokens fit.
    pub fn missing_blocks(&self, new_tokens: usize) -> Result<usize> {
        let needed = Self::blocks_needed(self.num_tokens + new_tokens, self.page_block_size)?;
        Ok(needed.saturating_sub(self.blocks.len()))
    }

    /// Append `new_tokens` tokens, mapping `new_blocks` behind the current pages.
    pub fn grow(&mut self, new_tokens: usize, new_blocks: Vec<BlockId>) -> Result<()> {
        let missing = self.missing_blocks(new_tokens)?;
        if new_blocks.len() < missing {
            return Err(Error::invalid_argument(
                "new_blocks",
                format!(
                    "{new_tokens} new tokens need {missing} more pages, got {}",
                    new_blocks.len()
                ),
            ));
        }
        self.blocks.extend(new_blocks);
        self.num_tokens += new_tokens;
        Ok(())
    }

    /// Physical `(page, slot)` of logical token `token`.
    pub fn locate(&self, token: usize) -> Option<(BlockId, usize)> {
        if token >= self.num_tokens {
            return None;
        }
        let page = *self.blocks.get(token.checked_div(self.page_block_size)?)?;
        Some((page, token % self.page_block_size))
    }

    /// Check that every held token has a page.
    pub fn validate(&self) -> Result<()> {
        let needed = Self::blocks_needed(self.num_tokens, self.page_block_size)?;
        if self.blocks.len() < needed {
            return Err(Error::invalid_argument(
                "block_table",
                format!(
                    "{} tokens span {needed} pages of {}, only {} mapped",
                    self.num_tokens,
                    self.page_block_size,
                    self.blocks.len()
                ),
            ));
        }
        Ok(())
    }

    /// Block table tensor row: page ids, `-1` padded to `width`.
    pub fn to_device_row(&self, width: usize) -> Vec<i32> {
        let mut row: Vec<i32> = self.blocks.iter().map(|&b| b as i32).collect();
        row.resize(width.max(row.len()), -1);
        row
    }
}
