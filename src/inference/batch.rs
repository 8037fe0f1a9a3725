//! Decode batch assembly
//!
//! A [`SequenceDescriptor`] describes one batch item for one decode step: how
//! many KV tokens it currently holds, which cache pages they live in, and
//! optionally which token positions each query row may attend to. A
//! [`DecodeBatch`] validates a set of descriptors against each other and lays
//! them out as the padded device tensors the decode ops consume.

use crate::error::{Error, Result};
use crate::inference::memory::{BlockId, BlockTable};
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// One batch item of a decode step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDescriptor {
    pub block_table: BlockTable,
    /// Top-k token positions per query row, `-1` padded
    pub sparse_indices: Option<Vec<Vec<i32>>>,
}

impl SequenceDescriptor {
    pub fn new(block_table: BlockTable) -> Self {
        Self {
            block_table,
            sparse_indices: None,
        }
    }

    pub fn with_sparse_indices(mut self, indices: Vec<Vec<i32>>) -> Self {
        self.sparse_indices = Some(indices);
        self
    }

    /// Current KV length
    pub fn seqlen_k(&self) -> usize {
        self.block_table.num_tokens
    }

    /// Grow the sequence by `new_tokens`, mapping `new_blocks` for them.
    ///
    /// Sparse indices refer to the previous step and are dropped.
    pub fn advance(&mut self, new_tokens: usize, new_blocks: Vec<BlockId>) -> Result<()> {
        self.block_table.grow(new_tokens, new_blocks)?;
        self.sparse_indices = None;
        Ok(())
    }
}

/// Validated set of descriptors for one decode step
#[derive(Debug, Clone)]
pub struct DecodeBatch {
    items: Vec<SequenceDescriptor>,
    page_block_size: usize,
    topk: Option<usize>,
    seq_len_q: Option<usize>,
}

impl DecodeBatch {
    pub fn new(items: Vec<SequenceDescriptor>) -> Result<Self> {
        let first = items
            .first()
            .ok_or_else(|| Error::invalid_argument("items", "decode batch is empty"))?;
        let page_block_size = first.block_table.page_block_size;
        let sparse = first.sparse_indices.is_some();

        let mut topk = None;
        let mut seq_len_q = None;
        for (i, item) in items.iter().enumerate() {
            item.block_table.validate()?;
            if item.block_table.page_block_size != page_block_size {
                return Err(Error::inconsistent(format!(
                    "item {i} uses page size {}, batch uses {page_block_size}",
                    item.block_table.page_block_size
                )));
            }
            if item.sparse_indices.is_some() != sparse {
                return Err(Error::inconsistent(format!(
                    "item {i} disagrees with item 0 on sparse indices"
                )));
            }
            let Some(rows) = &item.sparse_indices else {
                continue;
            };
            if *seq_len_q.get_or_insert(rows.len()) != rows.len() {
                return Err(Error::inconsistent(format!(
                    "item {i} has {} query rows of indices, expected {}",
                    rows.len(),
                    seq_len_q.unwrap_or_default()
                )));
            }
            for row in rows {
                if *topk.get_or_insert(row.len()) != row.len() {
                    return Err(Error::inconsistent(format!(
                        "item {i} has a top-k row of {} entries, expected {}",
                        row.len(),
                        topk.unwrap_or_default()
                    )));
                }
            }
        }

        Ok(Self {
            items,
            page_block_size,
            topk,
            seq_len_q,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[SequenceDescriptor] {
        &self.items
    }

    pub fn page_block_size(&self) -> usize {
        self.page_block_size
    }

    pub fn topk(&self) -> Option<usize> {
        self.topk
    }

    pub fn seqlens(&self) -> Vec<i32> {
        self.items.iter().map(|s| s.seqlen_k() as i32).collect()
    }

    pub fn max_num_blocks(&self) -> usize {
        self.items
            .iter()
            .map(|s| s.block_table.num_blocks())
            .max()
            .unwrap_or(0)
            .max(1)
    }

    /// `I32 [batch_size]`
    pub fn seqlens_tensor<R: Runtime>(&self, device: &R::Device) -> Tensor<R> {
        Tensor::<R>::from_slice(&self.seqlens(), &[self.batch_size()], device)
    }

    /// `I32 [batch_size, max_num_blocks]`, rows padded with `-1`
    pub fn block_table_tensor<R: Runtime>(&self, device: &R::Device) -> Tensor<R> {
        let width = self.max_num_blocks();
        let data: Vec<i32> = self
            .items
            .iter()
            .flat_map(|s| s.block_table.to_device_row(width))
            .collect();
        Tensor::<R>::from_slice(&data, &[self.batch_size(), width], device)
    }

    /// `I32 [batch_size, seq_len_q, topk]`, or `None` for a dense batch
    pub fn indices_tensor<R: Runtime>(&self, device: &R::Device) -> Option<Tensor<R>> {
        let (topk, seq_len_q) = (self.topk?, self.seq_len_q?);
        let data: Vec<i32> = self
            .items
            .iter()
            .filter_map(|s| s.sparse_indices.as_ref())
            .flatten()
            .flatten()
            .copied()
            .collect();
        Some(Tensor::<R>::from_slice(
            &data,
            &[self.batch_size(), seq_len_q, topk],
            device,
        ))
    }
}
