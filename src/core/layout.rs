//! Partitioning of a call into independent lanes.
//!
//! A lane is one (slot, head) pair. In the dense layout every batch entry is
//! a slot; with packed offsets every segment of the single batch row is.

use crate::core::inputs::Dims;

/// One independent recurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lane {
    /// Batch row the lane reads from.
    pub batch: usize,
    pub head: usize,
    /// Position range `[start, end)` within the batch row.
    pub start: usize,
    pub end: usize,
    /// Index into the state tensor's first axis.
    pub slot: usize,
}

impl Lane {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// All lanes of one call, ordered slot-major then head.
#[derive(Clone, Debug)]
pub struct LaneLayout {
    pub lanes: Vec<Lane>,
    pub slots: usize,
    pub heads: usize,
}

impl LaneLayout {
    /// Build the layout for validated dimensions.
    ///
    /// `cu_seqlens` must already have passed validation.
    pub fn new(dims: &Dims, cu_seqlens: Option<&[usize]>) -> Self {
        match cu_seqlens {
            None => Self::dense(dims.batch, dims.seq_len, dims.heads),
            Some(offsets) => Self::packed(offsets, dims.heads),
        }
    }

    pub fn dense(batch: usize, seq_len: usize, heads: usize) -> Self {
        let lanes = (0..batch)
            .flat_map(|b| {
                (0..heads).map(move |h| Lane {
                    batch: b,
                    head: h,
                    start: 0,
                    end: seq_len,
                    slot: b,
                })
            })
            .collect();
        Self {
            lanes,
            slots: batch,
            heads,
        }
    }

    pub fn packed(offsets: &[usize], heads: usize) -> Self {
        let lanes = offsets
            .windows(2)
            .enumerate()
            .flat_map(|(slot, w)| {
                let (start, end) = (w[0], w[1]);
                (0..heads).map(move |h| Lane {
                    batch: 0,
                    head: h,
                    start,
                    end,
                    slot,
                })
            })
            .collect();
        Self {
            lanes,
            slots: offsets.len().saturating_sub(1),
            heads,
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Longest lane, which bounds the number of chunks per lane.
    pub fn max_lane_len(&self) -> usize {
        self.lanes.iter().map(Lane::len).max().unwrap_or(0)
    }
}
