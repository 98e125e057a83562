//! Hyperslab windows and deterministic grid enumeration.

use crate::{Error, Result};

/// One hyperslab selection: `start/stride/count/block` per dimension.
///
/// Windows produced by [`SliceCursor`] always use stride 1 and count 1,
/// describing a single contiguous block per dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceWindow {
    pub start: Vec<usize>,
    pub stride: Vec<usize>,
    pub count: Vec<usize>,
    pub block: Vec<usize>,
}

impl SliceWindow {
    /// The shape of the buffer this window selects.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.count
            .iter()
            .zip(&self.block)
            .map(|(c, b)| c * b)
            .collect()
    }

    /// Total elements selected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major flat index of the window origin within the grid
    /// dimensions, used to align per-frame calibration rows.
    #[must_use]
    pub fn grid_offset(&self, shape: &[usize], grid_dims: usize) -> usize {
        let mut offset = 0;
        for d in 0..grid_dims.min(shape.len()) {
            offset = offset * shape[d] + self.start[d];
        }
        offset
    }

    /// Frames covered by this window: product of the grid-dimension blocks.
    #[must_use]
    pub fn grid_frames(&self, grid_dims: usize) -> usize {
        self.block[..grid_dims.min(self.block.len())]
            .iter()
            .product()
    }

    /// # Errors
    /// Returns `Error::Storage` when the window overruns the shape or
    /// its rank disagrees.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        if self.start.len() != shape.len() {
            return Err(Error::Storage(format!(
                "window rank {} does not match dataset rank {}",
                self.start.len(),
                shape.len()
            )));
        }
        for d in 0..shape.len() {
            let extent = self.start[d] + self.stride[d] * (self.count[d] - 1) + self.block[d];
            if self.count[d] == 0 || self.block[d] == 0 || extent > shape[d] {
                return Err(Error::Storage(format!(
                    "window {:?}+{:?} overruns dimension {d} of shape {shape:?}",
                    self.start, self.block
                )));
            }
        }
        Ok(())
    }
}

/// Enumerates hyperslab windows covering an N-D dataset.
///
/// The leading `grid_dims` dimensions are scan positions visited in
/// row-major order; the trailing dimensions are the detector image and are
/// always taken whole. Batching happens only along the last grid
/// dimension, up to `batch` consecutive positions per window, with the
/// final batch clipped to the remaining extent.
#[derive(Clone, Debug)]
pub struct SliceCursor {
    shape: Vec<usize>,
    grid_dims: usize,
    batch: usize,
    position: Vec<usize>,
    done: bool,
}

impl SliceCursor {
    /// # Errors
    /// Returns `Error::Storage` when `grid_dims` exceeds the rank or
    /// `batch` is zero.
    pub fn new(shape: &[usize], grid_dims: usize, batch: usize) -> Result<Self> {
        if grid_dims > shape.len() {
            return Err(Error::Storage(format!(
                "{grid_dims} grid dimensions exceed dataset rank {}",
                shape.len()
            )));
        }
        if batch == 0 {
            return Err(Error::Storage("batch size must be at least 1".to_string()));
        }
        let done = shape.iter().any(|&d| d == 0);
        Ok(Self {
            shape: shape.to_vec(),
            grid_dims,
            batch,
            position: vec![0; grid_dims],
            done,
        })
    }

    /// Total frames the cursor will visit.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.shape[..self.grid_dims].iter().product()
    }
}

impl Iterator for SliceCursor {
    type Item = SliceWindow;

    fn next(&mut self) -> Option<SliceWindow> {
        if self.done {
            return None;
        }
        let rank = self.shape.len();
        let mut start = vec![0; rank];
        let mut block = vec![0; rank];
        for d in 0..self.grid_dims {
            start[d] = self.position[d];
            block[d] = 1;
        }
        // Batch along the last grid dimension only, clipped to the extent.
        if self.grid_dims > 0 {
            let last = self.grid_dims - 1;
            block[last] = self.batch.min(self.shape[last] - self.position[last]);
        }
        for d in self.grid_dims..rank {
            block[d] = self.shape[d];
        }

        let window = SliceWindow {
            start,
            stride: vec![1; rank],
            count: vec![1; rank],
            block: block.clone(),
        };

        // Advance with carry.
        if self.grid_dims == 0 {
            self.done = true;
        } else {
            let last = self.grid_dims - 1;
            self.position[last] += block[last];
            let mut d = last;
            while self.position[d] >= self.shape[d] {
                if d == 0 {
                    self.done = true;
                    break;
                }
                self.position[d] = 0;
                self.position[d - 1] += 1;
                d -= 1;
            }
        }

        Some(window)
    }
}
