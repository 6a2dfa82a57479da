//! Per-trajectory data carried between stages
//!
//! Continuous stages (features, tICs, frame weights) produce one `f32` matrix
//! per trajectory with one row per frame; clustering produces one state index
//! per frame.

use crate::{PipelineError, Result};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Owned data for a run of consecutive frames of one trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Continuous(Array2<f32>),
    Discrete(Vec<u32>),
}

/// Borrowed view of a [`Block`]
#[derive(Debug, Clone, Copy)]
pub enum Chunk<'a> {
    Continuous(ArrayView2<'a, f32>),
    Discrete(&'a [u32]),
}

impl Block {
    pub fn n_frames(&self) -> usize {
        match self {
            Block::Continuous(a) => a.nrows(),
            Block::Discrete(v) => v.len(),
        }
    }

    /// Columns per frame (1 for discrete data)
    pub fn n_columns(&self) -> usize {
        match self {
            Block::Continuous(a) => a.ncols(),
            Block::Discrete(_) => 1,
        }
    }

    pub fn view(&self) -> Chunk<'_> {
        match self {
            Block::Continuous(a) => Chunk::Continuous(a.view()),
            Block::Discrete(v) => Chunk::Discrete(v),
        }
    }

    /// Consecutive views of at most `chunk_size` frames
    ///
    /// Always yields at least one chunk, so an empty trajectory still shows
    /// up as an (empty) chunk.
    pub fn chunks(&self, chunk_size: usize) -> Vec<Chunk<'_>> {
        let step = chunk_size.max(1);
        let n = self.n_frames();
        if n == 0 {
            return vec![self.view()];
        }
        (0..n)
            .step_by(step)
            .map(|start| {
                let end = (start + step).min(n);
                match self {
                    Block::Continuous(a) => Chunk::Continuous(a.slice(s![start..end, ..])),
                    Block::Discrete(v) => Chunk::Discrete(&v[start..end]),
                }
            })
            .collect()
    }

    /// Keep only the leading `n` columns of continuous data
    pub fn truncate_columns(self, n: usize) -> Block {
        match self {
            Block::Continuous(a) if n < a.ncols() => {
                Block::Continuous(a.slice(s![.., ..n]).to_owned())
            }
            other => other,
        }
    }

    /// Concatenate consecutive blocks of the same trajectory along frames
    pub fn concat(blocks: Vec<Block>) -> Result<Block> {
        let mut iter = blocks.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| PipelineError::InvalidInput("no blocks to concatenate".to_string()))?;

        match first {
            Block::Continuous(first) => {
                let mut parts = vec![first];
                for block in iter {
                    match block {
                        Block::Continuous(a) => parts.push(a),
                        Block::Discrete(_) => return Err(mixed_blocks()),
                    }
                }
                if parts.len() == 1 {
                    return Ok(Block::Continuous(parts.remove(0)));
                }
                let views: Vec<ArrayView2<f32>> = parts.iter().map(|a| a.view()).collect();
                let joined = concatenate(Axis(0), &views).map_err(|e| {
                    PipelineError::InvalidInput(format!("inconsistent block widths: {}", e))
                })?;
                Ok(Block::Continuous(joined))
            }
            Block::Discrete(mut joined) => {
                for block in iter {
                    match block {
                        Block::Discrete(v) => joined.extend(v),
                        Block::Continuous(_) => return Err(mixed_blocks()),
                    }
                }
                Ok(Block::Discrete(joined))
            }
        }
    }
}

fn mixed_blocks() -> PipelineError {
    PipelineError::InvalidInput("cannot concatenate continuous and discrete blocks".to_string())
}

impl<'a> Chunk<'a> {
    pub fn n_frames(&self) -> usize {
        match self {
            Chunk::Continuous(a) => a.nrows(),
            Chunk::Discrete(v) => v.len(),
        }
    }

    pub fn continuous(&self) -> Option<ArrayView2<'a, f32>> {
        match self {
            Chunk::Continuous(a) => Some(*a),
            Chunk::Discrete(_) => None,
        }
    }

    pub fn discrete(&self) -> Option<&'a [u32]> {
        match self {
            Chunk::Discrete(v) => Some(*v),
            Chunk::Continuous(_) => None,
        }
    }
}

/// Realized output of a stage: one block per input trajectory, in source order
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    trajectories: Vec<Block>,
}

impl Output {
    pub fn new(trajectories: Vec<Block>) -> Self {
        Self { trajectories }
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn trajectories(&self) -> &[Block] {
        &self.trajectories
    }

    pub fn into_trajectories(self) -> Vec<Block> {
        self.trajectories
    }

    pub fn total_frames(&self) -> usize {
        self.trajectories.iter().map(Block::n_frames).sum()
    }

    /// Width of the data (0 for an empty output)
    pub fn n_columns(&self) -> usize {
        self.trajectories.first().map(Block::n_columns).unwrap_or(0)
    }

    /// Keep only the leading `n` columns of every trajectory
    pub fn truncate_columns(self, n: usize) -> Output {
        Output::new(
            self.trajectories
                .into_iter()
                .map(|b| b.truncate_columns(n))
                .collect(),
        )
    }

    /// Continuous trajectories, `None` if this output is discrete
    pub fn continuous(&self) -> Option<Vec<ArrayView2<'_, f32>>> {
        self.trajectories
            .iter()
            .map(|b| match b {
                Block::Continuous(a) => Some(a.view()),
                Block::Discrete(_) => None,
            })
            .collect()
    }

    /// Discrete trajectories, `None` if this output is continuous
    pub fn discrete(&self) -> Option<Vec<&[u32]>> {
        self.trajectories
            .iter()
            .map(|b| match b {
                Block::Discrete(v) => Some(v.as_slice()),
                Block::Continuous(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_concat_continuous() {
        let joined = Block::concat(vec![
            Block::Continuous(array![[1.0, 2.0]]),
            Block::Continuous(array![[3.0, 4.0], [5.0, 6.0]]),
        ])
        .unwrap();
        assert_eq!(joined, Block::Continuous(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]));
    }

    #[test]
    fn test_concat_rejects_mixed() {
        let result = Block::concat(vec![
            Block::Discrete(vec![1]),
            Block::Continuous(array![[1.0]]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_chunks_cover_all_frames() {
        let block = Block::Discrete(vec![0, 1, 2, 3, 4]);
        let sizes: Vec<usize> = block.chunks(2).iter().map(Chunk::n_frames).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let empty = Block::Continuous(Array2::zeros((0, 3)));
        assert_eq!(empty.chunks(2).len(), 1);
    }

    #[test]
    fn test_truncate_columns() {
        let output = Output::new(vec![
            Block::Continuous(array![[1.0, 2.0, 3.0]]),
            Block::Discrete(vec![0, 1]),
        ]);
        let cut = output.truncate_columns(2);
        assert_eq!(cut.trajectories()[0], Block::Continuous(array![[1.0, 2.0]]));
        assert_eq!(cut.trajectories()[1], Block::Discrete(vec![0, 1]));
        assert!(cut.continuous().is_none());
    }
}
