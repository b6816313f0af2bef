use crate::capture::SourceId;
use crate::pipeline::history::{HistoryBuffer, Sample};

/// One selectable thumbnail position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCell {
    /// 1-based offset from the oldest frame at snapshot time; this is the
    /// sample index used in persistence keys
    pub sample_index: usize,
    pub row: usize,
    pub col: usize,
    pub sample: Sample,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGrid {
    pub source: SourceId,
    pub columns: usize,
    pub cells: Vec<GridCell>,
}

impl SampleGrid {
    pub fn cell(&self, sample_index: usize) -> Option<&GridCell> {
        self.cells.iter().find(|c| c.sample_index == sample_index)
    }

    pub fn rows(&self) -> usize {
        self.cells.len().div_ceil(self.columns)
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Picks every `stride`-th resident frame and lays the picks out row-major.
#[derive(Debug, Clone, Copy)]
pub struct HistorySampler {
    columns: usize,
}

impl HistorySampler {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: columns.max(1),
        }
    }

    pub fn sample(&self, history: &HistoryBuffer, stride: usize) -> SampleGrid {
        let cells = history
            .snapshot_samples(stride)
            .enumerate()
            .map(|(i, s)| GridCell {
                sample_index: s.offset,
                row: i / self.columns,
                col: i % self.columns,
                sample: s.sample,
            })
            .collect();

        SampleGrid {
            source: history.source().clone(),
            columns: self.columns,
            cells,
        }
    }
}
