//! Operator review: sampling a source's history, marking a point on one
//! frame and persisting the annotated full-resolution copy

pub mod annotate;
pub mod sampler;
pub mod sink;

use thiserror::Error;

use crate::capture::SourceId;
use crate::pipeline::history::HistoryError;
use crate::supervisor::SupervisorError;
pub use annotate::{Annotation, AnnotationCommitter, Point, ScaleMap, Tag};
pub use sampler::{GridCell, HistorySampler, SampleGrid};
pub use sink::{AnnotationKey, FsSink, PersistenceSink, SinkError};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("selection expired, re-open the grid (frame {sequence} of {source_id} was evicted)")]
    StaleSample { source_id: SourceId, sequence: u64 },

    #[error("unknown tag {0:?}")]
    InvalidTag(String),

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("no sample {sample_index} in the open grid of {source_id}")]
    NoSelection {
        source_id: SourceId,
        sample_index: usize,
    },

    #[error("no point marked on sample {sample_index} of {source_id}")]
    NoPoint {
        source_id: SourceId,
        sample_index: usize,
    },

    #[error("click ({x}, {y}) is outside the {width}x{height} display frame")]
    ClickOutOfBounds {
        x: f64,
        y: f64,
        width: u32,
        height: u32,
    },

    #[error("stored frame {sequence} of {source_id} does not match its dimensions")]
    CorruptFrame { source_id: SourceId, sequence: u64 },

    #[error("failed to persist annotation: {0}")]
    Persistence(#[from] SinkError),

    #[error(transparent)]
    Supervisor(SupervisorError),
}

impl From<HistoryError> for ReviewError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::NotFound {
                source_id,
                sequence,
            } => ReviewError::StaleSample {
                source_id,
                sequence,
            },
            HistoryError::WrongSource { got, .. } => ReviewError::UnknownSource(got),
        }
    }
}

impl From<SupervisorError> for ReviewError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::UnknownSource(id) => ReviewError::UnknownSource(id),
            other => ReviewError::Supervisor(other),
        }
    }
}
