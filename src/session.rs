//! Framework-agnostic operator events
//!
//! A presentation layer feeds `ReviewSession` with input events and receives
//! results through an `EventOutlet`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::capture::{Frame, SourceId};
use crate::review::{
    AnnotationCommitter, HistorySampler, PersistenceSink, Point, ReviewError, SampleGrid, Tag,
};
use crate::supervisor::Supervisor;

/// Notifications for the presentation layer. Called from the router thread
/// and from whichever thread drives the session.
pub trait EventOutlet: Send + Sync {
    fn on_preview_updated(&self, _source: &SourceId, _frame: &Arc<Frame>, _paused: bool) {}

    fn on_sample_grid_ready(&self, _source: &SourceId, _grid: &SampleGrid) {}

    fn on_commit_result(
        &self,
        _source: &SourceId,
        _sample_index: usize,
        _result: &Result<PathBuf, ReviewError>,
    ) {
    }
}

pub struct NullOutlet;

impl EventOutlet for NullOutlet {}

/// Open grid of one source plus the operator's pending mark.
#[derive(Debug, Clone)]
struct Selection {
    grid: SampleGrid,
    chosen: Option<usize>,
    click: Option<(usize, Point)>,
}

pub struct ReviewSession {
    supervisor: Arc<Supervisor>,
    sampler: HistorySampler,
    stride: usize,
    committer: AnnotationCommitter,
    outlet: Arc<dyn EventOutlet>,
    selections: Mutex<HashMap<SourceId, Selection>>,
}

impl ReviewSession {
    pub fn new(
        supervisor: Arc<Supervisor>,
        sink: Arc<dyn PersistenceSink>,
        outlet: Arc<dyn EventOutlet>,
    ) -> Self {
        let config = supervisor.config();
        let sampler = HistorySampler::new(config.history.grid_columns);
        let stride = config.history.stride;
        let committer = AnnotationCommitter::new(sink, config.annotation.clone());
        Self {
            supervisor,
            sampler,
            stride,
            committer,
            outlet,
            selections: Mutex::new(HashMap::new()),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn on_pause_toggle(&self, source: &SourceId) -> Result<bool, ReviewError> {
        Ok(self.supervisor.toggle_pause(source)?)
    }

    pub fn on_pause_all(&self) {
        self.supervisor.toggle_all();
    }

    pub fn on_solo(&self, source: &SourceId) -> Result<bool, ReviewError> {
        Ok(self.supervisor.solo(source)?)
    }

    /// Snapshots the source's history into a fresh grid, replacing any grid
    /// already open for it.
    pub fn on_source_select(&self, source: &SourceId) -> Result<SampleGrid, ReviewError> {
        let history = self
            .supervisor
            .history(source)
            .ok_or_else(|| ReviewError::UnknownSource(source.clone()))?;
        let grid = self.sampler.sample(&history, self.stride);
        debug!(source = %source, samples = grid.cells.len(), "sample grid ready");

        self.selections.lock().insert(
            source.clone(),
            Selection {
                grid: grid.clone(),
                chosen: None,
                click: None,
            },
        );
        self.outlet.on_sample_grid_ready(source, &grid);
        Ok(grid)
    }

    pub fn on_sample_select(&self, source: &SourceId, sample_index: usize) -> Result<(), ReviewError> {
        let mut selections = self.selections.lock();
        let selection = open_cell(&mut selections, source, sample_index)?;
        selection.chosen = Some(sample_index);
        if selection.click.is_some_and(|(idx, _)| idx != sample_index) {
            selection.click = None;
        }
        Ok(())
    }

    /// Records the display-space point on `sample_index`; the latest click
    /// wins. Returns the point in full-resolution coordinates.
    pub fn on_point_click(
        &self,
        source: &SourceId,
        sample_index: usize,
        x: f64,
        y: f64,
    ) -> Result<Point, ReviewError> {
        let sample = {
            let mut selections = self.selections.lock();
            open_cell(&mut selections, source, sample_index)?
                .grid
                .cell(sample_index)
                .map(|c| c.sample.clone())
                .ok_or_else(|| no_selection(source, sample_index))?
        };

        let history = self
            .supervisor
            .history(source)
            .ok_or_else(|| ReviewError::UnknownSource(source.clone()))?;
        let entry = history.resolve(&sample)?;
        let click = Point::new(x, y);
        let full = AnnotationCommitter::map_click(&entry, click)?;

        if let Some(selection) = self.selections.lock().get_mut(source) {
            selection.chosen = Some(sample_index);
            selection.click = Some((sample_index, click));
        }
        Ok(full)
    }

    /// Persists the marked sample. On success, or when the sample has been
    /// evicted, the grid for the source is closed.
    pub fn on_commit(
        &self,
        source: &SourceId,
        sample_index: usize,
        tag: &str,
    ) -> Result<PathBuf, ReviewError> {
        let result = self.commit(source, sample_index, tag);
        if matches!(result, Ok(_) | Err(ReviewError::StaleSample { .. })) {
            self.selections.lock().remove(source);
        }
        self.outlet.on_commit_result(source, sample_index, &result);
        result
    }

    fn commit(&self, source: &SourceId, sample_index: usize, tag: &str) -> Result<PathBuf, ReviewError> {
        // Unknown tags are refused before anything else happens
        let tag: Tag = tag.parse()?;

        let (sample, click) = {
            let mut selections = self.selections.lock();
            let selection = open_cell(&mut selections, source, sample_index)?;
            let click = match selection.click {
                Some((idx, point)) if idx == sample_index => point,
                _ => {
                    return Err(ReviewError::NoPoint {
                        source_id: source.clone(),
                        sample_index,
                    })
                }
            };
            let sample = selection
                .grid
                .cell(sample_index)
                .map(|c| c.sample.clone())
                .ok_or_else(|| no_selection(source, sample_index))?;
            (sample, click)
        };

        let history = self
            .supervisor
            .history(source)
            .ok_or_else(|| ReviewError::UnknownSource(source.clone()))?;
        self.committer
            .commit(&history, &sample, sample_index, click, tag.as_str())
    }

    /// Closes the grid; true if one was open.
    pub fn on_cancel_selection(&self, source: &SourceId) -> bool {
        let closed = self.selections.lock().remove(source).is_some();
        if closed {
            info!(source = %source, "selection cancelled");
        }
        closed
    }

    pub fn has_selection(&self, source: &SourceId) -> bool {
        self.selections.lock().contains_key(source)
    }
}

fn no_selection(source: &SourceId, sample_index: usize) -> ReviewError {
    ReviewError::NoSelection {
        source_id: source.clone(),
        sample_index,
    }
}

/// The open selection of `source`, provided its grid contains `sample_index`.
fn open_cell<'a>(
    selections: &'a mut HashMap<SourceId, Selection>,
    source: &SourceId,
    sample_index: usize,
) -> Result<&'a mut Selection, ReviewError> {
    match selections.get_mut(source) {
        Some(selection) if selection.grid.cell(sample_index).is_some() => Ok(selection),
        _ => Err(no_selection(source, sample_index)),
    }
}
