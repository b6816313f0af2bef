//! Headless multi-source capture with operator review on stdin

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, trace, warn};

use framepick::capture::{pattern, Frame, PatternSource, SourceId};
use framepick::console::{Command, HELP};
use framepick::review::{FsSink, ReviewError, SampleGrid};
use framepick::session::{EventOutlet, ReviewSession};
use framepick::supervisor::Supervisor;
use framepick::{Config, SourceConfig};

/// Reports core events to the log.
struct LogOutlet;

impl EventOutlet for LogOutlet {
    fn on_preview_updated(&self, source: &SourceId, frame: &Arc<Frame>, paused: bool) {
        trace!(source = %source, seq = frame.sequence(), paused, "preview");
    }

    fn on_sample_grid_ready(&self, source: &SourceId, grid: &SampleGrid) {
        for row in 0..grid.rows() {
            let indices: Vec<String> = grid
                .cells
                .iter()
                .filter(|c| c.row == row)
                .map(|c| c.sample_index.to_string())
                .collect();
            info!(source = %source, row, samples = %indices.join(" "), "grid");
        }
        if grid.is_empty() {
            info!(source = %source, "not enough history for a grid yet");
        }
    }

    fn on_commit_result(
        &self,
        source: &SourceId,
        sample_index: usize,
        result: &Result<PathBuf, ReviewError>,
    ) {
        match result {
            Ok(path) => info!(source = %source, sample_index, path = %path.display(), "saved"),
            Err(e) => warn!(source = %source, sample_index, "commit failed: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "framepick=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framepick launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    if config.sources.is_empty() {
        return Err(eyre!("no sources configured"));
    }

    let outlet: Arc<dyn EventOutlet> = Arc::new(LogOutlet);
    let supervisor = Arc::new(Supervisor::start(config.clone(), Arc::clone(&outlet))?);
    for source in &config.sources {
        spawn_source(&supervisor, source)?;
    }

    let sink = Arc::new(FsSink::new(config.annotation.output_dir.clone()));
    let session = Arc::new(ReviewSession::new(Arc::clone(&supervisor), sink, outlet));

    info!(sources = config.sources.len(), "capture running, type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = ticker.tick() => log_status(&supervisor),
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => {
                        let session = Arc::clone(&session);
                        tokio::task::spawn_blocking(move || dispatch(&session, cmd)).await?;
                    }
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => {
                    // stdin closed; keep capturing until interrupted
                    debug!("console closed");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    error!("console read failed: {}", e);
                    break;
                }
            },
        }
    }

    info!("framepick shutting down");
    let sup = Arc::clone(&supervisor);
    tokio::task::spawn_blocking(move || sup.shutdown()).await?;
    Ok(())
}

fn spawn_source(supervisor: &Supervisor, source: &SourceConfig) -> Result<()> {
    let id = SourceId::new(&source.id);
    if source.uri.starts_with(pattern::SCHEME) {
        supervisor.spawn_source(id, source.uri.as_str(), PatternSource)?;
    } else {
        spawn_network_source(supervisor, id, &source.uri)?;
    }
    Ok(())
}

#[cfg(feature = "gstreamer-source")]
fn spawn_network_source(supervisor: &Supervisor, id: SourceId, uri: &str) -> Result<()> {
    let source = framepick::capture::GstSource::new(supervisor.config().capture.read_timeout());
    supervisor.spawn_source(id, uri, source)?;
    Ok(())
}

#[cfg(not(feature = "gstreamer-source"))]
fn spawn_network_source(_supervisor: &Supervisor, id: SourceId, uri: &str) -> Result<()> {
    Err(eyre!(
        "source {} uses {:?}; build with --features gstreamer-source for network sources",
        id,
        uri
    ))
}

fn dispatch(session: &ReviewSession, cmd: Command) {
    let result = match cmd {
        Command::Pause(id) => session
            .on_pause_toggle(&id)
            .map(|paused| info!(source = %id, paused, "pause toggled")),
        Command::PauseAll => {
            session.on_pause_all();
            Ok(())
        }
        Command::Solo(id) => session
            .on_solo(&id)
            .map(|solo| info!(source = %id, solo, "solo toggled")),
        Command::Grid(id) => session.on_source_select(&id).map(|_| ()),
        Command::Pick(id, idx) => session.on_sample_select(&id, idx),
        Command::Click(id, idx, x, y) => session
            .on_point_click(&id, idx, x, y)
            .map(|full| info!(source = %id, sample_index = idx, x = full.x, y = full.y, "point marked")),
        Command::Commit(id, idx, tag) => {
            // reported through the outlet
            let _ = session.on_commit(&id, idx, &tag);
            Ok(())
        }
        Command::Cancel(id) => {
            session.on_cancel_selection(&id);
            Ok(())
        }
        Command::Status => {
            log_status(session.supervisor());
            Ok(())
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => Ok(()),
    };

    if let Err(e) = result {
        warn!("{}", e);
    }
}

fn log_status(supervisor: &Supervisor) {
    for id in supervisor.source_ids() {
        let status = supervisor.status(&id);
        let frames = supervisor.history(&id).map_or(0, |h| h.len());
        info!(source = %id, ?status, frames, "status");
    }
}
