//! Line-oriented operator commands for the headless binary

use std::str::FromStr;

use thiserror::Error;

use crate::capture::SourceId;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pause(SourceId),
    PauseAll,
    Solo(SourceId),
    Grid(SourceId),
    Pick(SourceId, usize),
    Click(SourceId, usize, f64, f64),
    Commit(SourceId, usize, String),
    Cancel(SourceId),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &str = "\
pause <source>                      toggle capture for one source
all                                 toggle capture for every source
solo <source>                       run only this source
grid <source>                       sample the source's history
pick <source> <index>               choose a sample from the grid
click <source> <index> <x> <y>      mark a point in display coordinates
commit <source> <index> <tag>       save the marked sample (tag: a, s, d, f)
cancel <source>                     close the grid
status                              list sources
quit                                shut down";

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let args: Vec<&str> = words.collect();

        let cmd = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("pause", [id]) => Command::Pause(SourceId::new(*id)),
            ("pause", _) => return Err(CommandError::Usage("pause <source>")),
            ("all", []) => Command::PauseAll,
            ("solo", [id]) => Command::Solo(SourceId::new(*id)),
            ("solo", _) => return Err(CommandError::Usage("solo <source>")),
            ("grid", [id]) => Command::Grid(SourceId::new(*id)),
            ("grid", _) => return Err(CommandError::Usage("grid <source>")),
            ("pick", [id, idx]) => Command::Pick(
                SourceId::new(*id),
                idx.parse()
                    .map_err(|_| CommandError::Usage("pick <source> <index>"))?,
            ),
            ("pick", _) => return Err(CommandError::Usage("pick <source> <index>")),
            ("click", [id, idx, x, y]) => {
                const USAGE: &str = "click <source> <index> <x> <y>";
                Command::Click(
                    SourceId::new(*id),
                    idx.parse().map_err(|_| CommandError::Usage(USAGE))?,
                    x.parse().map_err(|_| CommandError::Usage(USAGE))?,
                    y.parse().map_err(|_| CommandError::Usage(USAGE))?,
                )
            }
            ("click", _) => return Err(CommandError::Usage("click <source> <index> <x> <y>")),
            ("commit", [id, idx, tag]) => Command::Commit(
                SourceId::new(*id),
                idx.parse()
                    .map_err(|_| CommandError::Usage("commit <source> <index> <tag>"))?,
                tag.to_string(),
            ),
            ("commit", _) => return Err(CommandError::Usage("commit <source> <index> <tag>")),
            ("cancel", [id]) => Command::Cancel(SourceId::new(*id)),
            ("cancel", _) => return Err(CommandError::Usage("cancel <source>")),
            ("status", []) => Command::Status,
            ("help" | "?", _) => Command::Help,
            ("quit" | "exit" | "q", []) => Command::Quit,
            _ => return Err(CommandError::Unknown(line.trim().to_string())),
        };
        Ok(cmd)
    }
}
