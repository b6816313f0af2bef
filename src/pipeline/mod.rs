pub mod handoff;
pub mod history;

pub use handoff::{HandoffHub, HandoffReceiver, HandoffSender, Preview};
pub use history::{HistoryBuffer, HistoryEntry, Sample};
