pub mod router;

pub use router::{DisplayRouter, PreviewBoard};
