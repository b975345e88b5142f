pub mod config;
pub mod events;
pub mod prompt;
pub mod types;
pub mod verdict;

pub use config::Config;
pub use types::*;
pub use verdict::{parse_verdict, select_winner, Selection, Verdict};
