//! Terminal front end

pub mod cli;

pub use cli::{run_chat, run_config, run_repl, run_tools, ReplSettings};
