//! Binary plumbing: argument parsing, command handlers, path helpers.

pub mod arg_parser;
pub mod handlers;
pub mod tools;

pub use arg_parser::{Cli, Commands, CommonArgs, WatchArgs};
pub use handlers::{handle_agent, handle_run, handle_status, handle_watch};
pub use tools::{is_strict_ancestor, normalize_lexically, path_relative_to};
