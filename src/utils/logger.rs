use colored::{ColoredString, Colorize};
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::io::Write;

use super::config::PackagePaths;

/// Last segment of a module path (`casewatch::worker::pool` -> `pool`).
fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Initialise logging for the binary. Library code never calls this.
pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let pkg = PackagePaths::get().pkg_name();
    let _ = Builder::from_default_env()
        .filter_level(LevelFilter::Warn) // Default: only warnings from dependencies
        .filter_module(pkg, level) // Our crate: use requested level
        .format(move |buf, record| {
            let name = pkg.cyan();
            let ts = buf.timestamp_seconds();
            let line = match record.level() {
                Level::Error | Level::Warn => {
                    let level_str = match record.level() {
                        Level::Warn => "WARN".yellow(),
                        _ => "ERROR".red(),
                    };
                    let path = record.target().to_string().white();
                    format!("{} [{} {} {}] {}", ts, name, level_str, path, record.args())
                }
                Level::Info => format!("{} [{}] {}", ts, name, record.args()),
                Level::Debug | Level::Trace => format!(
                    "{} [{} {}] {}",
                    ts,
                    name,
                    short_target(record.target()).dimmed(),
                    record.args()
                ),
            };
            writeln!(buf, "{}", line)
        })
        .try_init();
}

/// Status words colored for terminal output.
pub fn colorize_status(status: &str) -> ColoredString {
    match status {
        "processing_done" => status.green(),
        "processing_started" => status.yellow(),
        "task_created" | "processing_case" => status.cyan(),
        _ => status.normal(),
    }
}
