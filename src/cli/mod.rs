//! CLI command handling module
//!
//! Handles all CLI subcommands and argument parsing.

mod commands;
pub mod logging;
mod run;
mod version;

pub use commands::{ConfigSubcommand, handle_config_command};
pub use logging::init_logging;
pub use run::{RunOptions, resolve_config, run};
pub use version::display_version;
