//! Logging initialization

use tracing_subscriber::EnvFilter;

/// Install the global subscriber writing to stderr
///
/// `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().with_ansi(false).init();
    } else {
        builder.init();
    }
}
