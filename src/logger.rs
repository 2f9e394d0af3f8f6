use crate::config_loader::LoggingConfig;
use env_logger::{Builder, Env};
use std::io::Write;

/// Initializes the diagnostic logger. `RUST_LOG` still wins over the
/// configured level.
pub fn init(config: &LoggingConfig) {
    Builder::from_env(Env::default().default_filter_or(&config.level))
        .format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()))
        .init();
}
