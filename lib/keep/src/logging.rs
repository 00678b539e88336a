pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default logger used by the binaries: terminal output on
/// stderr, debug level.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing default logger configuration");

    from_config(&config)
}

/// Builds a logger from a `sloggers` configuration section.
pub fn from_config(config: &LoggerConfig) -> Logger {
    config.build_logger().expect("Error building logger")
}
