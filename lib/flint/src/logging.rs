pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a logger from a TOML configuration string.
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("Bad logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Default terminal logger on stderr.
pub fn init() -> Logger {
    from_toml(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
