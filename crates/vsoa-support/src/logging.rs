use slog::Logger;
use sloggers::{Config, LoggerConfig};

/// Builds the default terminal logger used when a component is not handed one explicitly.
///
/// Mirrors the inline-TOML `LoggerConfig` pattern used across the codebase: logging is
/// always configured through `sloggers`, never through ad-hoc `println!`.
pub fn default_logger() -> Logger {
    build(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
}

/// Builds a logger from an inline TOML `LoggerConfig` document, as loaded from a config file's
/// `[logging]` table.
pub fn build(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("invalid logger config");
    config.build_logger().expect("failed to build logger")
}
