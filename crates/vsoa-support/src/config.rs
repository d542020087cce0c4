use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Common `[logging]` table shared by every VSOA config file; passed straight through to
/// `sloggers::LoggerConfig` once re-serialized.
#[derive(Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub destination: String,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            kind: "terminal".to_owned(),
            level: "debug".to_owned(),
            destination: "stderr".to_owned(),
        }
    }
}

impl LoggingConfig {
    pub fn build_logger(&self) -> slog::Logger {
        let toml = serdeconv::to_toml_string(self).expect("logging config is always serializable");
        crate::logging::build(&toml)
    }
}

/// Loads a TOML config file into `T`, the way `GameConfig::load` does.
pub fn load_toml_file<T, P: AsRef<Path>>(path: P) -> T
where
    T: serde::de::DeserializeOwned,
{
    serdeconv::from_toml_file(path).expect("error loading VSOA configuration file")
}
