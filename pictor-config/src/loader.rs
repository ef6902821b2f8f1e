//! Layered configuration loading.
//!
//! Sources, lowest precedence first: baked-in defaults, an optional TOML
//! file, then `PICTOR_`-prefixed environment variables
//! (`PICTOR_SERVER__PORT=9000` overrides `server.port`).

use std::path::Path;

use config::{Environment, File, FileFormat};
use thiserror::Error;

use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config::ConfigError),

    #[error("configuration file not found: {0}")]
    MissingFile(String),
}

/// Load configuration, optionally from an explicit file path.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigLoadError> {
    let mut builder = config::Config::builder();

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigLoadError::MissingFile(
                    path.display().to_string(),
                ));
            }
            builder = builder.add_source(
                File::from(path).format(FileFormat::Toml).required(true),
            );
        }
        None => {
            builder = builder
                .add_source(File::with_name("pictor").required(false));
        }
    }

    let settings = builder
        .add_source(
            Environment::with_prefix("PICTOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = load(None).expect("defaults must load");
        assert_eq!(config.extensions.stop_grace_ms, 5_000);
        assert_eq!(config.watch.debounce_window_ms, 250);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\n\n[extensions]\nroot = \"/srv/ext\""
        )
        .unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.extensions.root.to_str(), Some("/srv/ext"));
        // untouched sections keep their defaults
        assert_eq!(config.extensions.connect_timeout_ms, 10_000);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/nonexistent/pictor.toml")))
            .expect_err("must fail");
        assert!(matches!(err, ConfigLoadError::MissingFile(_)));
    }
}
