//! Guard rails applied after loading.

use url::Url;

use crate::models::Config;

/// Non-fatal findings surfaced to the operator at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    MissingDatabaseUrl,
    UnparseableBaseUrl(String),
    ZeroGracePeriod,
    UnpackedInsideInstalledTree,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingDatabaseUrl => f.write_str(
                "no database url configured; persistence is unavailable",
            ),
            ConfigWarning::UnparseableBaseUrl(url) => {
                write!(f, "web_services_base_url does not parse: {url}")
            }
            ConfigWarning::ZeroGracePeriod => f.write_str(
                "stop_grace_ms is 0; children will be killed immediately",
            ),
            ConfigWarning::UnpackedInsideInstalledTree => f.write_str(
                "unpacked_root lies inside the installed tree; symlinked \
                 entries would shadow themselves",
            ),
        }
    }
}

/// Validate a loaded configuration, returning every warning found.
pub fn validate(config: &Config) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.database.url.is_none() {
        warnings.push(ConfigWarning::MissingDatabaseUrl);
    }

    if Url::parse(&config.extensions.web_services_base_url).is_err() {
        warnings.push(ConfigWarning::UnparseableBaseUrl(
            config.extensions.web_services_base_url.clone(),
        ));
    }

    if config.extensions.stop_grace_ms == 0 {
        warnings.push(ConfigWarning::ZeroGracePeriod);
    }

    if let Some(unpacked) = &config.extensions.unpacked_root {
        if unpacked.starts_with(&config.extensions.root) {
            warnings.push(ConfigWarning::UnpackedInsideInstalledTree);
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_warns_about_database_only() {
        let warnings = validate(&Config::default());
        assert_eq!(warnings, vec![ConfigWarning::MissingDatabaseUrl]);
    }

    #[test]
    fn nested_unpacked_root_is_flagged() {
        let mut config = Config::default();
        config.database.url = Some("postgres://localhost/pictor".into());
        config.extensions.unpacked_root =
            Some(config.extensions.root.join("unpacked"));
        let warnings = validate(&config);
        assert!(
            warnings.contains(&ConfigWarning::UnpackedInsideInstalledTree)
        );
    }
}
