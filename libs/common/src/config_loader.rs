//! Configuration loading helper functions
//!
//! Layered loading: struct defaults, then the config file (YAML or JSON by
//! extension), then prefixed environment variables split on `__`.

use std::path::Path;

use errors::ScoutResult;
use figment::{
    providers::{Env, Format, Json, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

/// Build the layered figment for `T`
///
/// A missing file is not an error; defaults and environment still apply.
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> Figment
where
    T: Serialize + Default,
{
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = path {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("yaml")
            .to_ascii_lowercase();
        figment = match extension.as_str() {
            "json" => figment.merge(Json::file(path)),
            _ => figment.merge(Yaml::file(path)),
        };
        if path.exists() {
            info!("Config file: {}", path.display());
        } else {
            warn!("Config file {} not found, using defaults", path.display());
        }
    }

    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load a configuration struct with defaults < file < environment
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> ScoutResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let config = figment_for::<T>(path, env_prefix).extract()?;
    debug!("Configuration loaded (env prefix {})", env_prefix);
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        timeout_ms: u64,
        nested: Nested,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(default)]
    struct Nested {
        depth: u32,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".into(),
                timeout_ms: 5000,
                nested: Nested::default(),
            }
        }
    }

    impl Default for Nested {
        fn default() -> Self {
            Self { depth: 8 }
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config: Sample =
            load_layered(Some(Path::new("/nonexistent/scout.yaml")), "CLT_MISSING_").unwrap();
        assert_eq!(config, Sample::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "name: ied\nnested:\n  depth: 3").unwrap();

        let config: Sample = load_layered(Some(file.path()), "CLT_YAML_").unwrap();
        assert_eq!(config.name, "ied");
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.nested.depth, 3);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("scout.yaml", "timeout_ms: 100")?;
            jail.set_env("CLT_ENV_TIMEOUT_MS", "250");
            jail.set_env("CLT_ENV_NESTED__DEPTH", "2");

            let config: Sample = load_layered(Some(Path::new("scout.yaml")), "CLT_ENV_")
                .map_err(|e| e.to_string())?;
            assert_eq!(config.timeout_ms, 250);
            assert_eq!(config.nested.depth, 2);
            Ok(())
        });
    }
}
