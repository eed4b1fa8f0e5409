//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`{PREFIX}_...`, nested keys split on `__`)
//! 2. The service configuration file (YAML, TOML or JSON by extension)
//! 3. Built-in defaults from the type's `Default` impl

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Build the figment used by [`load_layered`]; exposed so callers can add providers.
pub fn layered_figment<T>(path: Option<&Path>, env_prefix: &str) -> Result<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if path.exists() {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            figment = match extension {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                other => {
                    return Err(Error::Config(format!(
                        "Unsupported configuration format '{}' for {}",
                        other,
                        path.display()
                    )))
                },
            };
            info!("Using configuration file {}", path.display());
        } else {
            debug!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
        }
    }

    Ok(figment.merge(Env::prefixed(&format!("{}_", env_prefix.to_uppercase())).split("__")))
}

/// Load a configuration type from defaults, an optional file and the environment
pub fn load_layered<T>(path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    Ok(layered_figment::<T>(path, env_prefix)?.extract()?)
}
