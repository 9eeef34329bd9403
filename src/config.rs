use std::{collections::HashMap, path::PathBuf};

use anyhow::bail;
use config::{Config, ConfigError, Environment, File, FileFormat};
use log::{debug, trace};
use serde::Deserialize;

/// Resolved configuration for the CLI: where mirrors live and whether a
/// shared cache is staged between roots.
#[derive(Debug)]
pub struct RepocacheConfig {
    pub root_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub cache_local_packages: bool,
}

impl RepocacheConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_dir = config_dir();
        let raw_config = RawConfig::load(config_dir, None, None)?;

        let config = Self {
            root_dir: match raw_config.repositories.dir {
                Some(root_dir) => root_dir,
                None => default_root_dir()?,
            },
            cache_dir: raw_config.cache.dir,
            cache_local_packages: raw_config.cache.local_packages.unwrap_or(false),
        };
        trace!("Loaded configuration: {:?}", config);

        Ok(config)
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    repositories: RepositoriesConfig,
    #[serde(default)]
    cache: CacheConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RepositoriesConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    dir: Option<PathBuf>,
    local_packages: Option<bool>,
}

impl RawConfig {
    fn load(
        config_dir: Option<PathBuf>,
        config_override: Option<toml::Table>,
        env_override: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(mut path) = config_dir {
            path.push("config.toml");
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(false));
        }

        if let Some(config_override) = config_override {
            builder = builder.add_source(File::from_str(
                &config_override.to_string(),
                FileFormat::Toml,
            ));
        }

        builder
            .add_source(
                Environment::with_prefix("REPOCACHE")
                    .separator("_")
                    .source(env_override),
            )
            .build()?
            .try_deserialize()
    }
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REPOCACHE_CONFIG_DIR") {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let mut path = PathBuf::from(path);
        path.push("repocache");
        return Some(path);
    }
    if let Some(mut path) = home::home_dir() {
        path.push(".config");
        path.push("repocache");
        return Some(path);
    }
    None
}

fn default_root_dir() -> anyhow::Result<PathBuf> {
    if let Some(mut path) = home::home_dir() {
        path.push(".repocache");
        path.push("repositories");
        return Ok(path);
    }
    bail!("Could not find home dir. Please define $HOME env variable.")
}
