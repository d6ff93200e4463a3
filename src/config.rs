use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::tuning::DEFAULT_GROW_BY;

#[cfg(test)]
#[test]
fn load_example_config() {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(
            include_str!("../config.example.toml"),
            config::FileFormat::Toml,
        ))
        .build()
        .unwrap();

    let config = settings.try_deserialize::<Config>().unwrap();
    println!("{config:?}");
    assert_eq!(config.jobs.poll_interval(), Duration::from_millis(50));
    assert!(config.database.rebuild_on_corrupt);
}

#[cfg(test)]
#[test]
fn missing_sections_use_defaults() {
    let config = config::Config::builder()
        .add_source(config::File::from_str(
            "[database]\npath = \"index.db\"\n",
            config::FileFormat::Toml,
        ))
        .build()
        .unwrap()
        .try_deserialize::<Config>()
        .unwrap();
    assert_eq!(config.database.grow_by, DEFAULT_GROW_BY);
    assert_eq!(config.log.level, "info");
    assert_eq!(config, Config::for_database("index.db".into()));
}

/// Load the config from the TOML file at `path`
pub fn open(path: PathBuf) -> Result<Config> {
    let config_file = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {path:?}"))?;
    let settings = config::Config::builder()
        .add_source(config::File::from_str(
            &config_file,
            config::FileFormat::Toml,
        ))
        .build()?
        .try_deserialize()?;
    Ok(settings)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// database configuration
    pub database: Database,
    /// background job scheduling
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// the default configuration, using the database at `path`
    pub fn for_database(path: PathBuf) -> Self {
        Self {
            database: Database {
                path,
                rebuild_on_corrupt: default_true(),
                grow_by: default_grow_by(),
            },
            jobs: Jobs::default(),
            log: Log::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Database {
    /// the index file. created if it does not exist
    pub path: PathBuf,
    /// throw away (and rebuild) a database file that can not be used, instead
    /// of refusing to start
    #[serde(default = "default_true")]
    pub rebuild_on_corrupt: bool,
    /// minimum number of bytes to grow the file by when it is full
    #[serde(default = "default_grow_by")]
    pub grow_by: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Jobs {
    /// how often a waiting foreground job checks for cancellation
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Jobs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Log {
    /// default filter directive, `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grow_by() -> u64 {
    DEFAULT_GROW_BY
}

fn default_poll_interval() -> u64 {
    50
}

fn default_level() -> String {
    "info".into()
}
