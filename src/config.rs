use std::path::PathBuf;

use serde::Deserialize;
use structopt::StructOpt;
use thiserror::Error;

/// Command line arguments. `ENVTYPE` is the primary selector for which
/// config file to load; the flag exists mostly so it can be overridden
/// without touching the environment in tests or one-off runs.
#[derive(Clone, Debug, StructOpt)]
#[structopt(rename_all = "kebab")]
pub struct Args {
    #[structopt(long = "envtype", env = "ENVTYPE", default_value = "development")]
    pub envtype: String,
}

/// Config file contents, read from `bin/config/twitch-irc/<ENVTYPE>.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: String,
    pub addresses: Addresses,
    pub ports: Ports,
    pub database: DatabaseConfig,
    pub channels_per_listener: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "twitch-irc".to_owned(),
            version: "1.0.0".to_owned(),
            addresses: Addresses::default(),
            ports: Ports::default(),
            database: DatabaseConfig::default(),
            channels_per_listener: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Addresses {
    pub event: String,
    pub chat: String,
}

impl Default for Addresses {
    fn default() -> Self {
        Addresses {
            event: "127.0.0.1".to_owned(),
            chat: "127.0.0.1".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ports {
    pub event: u16,
    pub irc: u16,
    pub chat: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            event: 3000,
            irc: 3001,
            chat: 3003,
        }
    }
}

/// `replset` is carried through verbatim because the external JSON contract
/// names it, but a Postgres connection has no use for it (see `db.rs`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub urls: Vec<String>,
    pub replset: String,
    pub db_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            urls: vec!["localhost:56789".to_owned()],
            replset: String::new(),
            db_name: "opera_gather_template".to_owned(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoadConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config contents: {0}")]
    ParseContents(#[from] serde_json::Error),
}

pub fn config_path(envtype: &str) -> PathBuf {
    PathBuf::from("bin/config/twitch-irc").join(format!("{envtype}.json"))
}

pub async fn load_config(args: &Args) -> Result<Config, LoadConfigError> {
    let path = config_path(&args.envtype);
    let file_contents = tokio::fs::read(&path)
        .await
        .map_err(|e| LoadConfigError::ReadFile(path.clone(), e))?;
    let config = serde_json::from_slice(&file_contents)?;
    Ok(config)
}
