//! Application configuration

pub mod service;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use service::ServiceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub service: ServiceConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let service = match env::var("CONFAB_CONFIG") {
            Ok(path) => ServiceConfig::from_file(&PathBuf::from(path))?,
            Err(_) => ServiceConfig::default(),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            data_dir: env::var("CONFAB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            service,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("confab.db")
    }
}
