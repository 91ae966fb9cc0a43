use std::path::PathBuf;

use anyhow::{Context, Result};
use natter_db::IdScheme;

pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub id_scheme: IdScheme,
}

impl ServiceConfig {
    /// Read configuration from the environment, loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = lookup("NATTER_DB_PATH").unwrap_or_else(|| "natter.db".into());
        let id_scheme = match lookup("NATTER_ID_SCHEME") {
            Some(raw) => raw.parse::<IdScheme>().context("NATTER_ID_SCHEME")?,
            None => IdScheme::default(),
        };

        Ok(Self {
            db_path: db_path.into(),
            id_scheme,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: IN_MEMORY.into(),
            id_scheme: IdScheme::default(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY
    }
}
