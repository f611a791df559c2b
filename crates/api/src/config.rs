//! API server configuration loaded from the environment.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds, e.g. `0.0.0.0:8080`.
    pub bind_address: String,
    /// Pooled connection URL used for regular queries.
    pub database_url: String,
    /// Direct (non-pooled) URL for migrations; falls back to `database_url`.
    pub database_direct_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
        })
    }

    pub fn migration_url(&self) -> &str {
        self.database_direct_url.as_deref().unwrap_or(&self.database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env_requires_database_url() {
        std::env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/mailtide_test");
        std::env::remove_var("BIND_ADDRESS");
        std::env::remove_var("DATABASE_DIRECT_URL");

        let config = Config::from_env().expect("config");
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.migration_url(), "postgres://localhost/mailtide_test");

        std::env::remove_var("DATABASE_URL");
    }
}
