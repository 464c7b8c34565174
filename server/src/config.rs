//! Configuration management for the server.

use std::env;

/// Default size of the database connection pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Upper bound of pooled database connections
    pub max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let max_connections = match env::var("MAX_CONNECTIONS") {
            Ok(value) => parse_max_connections(&value)?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(Self {
            host,
            port,
            database_url,
            max_connections,
        })
    }
}

fn parse_max_connections(value: &str) -> Result<u32, ConfigError> {
    match value.parse() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidMaxConnections),
        Ok(n) => Ok(n),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid MAX_CONNECTIONS value")]
    InvalidMaxConnections,
}
