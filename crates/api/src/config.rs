//! API server configuration

use anyhow::Context;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Secret used to verify session bearer tokens. Session issuance is
    /// handled by the external auth service; this server only verifies.
    pub jwt_secret: String,
    /// Origins allowed by CORS, comma separated
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            port,
            jwt_secret,
            cors_allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/costscope_test");
        std::env::set_var("JWT_SECRET", "test-secret");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        set_required_env();
        std::env::remove_var("PORT");
        std::env::remove_var("CORS_ALLOWED_ORIGINS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    #[serial]
    fn test_cors_origins_parsed() {
        set_required_env();
        std::env::set_var(
            "CORS_ALLOWED_ORIGINS",
            "https://app.costscope.dev, https://staging.costscope.dev",
        );

        let config = Config::from_env().unwrap();
        assert_eq!(config.cors_allowed_origins.len(), 2);
        assert_eq!(config.cors_allowed_origins[0], "https://app.costscope.dev");
        std::env::remove_var("CORS_ALLOWED_ORIGINS");
    }

    #[test]
    #[serial]
    fn test_missing_database_url_fails() {
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("JWT_SECRET", "test-secret");
        assert!(Config::from_env().is_err());
    }
}
