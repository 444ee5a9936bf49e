use std::path::PathBuf;

use serde::Deserialize;

use crate::middleware::auth::TokenPolicy;

const PLACEHOLDER_ADMIN_PASSWORD: &str = "admin";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// `postgres://...` for PostgreSQL, `memory://` for the in-process store.
    pub database_url: String,
    /// Blob store location: `file://`, `s3://` or `memory://`.
    pub blob_store_url: String,
    /// Session token lifetime in minutes.
    /// Set via KOI_TOKEN_LIFETIME_MINUTES. Default: 60.
    pub token_lifetime_minutes: i64,
    /// Tokens with less than this many minutes left are renewed on use.
    /// Set via KOI_TOKEN_RENEW_MINUTES. Default: 10.
    pub token_renew_minutes: i64,
    /// Extra bootstrap document applied after the built-in one.
    pub bootstrap_file: Option<PathBuf>,
    pub admin_password: String,
}

impl Config {
    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            lifetime: chrono::Duration::minutes(self.token_lifetime_minutes),
            renew_within: chrono::Duration::minutes(self.token_renew_minutes),
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.starts_with("memory://")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "memory://".into(),
            blob_store_url: "memory://".into(),
            token_lifetime_minutes: 60,
            token_renew_minutes: 10,
            bootstrap_file: None,
            admin_password: PLACEHOLDER_ADMIN_PASSWORD.into(),
        }
    }
}

fn env_minutes(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|m: &i64| *m > 0)
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let admin_password = std::env::var("KOI_ADMIN_PASSWORD")
        .unwrap_or_else(|_| PLACEHOLDER_ADMIN_PASSWORD.into());

    if admin_password == PLACEHOLDER_ADMIN_PASSWORD {
        let env_mode = std::env::var("KOI_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "KOI_ADMIN_PASSWORD is still the insecure placeholder. \
                 Set a proper admin password before running in production."
            );
        }
        eprintln!("warning: KOI_ADMIN_PASSWORD is not set, the admin user gets the default password");
    }

    let token_lifetime_minutes = env_minutes("KOI_TOKEN_LIFETIME_MINUTES", 60);
    let token_renew_minutes = env_minutes("KOI_TOKEN_RENEW_MINUTES", 10);
    if token_renew_minutes > token_lifetime_minutes {
        anyhow::bail!(
            "KOI_TOKEN_RENEW_MINUTES ({}) must not exceed KOI_TOKEN_LIFETIME_MINUTES ({})",
            token_renew_minutes,
            token_lifetime_minutes
        );
    }

    Ok(Config {
        port: std::env::var("KOI_PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse()
            .unwrap_or(8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/koi".into()),
        blob_store_url: std::env::var("KOI_BLOB_STORE_URL")
            .unwrap_or_else(|_| "file://./data/blobs".into()),
        token_lifetime_minutes,
        token_renew_minutes,
        bootstrap_file: std::env::var("KOI_BOOTSTRAP_FILE").ok().map(PathBuf::from),
        admin_password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_token_policy() {
        let policy = Config::default().token_policy();
        assert_eq!(policy.lifetime, chrono::Duration::minutes(60));
        assert_eq!(policy.renew_within, chrono::Duration::minutes(10));
    }

    #[test]
    fn test_memory_store_detection() {
        let mut config = Config::default();
        assert!(config.uses_memory_store());
        config.database_url = "postgres://localhost/koi".into();
        assert!(!config.uses_memory_store());
    }
}
