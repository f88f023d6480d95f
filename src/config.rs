use anyhow::Context;
use axum::http::HeaderValue;
use serde::Deserialize;

/// Shortest HMAC-SHA256 secret accepted for signing tokens.
pub const MIN_SECRET_LEN: usize = 32;

/// Longest token lifetime accepted, in days.
pub const MAX_TTL_DAYS: i64 = 3650;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub http: HttpConfig,
    pub cors_origin: String,
    /// Roles every newly registered account is added to.
    pub default_roles: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is not set")?;

        let secret = lookup("JWT_SECRET").context("JWT_SECRET is not set")?;
        anyhow::ensure!(
            secret.len() >= MIN_SECRET_LEN,
            "JWT_SECRET must be at least {} bytes",
            MIN_SECRET_LEN
        );
        let ttl_days = match lookup("JWT_TTL_DAYS") {
            Some(v) => v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("invalid JWT_TTL_DAYS {v:?}"))?,
            None => 7,
        };
        anyhow::ensure!(
            (1..=MAX_TTL_DAYS).contains(&ttl_days),
            "JWT_TTL_DAYS must be between 1 and {}, got {}",
            MAX_TTL_DAYS,
            ttl_days
        );

        let port = match lookup("APP_PORT") {
            Some(v) => v.parse::<u16>().with_context(|| format!("invalid APP_PORT {v:?}"))?,
            None => 8080,
        };
        let http = HttpConfig {
            host: lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
        };

        let cors_origin =
            lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".into());
        HeaderValue::from_str(&cors_origin)
            .with_context(|| format!("invalid CORS_ORIGIN {cors_origin:?}"))?;

        let default_roles = lookup("ACCOUNT_DEFAULT_ROLES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            jwt: JwtConfig { secret, ttl_days },
            http,
            cors_origin,
            default_roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let cfg = load(&[("DATABASE_URL", "postgres://db"), ("JWT_SECRET", SECRET)])
            .expect("config loads");
        assert_eq!(cfg.jwt.ttl_days, 7);
        assert_eq!(cfg.http.host, "0.0.0.0");
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.cors_origin, "http://localhost:3000");
        assert!(cfg.default_roles.is_empty());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = load(&[("DATABASE_URL", "postgres://db")]).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn short_secret_is_rejected() {
        let err = load(&[("DATABASE_URL", "postgres://db"), ("JWT_SECRET", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn default_roles_are_split_and_trimmed() {
        let cfg = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", SECRET),
            ("ACCOUNT_DEFAULT_ROLES", " Member, ,Reader "),
            ("JWT_TTL_DAYS", "1"),
            ("APP_PORT", "9000"),
        ])
        .expect("config loads");
        assert_eq!(cfg.default_roles, vec!["Member", "Reader"]);
        assert_eq!(cfg.jwt.ttl_days, 1);
        assert_eq!(cfg.http.port, 9000);
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(load(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", SECRET),
            ("APP_PORT", "eighty"),
        ])
        .is_err());
    }

    #[test]
    fn unparsable_ttl_is_an_error() {
        let err = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", SECRET),
            ("JWT_TTL_DAYS", "a week"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("JWT_TTL_DAYS"));
    }

    #[test]
    fn out_of_range_ttl_is_an_error() {
        for ttl in ["0", "-3", "100000000"] {
            let err = load(&[
                ("DATABASE_URL", "postgres://db"),
                ("JWT_SECRET", SECRET),
                ("JWT_TTL_DAYS", ttl),
            ])
            .unwrap_err();
            assert!(err.to_string().contains("between 1 and"), "ttl {ttl}");
        }
    }

    #[test]
    fn longest_ttl_is_accepted() {
        let cfg = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", SECRET),
            ("JWT_TTL_DAYS", "3650"),
        ])
        .expect("config loads");
        assert_eq!(cfg.jwt.ttl_days, MAX_TTL_DAYS);
    }
}
