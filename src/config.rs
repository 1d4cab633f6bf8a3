use std::path::PathBuf;
use std::str::FromStr;

use crate::model::BoundaryPolicy;

/// Signing key used when `ROOMBOOK_JWT_SECRET` is unset. Development only.
pub const DEV_JWT_SECRET: &str = "roombook-dev-secret-change-me";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Administrator account created at startup when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminBootstrap {
    pub matricula: String,
    pub password: String,
    pub email: String,
    pub name: String,
}

/// Outgoing mail relay. Absent when `ROOMBOOK_SMTP_HOST` is unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Server configuration, read from `ROOMBOOK_*` environment variables.
///
/// | Env Var                       | Default                 |
/// |-------------------------------|-------------------------|
/// | `ROOMBOOK_BIND`               | `0.0.0.0`               |
/// | `ROOMBOOK_PORT`               | `7878`                  |
/// | `ROOMBOOK_DATA_DIR`           | `./data`                |
/// | `ROOMBOOK_MAX_CONNECTIONS`    | `256`                   |
/// | `ROOMBOOK_COMPACT_THRESHOLD`  | `1000`                  |
/// | `ROOMBOOK_METRICS_PORT`       | unset                   |
/// | `ROOMBOOK_JWT_SECRET`         | [`DEV_JWT_SECRET`]      |
/// | `ROOMBOOK_SESSION_TTL_SECS`   | `86400`                 |
/// | `ROOMBOOK_RESET_TTL_SECS`     | `3600`                  |
/// | `ROOMBOOK_BASE_URL`           | `http://localhost:7878` |
/// | `ROOMBOOK_BOUNDARY`           | `inclusive`             |
/// | `ROOMBOOK_REQUIRE_APPROVAL`   | `false`                 |
/// | `ROOMBOOK_ADMIN_*`            | unset                   |
/// | `ROOMBOOK_SMTP_HOST`          | unset (mail is logged)  |
/// | `ROOMBOOK_SMTP_PORT`          | `587`                   |
/// | `ROOMBOOK_SMTP_FROM`          | `noreply@roombook.local`|
/// | `ROOMBOOK_SMTP_USER`          | unset                   |
/// | `ROOMBOOK_SMTP_PASSWORD`      | unset                   |
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub jwt_secret: String,
    /// `false` when the development secret is in use.
    pub jwt_secret_configured: bool,
    pub session_ttl_secs: i64,
    pub reset_ttl_secs: i64,
    pub base_url: String,
    pub boundary: BoundaryPolicy,
    pub require_approval: bool,
    pub admin: Option<AdminBootstrap>,
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; tests pass a map instead of the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("ROOMBOOK_JWT_SECRET");
        let boundary = match get("ROOMBOOK_BOUNDARY") {
            None => BoundaryPolicy::default(),
            Some(v) => BoundaryPolicy::parse(&v).ok_or(ConfigError::Invalid {
                var: "ROOMBOOK_BOUNDARY",
                expected: "inclusive or half_open",
                value: v,
            })?,
        };

        let admin = match (
            get("ROOMBOOK_ADMIN_MATRICULA"),
            get("ROOMBOOK_ADMIN_PASSWORD"),
        ) {
            (Some(matricula), Some(password)) => Some(AdminBootstrap {
                email: get("ROOMBOOK_ADMIN_EMAIL")
                    .unwrap_or_else(|| format!("{matricula}@roombook.local")),
                name: get("ROOMBOOK_ADMIN_NAME").unwrap_or_else(|| "Administrator".into()),
                matricula,
                password,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Empty("ROOMBOOK_ADMIN_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::Empty("ROOMBOOK_ADMIN_MATRICULA")),
        };

        let smtp = match get("ROOMBOOK_SMTP_HOST") {
            None => None,
            Some(host) => Some(SmtpConfig {
                host,
                port: parse_or(&get, "ROOMBOOK_SMTP_PORT", "a port number", 587)?,
                from: get("ROOMBOOK_SMTP_FROM").unwrap_or_else(|| "noreply@roombook.local".into()),
                user: get("ROOMBOOK_SMTP_USER"),
                password: get("ROOMBOOK_SMTP_PASSWORD"),
            }),
        };

        Ok(Self {
            bind: get("ROOMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "ROOMBOOK_PORT", "a port number", 7878)?,
            data_dir: get("ROOMBOOK_DATA_DIR")
                .map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            max_connections: parse_or(&get, "ROOMBOOK_MAX_CONNECTIONS", "a positive integer", 256)?,
            compact_threshold: parse_or(&get, "ROOMBOOK_COMPACT_THRESHOLD", "a positive integer", 1000)?,
            metrics_port: parse_opt(&get, "ROOMBOOK_METRICS_PORT", "a port number")?,
            jwt_secret_configured: jwt_secret.is_some(),
            jwt_secret: jwt_secret.unwrap_or_else(|| DEV_JWT_SECRET.into()),
            session_ttl_secs: parse_or(&get, "ROOMBOOK_SESSION_TTL_SECS", "seconds", 86_400)?,
            reset_ttl_secs: parse_or(&get, "ROOMBOOK_RESET_TTL_SECS", "seconds", 3_600)?,
            base_url: get("ROOMBOOK_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://localhost:7878".into()),
            boundary,
            require_approval: parse_bool(&get, "ROOMBOOK_REQUIRE_APPROVAL")?,
            admin,
            smtp,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|v| {
            v.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value: v.clone(),
            })
        })
        .transpose()
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, var, expected)?.unwrap_or(default))
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<bool, ConfigError> {
    let Some(v) = get(var) else { return Ok(false) };
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            expected: "a boolean",
            value: v,
        }),
    }
}
