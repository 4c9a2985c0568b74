use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_KEY_PREFIX: &str = "authz";
pub const DEFAULT_EVENT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

impl FromStr for CacheBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "memory" => Ok(CacheBackend::Memory),
            "redis" => Ok(CacheBackend::Redis),
            other => Err(AppError::configuration(format!(
                "CACHE_BACKEND must be 'memory' or 'redis', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: Option<String>,
    /// Lifetime of a cached matrix
    pub ttl: Duration,
    /// Lifetime of the role/group reverse indices; never shorter than `ttl`
    pub index_ttl: Duration,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(DEFAULT_CACHE_TTL_SECS);
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            ttl,
            index_ttl: ttl * 2,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let backend = lookup("CACHE_BACKEND")
            .map(|v| v.parse::<CacheBackend>())
            .transpose()?
            .unwrap_or(CacheBackend::Memory);

        let redis_url = lookup("REDIS_URL").filter(|v| !v.trim().is_empty());
        if backend == CacheBackend::Redis && redis_url.is_none() {
            return Err(AppError::configuration("REDIS_URL must be set when CACHE_BACKEND=redis"));
        }

        let ttl_secs: u64 = parse_var(&lookup, "CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?;
        if ttl_secs == 0 {
            return Err(AppError::configuration("CACHE_TTL_SECS must be greater than zero"));
        }
        let index_ttl_secs: u64 = parse_var(&lookup, "CACHE_INDEX_TTL_SECS", ttl_secs * 2)?;
        if index_ttl_secs < ttl_secs {
            return Err(AppError::configuration(
                "CACHE_INDEX_TTL_SECS must not be shorter than CACHE_TTL_SECS",
            ));
        }

        let key_prefix = lookup("CACHE_KEY_PREFIX")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        Ok(Self {
            backend,
            redis_url,
            ttl: Duration::from_secs(ttl_secs),
            index_ttl: Duration::from_secs(index_ttl_secs),
            key_prefix,
        })
    }
}

/// Settings for the engine itself. JWT settings live in [`crate::jwt::JwtConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub event_concurrency: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let event_concurrency: usize =
            parse_var(&lookup, "EVENT_HANDLER_CONCURRENCY", DEFAULT_EVENT_CONCURRENCY)?;
        if event_concurrency == 0 {
            return Err(AppError::configuration("EVENT_HANDLER_CONCURRENCY must be at least 1"));
        }

        Ok(Self {
            cache: CacheConfig::from_lookup(&lookup)?,
            event_concurrency,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            event_concurrency: DEFAULT_EVENT_CONCURRENCY,
        }
    }
}

/// Listener settings read by the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    pub tls: Option<(String, String)>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| AppError::configuration("DATABASE_URL not set"))?;
        let port = parse_var(&lookup, "APP_PORT", DEFAULT_PORT)?;

        let tls = match (lookup("CERT_PATH"), lookup("KEY_PATH")) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            (None, None) => None,
            (Some(c), Some(k)) if c.is_empty() && k.is_empty() => None,
            _ => {
                return Err(AppError::configuration("CERT_PATH and KEY_PATH must be set together"));
            }
        };

        Ok(Self { database_url, port, tls })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::configuration(format!("{key} must be a valid number"))),
        _ => Ok(default),
    }
}
