use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::artifact::ArtifactPins;
use crate::features::UnknownFields;

/// Largest accepted `RATE_LIMIT_PER_SECOND`; the limiter's replenish
/// interval has nanosecond resolution.
pub const MAX_RATE_LIMIT_PER_SECOND: u64 = 1_000_000_000;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub expected_model_version: Option<String>,
    pub expected_model_sha256: Option<String>,
    pub request_timeout: Duration,
    pub max_concurrent_scoring: usize,
    pub max_batch_size: usize,
    pub max_body_bytes: usize,
    /// Requests per second per client IP; 0 disables rate limiting.
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub strict_fields: bool,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_path: PathBuf::from("models/msme_risk_model.json"),
            expected_model_version: None,
            expected_model_sha256: None,
            request_timeout: Duration::from_millis(2000),
            max_concurrent_scoring: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_batch_size: 100,
            max_body_bytes: 1024 * 1024,
            rate_limit_per_second: 50,
            rate_limit_burst: 100,
            strict_fields: true,
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            host: lookup("HOST")
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .unwrap_or(defaults.host),
            port: lookup("PORT")
                .unwrap_or_else(|| defaults.port.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            model_path: lookup("MODEL_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            expected_model_version: lookup("MODEL_EXPECTED_VERSION")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            expected_model_sha256: lookup("MODEL_SHA256")
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .map(|digest| {
                    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                        anyhow::bail!("MODEL_SHA256 must be a 64 character hex digest");
                    }
                    Ok(digest)
                })
                .transpose()?,
            request_timeout: parse_or(&lookup, "REQUEST_TIMEOUT_MS", 2000u64).and_then(|ms| {
                if ms == 0 {
                    anyhow::bail!("REQUEST_TIMEOUT_MS must be greater than 0");
                }
                Ok(Duration::from_millis(ms))
            })?,
            max_concurrent_scoring: parse_or(
                &lookup,
                "MAX_CONCURRENT_SCORING",
                defaults.max_concurrent_scoring,
            )
            .and_then(|n| {
                if n == 0 {
                    anyhow::bail!("MAX_CONCURRENT_SCORING must be greater than 0");
                }
                Ok(n)
            })?,
            max_batch_size: parse_or(&lookup, "MAX_BATCH_SIZE", defaults.max_batch_size)
                .and_then(|n| {
                    if n == 0 {
                        anyhow::bail!("MAX_BATCH_SIZE must be greater than 0");
                    }
                    Ok(n)
                })?,
            max_body_bytes: parse_or(&lookup, "MAX_BODY_BYTES", defaults.max_body_bytes)?,
            rate_limit_per_second: parse_or(
                &lookup,
                "RATE_LIMIT_PER_SECOND",
                defaults.rate_limit_per_second,
            )
            .and_then(|n| {
                if n > MAX_RATE_LIMIT_PER_SECOND {
                    anyhow::bail!(
                        "RATE_LIMIT_PER_SECOND must not exceed {}",
                        MAX_RATE_LIMIT_PER_SECOND
                    );
                }
                Ok(n)
            })?,
            rate_limit_burst: parse_or(&lookup, "RATE_LIMIT_BURST", defaults.rate_limit_burst)
                .and_then(|n| {
                    if n == 0 {
                        anyhow::bail!("RATE_LIMIT_BURST must be greater than 0");
                    }
                    Ok(n)
                })?,
            strict_fields: parse_or(&lookup, "STRICT_FIELDS", defaults.strict_fields)?,
            log_format: parse_or(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };

        Ok(config)
    }

    /// Logs the effective configuration. Called once tracing is installed,
    /// which itself depends on `log_format`.
    pub fn log_summary(&self) {
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Model path: {}", self.model_path.display());
        if let Some(ref version) = self.expected_model_version {
            tracing::info!("Model version pinned: {}", version);
        }
        if self.expected_model_sha256.is_some() {
            tracing::info!("Model artifact digest pinned");
        }
        tracing::debug!(
            "Request timeout: {:?}, scoring permits: {}",
            self.request_timeout,
            self.max_concurrent_scoring
        );
        tracing::debug!("Bind address: {}", self.bind_addr());
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn artifact_pins(&self) -> ArtifactPins {
        ArtifactPins {
            model_version: self.expected_model_version.clone(),
            sha256: self.expected_model_sha256.clone(),
        }
    }

    pub fn unknown_fields(&self) -> UnknownFields {
        if self.strict_fields {
            UnknownFields::Reject
        } else {
            UnknownFields::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.request_timeout, Duration::from_millis(2000));
        assert_eq!(config.unknown_fields(), UnknownFields::Reject);
        assert_eq!(config.artifact_pins(), ArtifactPins::default());
    }

    #[test]
    fn test_overrides() {
        let digest = "AB".repeat(32);
        let config = from_map(&[
            ("PORT", "9100"),
            ("MODEL_PATH", "/srv/model.json"),
            ("MODEL_EXPECTED_VERSION", "msme-2024.06"),
            ("MODEL_SHA256", digest.as_str()),
            ("REQUEST_TIMEOUT_MS", "250"),
            ("STRICT_FIELDS", "false"),
        ])
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.model_path, PathBuf::from("/srv/model.json"));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.unknown_fields(), UnknownFields::Ignore);
        let pins = config.artifact_pins();
        assert_eq!(pins.model_version.as_deref(), Some("msme-2024.06"));
        assert_eq!(pins.sha256, Some("ab".repeat(32)));
    }

    #[test]
    fn test_invalid_values() {
        assert!(from_map(&[("PORT", "http")]).is_err());
        assert!(from_map(&[("REQUEST_TIMEOUT_MS", "0")]).is_err());
        assert!(from_map(&[("MAX_BATCH_SIZE", "0")]).is_err());
        assert!(from_map(&[("MODEL_SHA256", "deadbeef")]).is_err());
        assert!(from_map(&[("STRICT_FIELDS", "maybe")]).is_err());
    }

    #[test]
    fn test_log_format() {
        assert_eq!(from_map(&[]).unwrap().log_format, LogFormat::Pretty);
        assert_eq!(
            from_map(&[("LOG_FORMAT", "JSON")]).unwrap().log_format,
            LogFormat::Json
        );
        assert!(from_map(&[("LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_rate_limit_upper_bound() {
        let config = from_map(&[("RATE_LIMIT_PER_SECOND", "5000")]).unwrap();
        assert_eq!(config.rate_limit_per_second, 5000);

        let max = MAX_RATE_LIMIT_PER_SECOND.to_string();
        assert!(from_map(&[("RATE_LIMIT_PER_SECOND", max.as_str())]).is_ok());
        assert!(from_map(&[("RATE_LIMIT_PER_SECOND", "1000000001")]).is_err());
    }
}
