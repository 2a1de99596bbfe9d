use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::engine::{EngineConfig, DEFAULT_GRACE, DEFAULT_MARKER_TTL_SECS, DEFAULT_WINDOW_TTL_SECS};
use crate::settings::Settings;
use crate::window::DEFAULT_NAMESPACE;

pub const REQUIRED_ENV: [&str; 2] = ["SAFEFLAG_NONCE_SECRET", "SAFEFLAG_ADMIN_TOKEN"];
const DEFAULT_BIND: &str = "0.0.0.0:3147";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub nonce_secret: String,
    pub admin_token: String,
    pub trust_proxy: bool,
    pub settings: Settings,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("Missing required environment variable: {}", key))
        };
        let nonce_secret = required("SAFEFLAG_NONCE_SECRET")?;
        let admin_token = required("SAFEFLAG_ADMIN_TOKEN")?;

        let bind: SocketAddr = parse_or(&lookup, "SAFEFLAG_BIND", DEFAULT_BIND.parse()?)?;
        let enabled = parse_flag(&lookup, "SAFEFLAG_ENABLED", true)?;
        let trust_proxy = parse_flag(&lookup, "SAFEFLAG_TRUST_PROXY", false)?;
        let allow_reflag_moderated = parse_flag(&lookup, "SAFEFLAG_ALLOW_REFLAG", false)?;
        let threshold: i64 = parse_or(&lookup, "SAFEFLAG_THRESHOLD", Settings::default().threshold)?;
        let grace = parse_or(&lookup, "SAFEFLAG_GRACE", DEFAULT_GRACE)?;
        let marker_ttl_secs: i64 = parse_or(&lookup, "SAFEFLAG_MARKER_TTL_SECS", DEFAULT_MARKER_TTL_SECS)?;
        let window_ttl_secs: i64 = parse_or(&lookup, "SAFEFLAG_WINDOW_TTL_SECS", DEFAULT_WINDOW_TTL_SECS)?;
        if marker_ttl_secs <= 0 || window_ttl_secs <= 0 {
            anyhow::bail!("Marker and window lifetimes must be positive");
        }

        Ok(Self {
            bind,
            nonce_secret,
            admin_token,
            trust_proxy,
            settings: Settings { enabled, threshold },
            engine: EngineConfig {
                namespace: DEFAULT_NAMESPACE.to_string(),
                grace,
                marker_ttl: Duration::seconds(marker_ttl_secs),
                window_ttl: Duration::seconds(window_ttl_secs),
                allow_reflag_moderated,
            },
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            parse_bool(&raw).ok_or_else(|| anyhow!("{} must be a boolean, got {:?}", key, raw))
        }
        _ => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("SAFEFLAG_NONCE_SECRET", "s3cret"),
        ("SAFEFLAG_ADMIN_TOKEN", "admin"),
    ];

    #[test]
    fn defaults_apply_when_only_required_set() {
        let config = Config::from_lookup(lookup(&REQUIRED)).expect("config");
        assert_eq!(config.bind.port(), 3147);
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.engine.grace, 3);
        assert_eq!(config.engine.marker_ttl, Duration::days(7));
        assert_eq!(config.engine.window_ttl, Duration::days(1));
        assert!(!config.trust_proxy);
        assert!(!config.engine.allow_reflag_moderated);
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = Config::from_lookup(lookup(&[("SAFEFLAG_ADMIN_TOKEN", "admin")])).unwrap_err();
        assert!(err.to_string().contains("SAFEFLAG_NONCE_SECRET"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("SAFEFLAG_THRESHOLD", "12"),
            ("SAFEFLAG_GRACE", "2"),
            ("SAFEFLAG_ENABLED", "off"),
            ("SAFEFLAG_TRUST_PROXY", "yes"),
            ("SAFEFLAG_WINDOW_TTL_SECS", "60"),
            ("SAFEFLAG_BIND", "127.0.0.1:8080"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.settings.threshold, 12);
        assert!(!config.settings.enabled);
        assert!(config.trust_proxy);
        assert_eq!(config.engine.grace, 2);
        assert_eq!(config.engine.window_ttl, Duration::seconds(60));
        assert_eq!(config.bind.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn rejects_unparseable_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SAFEFLAG_GRACE", "lots"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SAFEFLAG_ENABLED", "maybe"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn parses_bool_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }
}
