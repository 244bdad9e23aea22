//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so an engine can start with zero
//! configuration against a local backend.

use std::str::FromStr;
use std::time::Duration;

use revline_shared::constants::{
    DEFAULT_ONLINE_THRESHOLD_SECS, HEARTBEAT_INTERVAL_SECS, IMAGE_BUCKET, RECONCILE_DELAY_MS,
    REFRESH_COOLDOWN_SECS, SIGNED_URL_TTL_SECS, THREAD_PAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the backend platform.
    /// Env: `REVLINE_BACKEND_URL`
    /// Default: `http://127.0.0.1:54321`
    pub backend_url: String,

    /// Public API key sent with every request.
    /// Env: `REVLINE_ANON_KEY`
    pub anon_key: Option<String>,

    /// Env: `REVLINE_HEARTBEAT_SECS` (default 25)
    pub heartbeat_interval: Duration,

    /// Threshold applied to profiles that do not carry their own.
    /// Env: `REVLINE_PRESENCE_THRESHOLD_SECS` (default 45)
    pub online_threshold_secs: u32,

    /// Delay before the post-send thread refetch.
    /// Env: `REVLINE_RECONCILE_DELAY_MS` (default 1000)
    pub reconcile_delay: Duration,

    /// Minimum spacing of bulk recovery refreshes.
    /// Env: `REVLINE_REFRESH_COOLDOWN_SECS` (default 5)
    pub refresh_cooldown: Duration,

    /// Env: `REVLINE_SIGNED_URL_TTL_SECS` (default 3600)
    pub signed_url_ttl_secs: u64,

    /// Env: `REVLINE_IMAGE_BUCKET` (default `chat-uploads`)
    pub image_bucket: String,

    /// Env: `REVLINE_THREAD_PAGE_SIZE` (default 200)
    pub thread_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".to_string(),
            anon_key: None,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            online_threshold_secs: DEFAULT_ONLINE_THRESHOLD_SECS,
            reconcile_delay: Duration::from_millis(RECONCILE_DELAY_MS),
            refresh_cooldown: Duration::from_secs(REFRESH_COOLDOWN_SECS),
            signed_url_ttl_secs: SIGNED_URL_TTL_SECS,
            image_bucket: IMAGE_BUCKET.to_string(),
            thread_page_size: THREAD_PAGE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("REVLINE_BACKEND_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if url.starts_with("http://") || url.starts_with("https://") {
                config.backend_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid REVLINE_BACKEND_URL, using default");
            }
        }

        if let Some(key) = lookup("REVLINE_ANON_KEY") {
            if !key.is_empty() {
                config.anon_key = Some(key);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REVLINE_HEARTBEAT_SECS") {
            if secs > 0 {
                config.heartbeat_interval = Duration::from_secs(secs);
            } else {
                tracing::warn!("REVLINE_HEARTBEAT_SECS must be positive, using default");
            }
        }

        if let Some(secs) = parse_var::<u32>(&lookup, "REVLINE_PRESENCE_THRESHOLD_SECS") {
            config.online_threshold_secs = secs;
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "REVLINE_RECONCILE_DELAY_MS") {
            config.reconcile_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REVLINE_REFRESH_COOLDOWN_SECS") {
            config.refresh_cooldown = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REVLINE_SIGNED_URL_TTL_SECS") {
            config.signed_url_ttl_secs = secs;
        }

        if let Some(bucket) = lookup("REVLINE_IMAGE_BUCKET") {
            if !bucket.is_empty() {
                config.image_bucket = bucket;
            }
        }

        if let Some(limit) = parse_var::<u32>(&lookup, "REVLINE_THREAD_PAGE_SIZE") {
            if limit > 0 {
                config.thread_page_size = limit;
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "Invalid value, using default");
            None
        }
    }
}
