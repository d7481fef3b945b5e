use serde::Deserialize;
use std::{collections::HashSet, path::Path, time::Duration};
use thiserror::Error;
use tokio::fs;

use crate::classifier::{CodeRule, ErrorCategory};
use crate::gateway::{Endpoint, HandleConfig, PoolConfig};
use crate::pacing::PaceLimits;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// ----- GatewayConfig ---------------------------------------------------------

/// Effective settings. Anything missing from the file keeps its default, so
/// an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub pacing: PaceLimits,
    /// Extra or overriding code rules, applied on top of the built-in table.
    pub error_codes: Vec<(i32, CodeRule)>,
    /// Zero disables the background health monitor.
    pub health_check_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            pacing: PaceLimits::default(),
            error_codes: Vec::new(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- GatewayConfig: Static -------------------------------------------------

impl GatewayConfig {
    pub async fn from_file_async(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<GatewayConfig, ConfigError> {
        let doc: ConfigFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;

        let defaults = GatewayConfig::default();
        let pool = pool_config(&doc, defaults.pool);
        let pacing = pace_limits(&doc.pacing, defaults.pacing);

        let mut seen = HashSet::with_capacity(doc.error_codes.len());
        let mut error_codes = Vec::with_capacity(doc.error_codes.len());
        for entry in doc.error_codes {
            if !seen.insert(entry.code) {
                return Err(ConfigError::DuplicateErrorCode { code: entry.code });
            }
            let wait = entry.wait.unwrap_or(Duration::ZERO);
            error_codes.push((entry.code, CodeRule::new(entry.category, wait)));
        }

        let cfg = GatewayConfig {
            pool,
            pacing,
            error_codes,
            health_check_interval: doc
                .monitor
                .health_check_interval
                .unwrap_or(defaults.health_check_interval),
            shutdown_grace: doc.monitor.shutdown_grace.unwrap_or(defaults.shutdown_grace),
        };

        validate(&cfg)?;
        Ok(cfg)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    gateway: GatewaySection,
    pool: PoolSection,
    connection: ConnectionSection,
    monitor: MonitorSection,
    pacing: PacingSection,
    error_codes: Vec<ErrorCodeEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GatewaySection {
    host: Option<String>,
    port: Option<u16>,
    client_id_base: Option<u32>,
    client_id_span: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolSection {
    max_connections: Option<usize>,
    min_connections: Option<usize>,
    #[serde(deserialize_with = "de_duration")]
    acquire_timeout: Option<Duration>,
    identity_retry_attempts: Option<u32>,
    #[serde(deserialize_with = "de_duration")]
    identity_retry_backoff: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    sleep_wake_gap: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConnectionSection {
    #[serde(deserialize_with = "de_duration")]
    idle_timeout: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    request_timeout: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    connect_timeout: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    probe_timeout: Option<Duration>,
    queue_capacity: Option<usize>,
    #[serde(deserialize_with = "de_duration")]
    poll_interval: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    sleep_wake_gap: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MonitorSection {
    #[serde(deserialize_with = "de_duration")]
    health_check_interval: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    shutdown_grace: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PacingSection {
    max_calls_per_window: Option<usize>,
    #[serde(deserialize_with = "de_duration")]
    global_window: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    heavy_min_spacing: Option<Duration>,
    rolling_max_weight: Option<u32>,
    #[serde(deserialize_with = "de_duration")]
    rolling_window: Option<Duration>,
    resource_max_calls: Option<usize>,
    #[serde(deserialize_with = "de_duration")]
    resource_window: Option<Duration>,
    #[serde(deserialize_with = "de_duration")]
    duplicate_cooldown: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ErrorCodeEntry {
    code: i32,
    category: ErrorCategory,
    #[serde(default, deserialize_with = "de_duration")]
    wait: Option<Duration>,
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn pool_config(doc: &ConfigFile, defaults: PoolConfig) -> PoolConfig {
    let gateway = &doc.gateway;
    let pool = &doc.pool;
    let conn = &doc.connection;
    let handle = defaults.handle.clone();

    PoolConfig {
        endpoint: Endpoint {
            host: gateway.host.clone().unwrap_or(defaults.endpoint.host),
            port: gateway.port.unwrap_or(defaults.endpoint.port),
        },
        max_connections: pool.max_connections.unwrap_or(defaults.max_connections),
        min_connections: pool.min_connections.unwrap_or(defaults.min_connections),
        acquire_timeout: pool.acquire_timeout.unwrap_or(defaults.acquire_timeout),
        identity_base: gateway.client_id_base.unwrap_or(defaults.identity_base),
        identity_span: gateway.client_id_span.unwrap_or(defaults.identity_span),
        identity_retry_attempts: pool
            .identity_retry_attempts
            .unwrap_or(defaults.identity_retry_attempts),
        identity_retry_backoff: pool
            .identity_retry_backoff
            .unwrap_or(defaults.identity_retry_backoff),
        sleep_wake_gap: pool.sleep_wake_gap.unwrap_or(defaults.sleep_wake_gap),
        handle: HandleConfig {
            idle_timeout: conn.idle_timeout.unwrap_or(handle.idle_timeout),
            request_timeout: conn.request_timeout.unwrap_or(handle.request_timeout),
            connect_timeout: conn.connect_timeout.unwrap_or(handle.connect_timeout),
            probe_timeout: conn.probe_timeout.unwrap_or(handle.probe_timeout),
            queue_capacity: conn.queue_capacity.unwrap_or(handle.queue_capacity),
            poll_interval: conn.poll_interval.unwrap_or(handle.poll_interval),
            sleep_wake_gap: conn.sleep_wake_gap.unwrap_or(handle.sleep_wake_gap),
        },
    }
}

fn pace_limits(p: &PacingSection, defaults: PaceLimits) -> PaceLimits {
    PaceLimits {
        max_calls_per_window: p.max_calls_per_window.unwrap_or(defaults.max_calls_per_window),
        global_window: p.global_window.unwrap_or(defaults.global_window),
        heavy_min_spacing: p.heavy_min_spacing.unwrap_or(defaults.heavy_min_spacing),
        rolling_max_weight: p.rolling_max_weight.unwrap_or(defaults.rolling_max_weight),
        rolling_window: p.rolling_window.unwrap_or(defaults.rolling_window),
        resource_max_calls: p.resource_max_calls.unwrap_or(defaults.resource_max_calls),
        resource_window: p.resource_window.unwrap_or(defaults.resource_window),
        duplicate_cooldown: p.duplicate_cooldown.unwrap_or(defaults.duplicate_cooldown),
    }
}

fn validate(cfg: &GatewayConfig) -> Result<(), ConfigError> {
    let pool = &cfg.pool;
    let pacing = &cfg.pacing;

    if pool.endpoint.host.trim().is_empty() {
        return Err(ConfigError::InvalidField("gateway.host".into()));
    }
    if pool.endpoint.port == 0 {
        return Err(ConfigError::InvalidField("gateway.port".into()));
    }
    if pool.identity_span == 0 || pool.identity_base.checked_add(pool.identity_span).is_none() {
        return Err(ConfigError::InvalidField("gateway.client_id_span".into()));
    }
    if pool.max_connections == 0 {
        return Err(ConfigError::InvalidField("pool.max_connections".into()));
    }
    if pool.min_connections > pool.max_connections {
        return Err(ConfigError::InvalidField("pool.min_connections".into()));
    }
    if (pool.identity_span as usize) < pool.max_connections {
        return Err(ConfigError::InvalidField("gateway.client_id_span".into()));
    }
    if pool.handle.queue_capacity == 0 {
        return Err(ConfigError::InvalidField("connection.queue_capacity".into()));
    }
    if pool.handle.poll_interval.is_zero() {
        return Err(ConfigError::InvalidField("connection.poll_interval".into()));
    }
    if pacing.max_calls_per_window == 0 || pacing.global_window.is_zero() {
        return Err(ConfigError::InvalidField("pacing.max_calls_per_window".into()));
    }
    if pacing.rolling_max_weight == 0 || pacing.rolling_window.is_zero() {
        return Err(ConfigError::InvalidField("pacing.rolling_max_weight".into()));
    }
    if pacing.resource_max_calls == 0 || pacing.resource_window.is_zero() {
        return Err(ConfigError::InvalidField("pacing.resource_max_calls".into()));
    }
    Ok(())
}

/// Accepts human-readable strings ("180s", "2m 30s") or integer milliseconds.
fn de_duration<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{Error, Unexpected, Visitor};
    use std::fmt;

    struct OptVisitor;
    struct DurationVisitor;

    impl<'de> Visitor<'de> for OptVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration like \"30s\" or integer milliseconds")
        }
        fn visit_none<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_some<D2>(self, d2: D2) -> Result<Self::Value, D2::Error>
        where
            D2: serde::Deserializer<'de>,
        {
            d2.deserialize_any(DurationVisitor)
        }
    }

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration like \"30s\" or integer milliseconds")
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<Self::Value, E> {
            if v < 0 {
                return Err(E::invalid_value(Unexpected::Signed(v), &self));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_option(OptVisitor)
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate [[error_codes]] entry for code {code}")]
    DuplicateErrorCode { code: i32 },

    #[error("invalid value for '{0}'")]
    InvalidField(String),

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
