//! Configuration for flagpipe.
//!
//! Loaded from a TOML file, then overridden from the environment and the
//! command line.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::warn;

use flagpipe_common::Reference;

/// Default collector base URI.
pub const DEFAULT_EVENTS_URI: &str = "https://events.flagpipe.dev";

/// Shortest allowed diagnostics recording interval.
pub const MIN_DIAGNOSTIC_RECORDING_INTERVAL_SECS: u64 = 60;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging level.
    pub log_level: String,

    /// SDK key sent as the `Authorization` header. Environment only.
    pub sdk_key: Option<String>,

    /// Event pipeline parameters.
    pub events: EventsConfig,

    /// Diagnostics parameters.
    pub diagnostics: DiagnosticsConfig,
}

/// Event pipeline parameters.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Maximum buffered events per flush window; also the intake queue size.
    pub capacity: usize,

    /// Flush interval (seconds).
    pub flush_interval_secs: u64,

    /// Size of the context dedup cache. 0 disables dedup.
    pub context_keys_capacity: usize,

    /// How often the context dedup cache is cleared (seconds).
    pub context_keys_flush_interval_secs: u64,

    /// Redact every optional context attribute.
    pub all_attributes_private: bool,

    /// Attributes redacted from every context.
    pub private_attributes: Vec<Reference>,

    /// Leave anonymous contexts out of index and identify events.
    pub omit_anonymous_contexts: bool,

    /// Ignore per-event sampling ratios.
    pub force_sampling: bool,

    /// Delay before the single retry (milliseconds).
    pub retry_delay_ms: u64,

    /// Deliveries allowed in flight at once.
    pub max_concurrent_deliveries: usize,

    /// Value of the `X-Event-Schema` header.
    pub schema_version: u32,

    /// Collector base URI.
    pub base_uri: String,

    /// Per-request timeout (seconds).
    pub request_timeout_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            flush_interval_secs: 5,
            context_keys_capacity: 1000,
            context_keys_flush_interval_secs: 300,
            all_attributes_private: false,
            private_attributes: Vec::new(),
            omit_anonymous_contexts: false,
            force_sampling: false,
            retry_delay_ms: 1000,
            max_concurrent_deliveries: 5,
            schema_version: 4,
            base_uri: DEFAULT_EVENTS_URI.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl EventsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn context_keys_flush_interval(&self) -> Duration {
        Duration::from_secs(self.context_keys_flush_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// True when events go somewhere other than the default collector.
    pub fn custom_base_uri(&self) -> bool {
        self.base_uri.trim_end_matches('/') != DEFAULT_EVENTS_URI
    }
}

/// Diagnostics parameters.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Send diagnostic events.
    pub enabled: bool,

    /// Periodic statistics interval (seconds).
    pub recording_interval_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recording_interval_secs: 900,
        }
    }
}

impl DiagnosticsConfig {
    pub fn recording_interval(&self) -> Duration {
        Duration::from_secs(self.recording_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sdk_key: None,
            events: EventsConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("FLAGPIPE_SDK_KEY")
            && !key.is_empty()
        {
            self.sdk_key = Some(key);
        }
        if let Ok(uri) = std::env::var("FLAGPIPE_EVENTS_URI")
            && !uri.is_empty()
        {
            self.events.base_uri = uri;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(&mut self, events_uri: Option<String>) {
        if let Some(uri) = events_uri {
            self.events.base_uri = uri;
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        let events = &self.events;
        if events.capacity == 0 {
            bail!("events.capacity must be at least 1");
        }
        if events.flush_interval_secs == 0 {
            bail!("events.flush_interval_secs must be positive");
        }
        if events.context_keys_flush_interval_secs == 0 {
            bail!("events.context_keys_flush_interval_secs must be positive");
        }
        if events.max_concurrent_deliveries == 0 {
            bail!("events.max_concurrent_deliveries must be at least 1");
        }
        if events.request_timeout_secs == 0 {
            bail!("events.request_timeout_secs must be positive");
        }
        if !(events.base_uri.starts_with("http://") || events.base_uri.starts_with("https://")) {
            bail!("events.base_uri must be an http(s) URI, got {:?}", events.base_uri);
        }

        if self.diagnostics.enabled
            && self.diagnostics.recording_interval_secs < MIN_DIAGNOSTIC_RECORDING_INTERVAL_SECS
        {
            bail!(
                "diagnostics.recording_interval_secs must be at least {}",
                MIN_DIAGNOSTIC_RECORDING_INTERVAL_SECS
            );
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    events: EventsToml,
    #[serde(default)]
    diagnostics: DiagnosticsToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EventsToml {
    capacity: usize,
    flush_interval_secs: u64,
    context_keys_capacity: usize,
    context_keys_flush_interval_secs: u64,
    all_attributes_private: bool,
    private_attributes: Vec<String>,
    omit_anonymous_contexts: bool,
    force_sampling: bool,
    retry_delay_ms: u64,
    max_concurrent_deliveries: usize,
    schema_version: u32,
    base_uri: String,
    request_timeout_secs: u64,
}

impl Default for EventsToml {
    fn default() -> Self {
        let defaults = EventsConfig::default();
        Self {
            capacity: defaults.capacity,
            flush_interval_secs: defaults.flush_interval_secs,
            context_keys_capacity: defaults.context_keys_capacity,
            context_keys_flush_interval_secs: defaults.context_keys_flush_interval_secs,
            all_attributes_private: defaults.all_attributes_private,
            private_attributes: Vec::new(),
            omit_anonymous_contexts: defaults.omit_anonymous_contexts,
            force_sampling: defaults.force_sampling,
            retry_delay_ms: defaults.retry_delay_ms,
            max_concurrent_deliveries: defaults.max_concurrent_deliveries,
            schema_version: defaults.schema_version,
            base_uri: defaults.base_uri,
            request_timeout_secs: defaults.request_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DiagnosticsToml {
    enabled: bool,
    recording_interval_secs: u64,
}

impl Default for DiagnosticsToml {
    fn default() -> Self {
        Self {
            enabled: true,
            recording_interval_secs: 900,
        }
    }
}

/// Parse configured references, skipping the invalid ones.
fn parse_private_attributes(raw: &[String]) -> Vec<Reference> {
    raw.iter()
        .filter_map(|r| match Reference::parse(r) {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!(reference = %r, error = %e, "Ignoring invalid private attribute reference");
                None
            }
        })
        .collect()
}

impl From<TomlConfig> for Config {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            sdk_key: None,
            events: EventsConfig {
                capacity: toml.events.capacity,
                flush_interval_secs: toml.events.flush_interval_secs,
                context_keys_capacity: toml.events.context_keys_capacity,
                context_keys_flush_interval_secs: toml.events.context_keys_flush_interval_secs,
                all_attributes_private: toml.events.all_attributes_private,
                private_attributes: parse_private_attributes(&toml.events.private_attributes),
                omit_anonymous_contexts: toml.events.omit_anonymous_contexts,
                force_sampling: toml.events.force_sampling,
                retry_delay_ms: toml.events.retry_delay_ms,
                max_concurrent_deliveries: toml.events.max_concurrent_deliveries,
                schema_version: toml.events.schema_version,
                base_uri: toml.events.base_uri,
                request_timeout_secs: toml.events.request_timeout_secs,
            },
            diagnostics: DiagnosticsConfig {
                enabled: toml.diagnostics.enabled,
                recording_interval_secs: toml.diagnostics.recording_interval_secs,
            },
        }
    }
}
