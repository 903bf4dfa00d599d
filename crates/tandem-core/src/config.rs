//! Coordinator configuration.
//!
//! Runtime structs with workable defaults, plus TOML section structs so a
//! host can ship a `tandem.toml`. Hot reloads go through
//! [`crate::bridge::AnalysisBridge::update_config`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::PathBuf;
use tracing::warn;

use crate::logging::LogLevel;

pub(crate) const CONFIG_FILES: &[&str] = &["tandem.toml", ".tandem.toml"];

/// How a lint rule override is forwarded to the linter argv.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLevel {
    Disable,
    Warn,
    Deny,
}

impl RuleLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "disable" | "allow" => Some(RuleLevel::Disable),
            "warn" | "warning" => Some(RuleLevel::Warn),
            "deny" | "error" => Some(RuleLevel::Deny),
            _ => None,
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            RuleLevel::Disable => "--disable",
            RuleLevel::Warn => "--warn",
            RuleLevel::Deny => "--deny",
        }
    }
}

/// Checker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckerConfig {
    /// Toggles the persistent checker pool.
    pub enabled: bool,
    /// Override for the checker executable.
    pub binary_path: Option<PathBuf>,
    /// Number of long-lived workers.
    pub pool_size: usize,
    /// Depth bound fed to the expansion guard.
    pub max_type_depth: usize,
    /// Per-request timeout.
    pub file_timeout_ms: u64,
    /// Memory hint carried to workers via `NODE_OPTIONS`.
    pub max_memory_mb: u32,
    /// Extra argv flags appended after `--lsp-stdio`.
    pub flags: Vec<String>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: None,
            pool_size: 4,
            max_type_depth: 20,
            file_timeout_ms: 30_000,
            max_memory_mb: 3_072,
            flags: Vec::new(),
        }
    }
}

impl CheckerConfig {
    pub fn binary(&self) -> PathBuf {
        self.binary_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("tandem-checker"))
    }
}

/// Linter pool settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinterConfig {
    /// Toggles the ephemeral linter pool.
    pub enabled: bool,
    /// Override for the linter executable.
    pub binary_path: Option<PathBuf>,
    /// Passed as `--config=<path>` when set.
    pub config_path: Option<PathBuf>,
    /// Per-request and queue-wait timeout.
    pub file_timeout_ms: u64,
    /// Rule overrides forwarded as `--disable`/`--warn`/`--deny` flags.
    pub rules: IndexMap<SmolStr, RuleLevel>,
}

impl Default for LinterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: None,
            config_path: None,
            file_timeout_ms: 10_000,
            rules: IndexMap::new(),
        }
    }
}

impl LinterConfig {
    pub fn binary(&self) -> PathBuf {
        self.binary_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("tandem-lint"))
    }
}

/// Structured log core settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    /// Entries below this level are dropped.
    pub level: LogLevel,
    /// Optional file sink.
    pub file: Option<PathBuf>,
    /// Rotation threshold for the file sink.
    pub max_file_size_mb: u64,
    /// Human format instead of JSON lines.
    pub pretty_print: bool,
    /// Batch flush cadence.
    pub flush_interval_ms: u64,
    /// Ring buffer capacity.
    pub ring_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            max_file_size_mb: 10,
            pretty_print: false,
            flush_interval_ms: 100,
            ring_capacity: 2_000,
        }
    }
}

/// Result-cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_size_mb: u64,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 500,
            max_size_mb: 64,
            ttl_seconds: 1_800,
        }
    }
}

impl CacheConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_seconds.saturating_mul(1_000)
    }
}

/// Debounce hint surfaced to callers; the cache key is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchConfig {
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

/// Inspector and tracer retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InspectorConfig {
    /// Root spans retained by the tracer.
    pub max_trace_history: usize,
    /// Spans slower than this fire the slow-span observer.
    pub slow_span_ms: u64,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_trace_history: 1_000,
            slow_span_ms: 100,
        }
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisConfig {
    /// Analyses dispatched concurrently by the bridge.
    pub max_concurrent: MaxConcurrent,
    pub checker: CheckerConfig,
    pub linter: LinterConfig,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub watch: WatchConfig,
    pub inspector: InspectorConfig,
}

/// Newtype so the dispatch bound defaults to 4 under `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MaxConcurrent(pub usize);

impl Default for MaxConcurrent {
    fn default() -> Self {
        Self(4)
    }
}

impl MaxConcurrent {
    pub fn get(self) -> usize {
        self.0.max(1)
    }
}

impl AnalysisConfig {
    /// Loads configuration from the first `tandem.toml` found in `root`.
    pub fn load(root: &std::path::Path) -> Self {
        let Some(path) = find_config_file(root) else {
            return AnalysisConfig::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            warn!("Failed to read tandem config at {}", path.display());
            return AnalysisConfig::default();
        };
        AnalysisConfig::from_contents(&contents)
    }

    /// Parses a TOML config document, falling back to defaults on error.
    pub fn from_contents(contents: &str) -> Self {
        let parsed: ConfigFile = match toml::from_str(contents) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("Failed to parse tandem config: {err}");
                return AnalysisConfig::default();
            }
        };
        AnalysisConfig::from(parsed)
    }
}

pub(crate) fn find_config_file(root: &std::path::Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    analysis: AnalysisSection,
    #[serde(default)]
    checker: CheckerSection,
    #[serde(default)]
    linter: LinterSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    watch: WatchSection,
    #[serde(default)]
    inspector: InspectorSection,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisSection {
    max_concurrent: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckerSection {
    enabled: Option<bool>,
    binary_path: Option<String>,
    pool_size: Option<usize>,
    max_type_depth: Option<usize>,
    file_timeout_ms: Option<u64>,
    max_memory_mb: Option<u32>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LinterSection {
    enabled: Option<bool>,
    binary_path: Option<String>,
    config_path: Option<String>,
    file_timeout_ms: Option<u64>,
    #[serde(default)]
    rules: IndexMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    file: Option<String>,
    max_file_size_mb: Option<u64>,
    pretty_print: Option<bool>,
    flush_interval_ms: Option<u64>,
    ring_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheSection {
    enabled: Option<bool>,
    max_entries: Option<usize>,
    max_size_mb: Option<u64>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WatchSection {
    debounce_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectorSection {
    max_trace_history: Option<usize>,
    slow_span_ms: Option<u64>,
}

impl From<ConfigFile> for AnalysisConfig {
    fn from(file: ConfigFile) -> Self {
        AnalysisConfig {
            max_concurrent: MaxConcurrent(
                file.analysis
                    .max_concurrent
                    .unwrap_or(MaxConcurrent::default().0),
            ),
            checker: file.checker.into(),
            linter: file.linter.into(),
            logging: file.logging.into(),
            cache: file.cache.into(),
            watch: file.watch.into(),
            inspector: file.inspector.into(),
        }
    }
}

impl From<CheckerSection> for CheckerConfig {
    fn from(section: CheckerSection) -> Self {
        let defaults = CheckerConfig::default();
        CheckerConfig {
            enabled: section.enabled.unwrap_or(defaults.enabled),
            binary_path: section.binary_path.map(PathBuf::from),
            pool_size: section.pool_size.unwrap_or(defaults.pool_size).max(1),
            max_type_depth: section.max_type_depth.unwrap_or(defaults.max_type_depth),
            file_timeout_ms: section.file_timeout_ms.unwrap_or(defaults.file_timeout_ms),
            max_memory_mb: section.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            flags: section.flags,
        }
    }
}

impl From<LinterSection> for LinterConfig {
    fn from(section: LinterSection) -> Self {
        let defaults = LinterConfig::default();
        let mut rules = IndexMap::new();
        for (rule, level) in section.rules {
            match RuleLevel::parse(&level) {
                Some(parsed) => {
                    rules.insert(SmolStr::new(rule), parsed);
                }
                None => warn!("Ignoring unknown lint rule level '{level}' for '{rule}'"),
            }
        }
        LinterConfig {
            enabled: section.enabled.unwrap_or(defaults.enabled),
            binary_path: section.binary_path.map(PathBuf::from),
            config_path: section.config_path.map(PathBuf::from),
            file_timeout_ms: section.file_timeout_ms.unwrap_or(defaults.file_timeout_ms),
            rules,
        }
    }
}

impl From<LoggingSection> for LoggingConfig {
    fn from(section: LoggingSection) -> Self {
        let defaults = LoggingConfig::default();
        let level = section
            .level
            .as_deref()
            .and_then(LogLevel::parse)
            .unwrap_or(defaults.level);
        LoggingConfig {
            level,
            file: section.file.map(PathBuf::from),
            max_file_size_mb: section
                .max_file_size_mb
                .unwrap_or(defaults.max_file_size_mb),
            pretty_print: section.pretty_print.unwrap_or(defaults.pretty_print),
            flush_interval_ms: section
                .flush_interval_ms
                .unwrap_or(defaults.flush_interval_ms),
            ring_capacity: section
                .ring_capacity
                .unwrap_or(defaults.ring_capacity)
                .max(1),
        }
    }
}

impl From<CacheSection> for CacheConfig {
    fn from(section: CacheSection) -> Self {
        let defaults = CacheConfig::default();
        CacheConfig {
            enabled: section.enabled.unwrap_or(defaults.enabled),
            max_entries: section.max_entries.unwrap_or(defaults.max_entries),
            max_size_mb: section.max_size_mb.unwrap_or(defaults.max_size_mb),
            ttl_seconds: section.ttl_seconds.unwrap_or(defaults.ttl_seconds),
        }
    }
}

impl From<WatchSection> for WatchConfig {
    fn from(section: WatchSection) -> Self {
        WatchConfig {
            debounce_ms: section
                .debounce_ms
                .unwrap_or(WatchConfig::default().debounce_ms),
        }
    }
}

impl From<InspectorSection> for InspectorConfig {
    fn from(section: InspectorSection) -> Self {
        let defaults = InspectorConfig::default();
        InspectorConfig {
            max_trace_history: section
                .max_trace_history
                .unwrap_or(defaults.max_trace_history)
                .max(1),
            slow_span_ms: section.slow_span_ms.unwrap_or(defaults.slow_span_ms),
        }
    }
}
