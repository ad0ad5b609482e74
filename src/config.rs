use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::channel::record::AGGREGATED_RECORD_SIZE;
use crate::engine::aggregate::{AggregateFields, AggregateFunction};
use crate::engine::window::WindowPolicy;
use crate::engine::{EngineConfig, EngineMode};

/// Top-level configuration for the sysagg agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Window closing policy.
    #[serde(default)]
    pub window: WindowConfig,

    /// Aggregation table sizing.
    #[serde(default)]
    pub table: TableConfig,

    /// Output channel sizing.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Engine mode and per-flush output shape.
    #[serde(default)]
    pub engine: EngineSection,

    /// Where events come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Output channel consumer.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often engine stats are logged and exported. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Append one CSV row of run totals here on shutdown. Default: none.
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

/// Window policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Time,
    Count,
    Session,
}

/// Window closing policy.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Policy. Default: time.
    #[serde(default)]
    pub policy: WindowKind,

    /// Window length for the time policy. Default: 1s.
    #[serde(default = "default_window_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Events per window for the count policy. Default: 1000.
    #[serde(default = "default_window_size")]
    pub size: u64,

    /// Step between windows for the count policy. Windows are tumbling, so
    /// this must equal `size`. Defaults to `size`.
    #[serde(default)]
    pub step: Option<u64>,

    /// Inactivity gap for the session policy. Default: 100ms.
    #[serde(default = "default_session_gap", with = "humantime_serde")]
    pub gap: Duration,
}

/// Aggregation table sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Maximum distinct group keys. Default: 16384.
    #[serde(default = "default_table_capacity")]
    pub capacity: usize,
}

/// Output channel sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Ring size in bytes, a multiple of 8. Default: 4MiB.
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

/// Engine mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    #[default]
    Aggregated,
    PassThrough,
    GlobalCounter,
}

/// Engine mode and output shape.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Mode. Default: aggregated.
    #[serde(default)]
    pub mode: ModeKind,

    /// Events per batch in global_counter mode. Default: 262144.
    #[serde(default = "default_counter_threshold")]
    pub counter_threshold: u64,

    /// Upper bound on records per flush. Default: 74898, what fits a
    /// default-sized channel in one reservation.
    #[serde(default = "default_max_records_per_flush")]
    pub max_records_per_flush: usize,

    /// Aggregate functions written to each record. Default: all.
    #[serde(default = "default_functions")]
    pub functions: Vec<AggregateFunction>,
}

/// Event source selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Synthetic,
    Replay,
}

/// Where events come from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Source. Default: synthetic.
    #[serde(default)]
    pub kind: SourceKind,

    #[serde(default)]
    pub synthetic: SyntheticConfig,

    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Synthetic multi-context event generator.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    /// Concurrent execution contexts, one thread each. Default: 4.
    #[serde(default = "default_contexts")]
    pub contexts: usize,

    /// Distinct handle ids per context. Default: 16.
    #[serde(default = "default_handles")]
    pub handles: u64,

    /// Largest generated value. Default: 65536.
    #[serde(default = "default_max_value")]
    pub max_value: u64,

    /// Target rate per context, 0 for unthrottled. Default: 100000.
    #[serde(default = "default_events_per_second")]
    pub events_per_second: u64,

    /// Stop each context after this many events, 0 for unbounded.
    #[serde(default)]
    pub max_events: u64,
}

/// Replay of a file of raw event frames.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    /// File of 32-byte little-endian frames.
    #[serde(default)]
    pub path: PathBuf,

    /// Sleep between events to follow their recorded timestamps.
    #[serde(default)]
    pub pace: bool,
}

/// Output channel consumer.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// How often the channel is drained. Default: 100ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Log every record at info level instead of one summary per batch.
    #[serde(default)]
    pub log_records: bool,

    /// Window used to re-aggregate pass-through records in user space.
    /// Default: 1s.
    #[serde(default = "default_raw_window", with = "humantime_serde")]
    pub raw_window: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_window_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_window_size() -> u64 {
    1000
}

fn default_session_gap() -> Duration {
    Duration::from_millis(100)
}

fn default_table_capacity() -> usize {
    16_384
}

fn default_channel_capacity() -> usize {
    4 * 1024 * 1024
}

fn default_counter_threshold() -> u64 {
    1 << 18
}

fn default_max_records_per_flush() -> usize {
    (default_channel_capacity() - 8) / AGGREGATED_RECORD_SIZE
}

fn default_functions() -> Vec<AggregateFunction> {
    vec![
        AggregateFunction::Count,
        AggregateFunction::Sum,
        AggregateFunction::Average,
        AggregateFunction::Min,
        AggregateFunction::Max,
    ]
}

fn default_contexts() -> usize {
    4
}

fn default_handles() -> u64 {
    16
}

fn default_max_value() -> u64 {
    65_536
}

fn default_events_per_second() -> u64 {
    100_000
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_raw_window() -> Duration {
    Duration::from_secs(1)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            window: WindowConfig::default(),
            table: TableConfig::default(),
            channel: ChannelConfig::default(),
            engine: EngineSection::default(),
            source: SourceConfig::default(),
            consumer: ConsumerConfig::default(),
            health: HealthConfig::default(),
            stats_interval: default_stats_interval(),
            stats_path: None,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            policy: WindowKind::Time,
            interval: default_window_interval(),
            size: default_window_size(),
            step: None,
            gap: default_session_gap(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            capacity: default_table_capacity(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            mode: ModeKind::Aggregated,
            counter_threshold: default_counter_threshold(),
            max_records_per_flush: default_max_records_per_flush(),
            functions: default_functions(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            contexts: default_contexts(),
            handles: default_handles(),
            max_value: default_max_value(),
            events_per_second: default_events_per_second(),
            max_events: 0,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            log_records: false,
            raw_window: default_raw_window(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        match self.window.policy {
            WindowKind::Time => {
                if self.window.interval.is_zero() {
                    bail!("window.interval must be positive");
                }
            }
            WindowKind::Count => {
                if self.window.size == 0 {
                    bail!("window.size must be positive");
                }
                if let Some(step) = self.window.step {
                    if step == 0 || self.window.size % step != 0 {
                        bail!("window.step must divide window.size");
                    }
                    if step != self.window.size {
                        bail!("window.step must equal window.size (windows are tumbling)");
                    }
                }
            }
            WindowKind::Session => {
                if self.window.gap.is_zero() {
                    bail!("window.gap must be positive");
                }
            }
        }

        if self.table.capacity == 0 {
            bail!("table.capacity must be positive");
        }

        if self.channel.capacity < 16 || self.channel.capacity % 8 != 0 {
            bail!("channel.capacity must be a multiple of 8 and at least 16 bytes");
        }

        if self.engine.max_records_per_flush == 0 {
            bail!("engine.max_records_per_flush must be positive");
        }

        if self.engine.mode == ModeKind::Aggregated {
            let flush_bytes = self
                .engine
                .max_records_per_flush
                .saturating_mul(AGGREGATED_RECORD_SIZE);
            if flush_bytes > self.channel.capacity - 8 {
                bail!(
                    "engine.max_records_per_flush ({} records, {flush_bytes} bytes) does not fit in channel.capacity",
                    self.engine.max_records_per_flush
                );
            }
        }

        if self.engine.mode == ModeKind::Aggregated && self.engine.functions.is_empty() {
            bail!("engine.functions must name at least one aggregate function");
        }

        if self.engine.mode == ModeKind::GlobalCounter {
            if self.engine.counter_threshold == 0 {
                bail!("engine.counter_threshold must be positive");
            }
            let batch_bytes = self.engine.counter_threshold.saturating_mul(8);
            if batch_bytes > (self.channel.capacity as u64).saturating_sub(8) {
                bail!("engine.counter_threshold batches do not fit in channel.capacity");
            }
        }

        match self.source.kind {
            SourceKind::Synthetic => {
                if self.source.synthetic.contexts == 0 {
                    bail!("source.synthetic.contexts must be positive");
                }
                if self.source.synthetic.handles == 0 {
                    bail!("source.synthetic.handles must be positive");
                }
            }
            SourceKind::Replay => {
                if self.source.replay.path.as_os_str().is_empty() {
                    bail!("source.replay.path is required");
                }
            }
        }

        if self.consumer.poll_interval.is_zero() {
            bail!("consumer.poll_interval must be positive");
        }

        if self.consumer.raw_window.is_zero() {
            bail!("consumer.raw_window must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        Ok(())
    }

    /// Window policy selected by `window.policy`.
    pub fn window_policy(&self) -> WindowPolicy {
        match self.window.policy {
            WindowKind::Time => WindowPolicy::time(self.window.interval),
            WindowKind::Count => WindowPolicy::Count {
                size: self.window.size,
            },
            WindowKind::Session => WindowPolicy::session(self.window.gap),
        }
    }

    /// Engine mode selected by `engine.mode`.
    pub fn engine_mode(&self) -> EngineMode {
        match self.engine.mode {
            ModeKind::Aggregated => EngineMode::Aggregated,
            ModeKind::PassThrough => EngineMode::PassThrough,
            ModeKind::GlobalCounter => EngineMode::GlobalCounter {
                threshold: self.engine.counter_threshold,
            },
        }
    }

    /// Engine construction parameters.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mode: self.engine_mode(),
            window: self.window_policy(),
            table_capacity: self.table.capacity,
            max_records_per_flush: self.engine.max_records_per_flush,
            fields: self
                .engine
                .functions
                .iter()
                .copied()
                .collect::<AggregateFields>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.window.interval, Duration::from_secs(1));
        assert_eq!(cfg.table.capacity, 16_384);
        assert_eq!(cfg.channel.capacity, 4_194_304);
        assert_eq!(cfg.engine.max_records_per_flush, 74_898);
        assert_eq!(cfg.engine.counter_threshold, 262_144);
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.consumer.raw_window, Duration::from_secs(1));
        assert!(cfg.stats_path.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
window:
  policy: count
  size: 500
  step: 500
table:
  capacity: 64
engine:
  mode: aggregated
  max_records_per_flush: 10
  functions: [count, max]
source:
  kind: replay
  replay:
    path: /tmp/events.bin
consumer:
  poll_interval: 250ms
  raw_window: 2s
stats_path: /tmp/sysagg-stats.csv
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.window_policy(), WindowPolicy::Count { size: 500 });
        assert_eq!(cfg.consumer.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.consumer.raw_window, Duration::from_secs(2));
        assert_eq!(cfg.stats_path, Some(PathBuf::from("/tmp/sysagg-stats.csv")));
        assert_eq!(cfg.source.kind, SourceKind::Replay);

        let engine = cfg.engine_config();
        assert_eq!(engine.table_capacity, 64);
        assert!(engine.fields.contains(AggregateFunction::Max));
        assert!(!engine.fields.contains(AggregateFunction::Sum));
    }

    #[test]
    fn test_parse_global_counter_mode() {
        let yaml = r#"
engine:
  mode: global_counter
  counter_threshold: 1024
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.engine_mode(), EngineMode::GlobalCounter { threshold: 1024 });
    }

    #[test]
    fn test_validation_zero_interval() {
        let cfg = Config {
            window: WindowConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("window.interval"));
    }

    #[test]
    fn test_validation_count_step_must_equal_size() {
        let mut cfg = Config {
            window: WindowConfig {
                policy: WindowKind::Count,
                size: 100,
                step: Some(30),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("divide"));

        cfg.window.step = Some(50);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must equal"));

        cfg.window.step = Some(100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_channel_capacity() {
        let cfg = Config {
            channel: ChannelConfig { capacity: 100 },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("channel.capacity"));
    }

    #[test]
    fn test_validation_counter_threshold_fits_channel() {
        let cfg = Config {
            channel: ChannelConfig { capacity: 1024 },
            engine: EngineSection {
                mode: ModeKind::GlobalCounter,
                counter_threshold: 1 << 18,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("counter_threshold"));
    }

    #[test]
    fn test_validation_flush_limit_fits_channel() {
        let mut cfg = Config {
            channel: ChannelConfig { capacity: 4096 },
            engine: EngineSection {
                max_records_per_flush: 74,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_records_per_flush"));

        // (4096 - 8) / 56 = 73 records fit one reservation.
        cfg.engine.max_records_per_flush = 73;
        assert!(cfg.validate().is_ok());

        // Pass-through never reserves whole windows.
        cfg.engine.max_records_per_flush = 74;
        cfg.engine.mode = ModeKind::PassThrough;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_replay_requires_path() {
        let cfg = Config {
            source: SourceConfig {
                kind: SourceKind::Replay,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("source.replay.path"));
    }

    #[test]
    fn test_validation_empty_functions() {
        let cfg = Config {
            engine: EngineSection {
                functions: Vec::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("engine.functions"));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let yaml = "engine:\n  functions: [median]\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
