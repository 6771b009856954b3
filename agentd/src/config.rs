use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/sentrywatch/sentrywatch.toml";
const ENV_CONFIG_PATH: &str = "SENTRYWATCH_CONFIG";

pub const MAX_TRACED_CGROUPS: u32 = 128;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SENTRYWATCH_CONFIG` environment variable. If the file is missing
    /// or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

/// The 6 configuration fields the core recognizes. Everything else
/// (CLI, rule-engine config, dump persistence settings) lives outside
/// this struct, consumed by surfaces that sit in front of the core.
#[derive(Debug, Deserialize, Clone)]
pub struct CoreConfig {
    /// Bytes; 0 means "use the component default".
    #[serde(default)]
    pub event_stream_buffer_size: u64,
    #[serde(default = "default_traced_cgroups_count")]
    pub activity_dump_traced_cgroups_count: u32,
    #[serde(default = "default_dump_timeout_secs", rename = "activity_dump_cgroup_dump_timeout_secs")]
    pub activity_dump_cgroup_dump_timeout_secs: u64,
    #[serde(default = "default_traced_event_types")]
    pub activity_dump_traced_event_types: Vec<String>,
    #[serde(default = "default_true")]
    pub map_dentry_resolution_enabled: bool,
    #[serde(default = "default_true")]
    pub out_of_band_dentry_resolution_enabled: bool,
}

impl CoreConfig {
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_dump_cgroup_dump_timeout_secs)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            event_stream_buffer_size: 0,
            activity_dump_traced_cgroups_count: default_traced_cgroups_count(),
            activity_dump_cgroup_dump_timeout_secs: default_dump_timeout_secs(),
            activity_dump_traced_event_types: default_traced_event_types(),
            map_dentry_resolution_enabled: true,
            out_of_band_dentry_resolution_enabled: true,
        }
    }
}

fn default_traced_cgroups_count() -> u32 {
    5
}

fn default_dump_timeout_secs() -> u64 {
    3600
}

fn default_traced_event_types() -> Vec<String> {
    vec!["open".to_string(), "exec".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_tick_ms")]
    pub reorder_tick_ms: u64,
    #[serde(default = "default_retention")]
    pub reorder_retention: u64,
    #[serde(default = "default_queue_cap")]
    pub reorder_queue_cap: usize,
    #[serde(default = "default_drops_per_interval")]
    pub drops_per_interval_threshold: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reorder_tick_ms: default_tick_ms(),
            reorder_retention: default_retention(),
            reorder_queue_cap: default_queue_cap(),
            drops_per_interval_threshold: default_drops_per_interval(),
        }
    }
}

fn default_tick_ms() -> u64 {
    50
}

fn default_retention() -> u64 {
    5
}

fn default_queue_cap() -> usize {
    10_000
}

fn default_drops_per_interval() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub journald: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            journald: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[core]
activity_dump_traced_cgroups_count = 5
activity_dump_cgroup_dump_timeout_secs = 3600
activity_dump_traced_event_types = ["open", "exec"]
[runtime]
reorder_tick_ms = 50
reorder_retention = 5
[logging]
level = "info"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.core.activity_dump_traced_cgroups_count, 5);
        assert_eq!(cfg.core.dump_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.runtime.reorder_tick_ms, 50);
        assert!(cfg.core.map_dentry_resolution_enabled);
        assert!(cfg.core.out_of_band_dentry_resolution_enabled);
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[core]\nactivity_dump_traced_cgroups_count = 9").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.core.activity_dump_traced_cgroups_count, 9);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/path/sentrywatch.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.core.activity_dump_traced_cgroups_count, 5);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
