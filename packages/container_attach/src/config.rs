use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use container_lifecycle::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_MIN_PREFIX_LEN, DEFAULT_OUTPUT_BUFFER, DEFAULT_READ_BUFFER_SIZE,
    DEFAULT_STDIN_BUFFER,
};

use crate::escape::DetachKeys;

// =============================================================================
// Layered config (figment: defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [attach]
//                    detach_keys = "ctrl-x,ctrl-y"
//
//   env var:         BERTH_ATTACH__DETACH_KEYS=ctrl-x,ctrl-y   (double underscore = nesting)

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub attach: AttachConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Runtime tunables (lives under `[runtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Shortest id prefix accepted as a container reference.
    #[serde(default = "default_min_prefix_len")]
    pub min_prefix_len: usize,
    /// Chunks buffered per output subscriber before it starts lagging.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    #[serde(default = "default_stdin_buffer")]
    pub stdin_buffer: usize,
    /// How long to wait for trailing output after the process exits.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_prefix_len: default_min_prefix_len(),
            output_buffer: default_output_buffer(),
            stdin_buffer: default_stdin_buffer(),
            drain_timeout_ms: default_drain_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl RuntimeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Attach tunables (lives under `[attach]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttachConfig {
    #[serde(default)]
    pub detach_keys: DetachKeys,
}

/// Logging (lives under `[log]` in config.toml). `RUST_LOG` wins when set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_min_prefix_len() -> usize {
    DEFAULT_MIN_PREFIX_LEN
}

fn default_output_buffer() -> usize {
    DEFAULT_OUTPUT_BUFFER
}

fn default_stdin_buffer() -> usize {
    DEFAULT_STDIN_BUFFER
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_millis() as u64
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_log_filter() -> String {
    "warn".to_string()
}

/// Build a figment that layers: defaults → config file → BERTH_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(BerthConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("BERTH_").split("__"))
}

impl BerthConfig {
    pub fn load(config_file: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        load_config(config_file)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", config_file.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_runtime_config_defaults() {
        let d = RuntimeConfig::default();
        assert_eq!(d.min_prefix_len, 4);
        assert_eq!(d.output_buffer, 1024);
        assert_eq!(d.stdin_buffer, 64);
        assert_eq!(d.drain_timeout(), Duration::from_secs(1));
        assert_eq!(d.read_buffer_size, 4096);
    }

    #[test]
    fn test_attach_config_defaults() {
        let d = AttachConfig::default();
        assert_eq!(d.detach_keys.as_bytes(), &[0x10, 0x11]);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let c = BerthConfig::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(c.runtime.min_prefix_len, 4);
        assert_eq!(c.attach.detach_keys, DetachKeys::default());
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[runtime]\nmin_prefix_len = 6\ndrain_timeout_ms = 250\n\n[attach]\ndetach_keys = \"ctrl-x,ctrl-y\"\n",
        )
        .unwrap();
        let c = BerthConfig::load(&path).unwrap();
        assert_eq!(c.runtime.min_prefix_len, 6);
        assert_eq!(c.runtime.drain_timeout(), Duration::from_millis(250));
        assert_eq!(c.runtime.output_buffer, 1024);
        assert_eq!(c.attach.detach_keys.as_bytes(), &[0x18, 0x19]);
    }

    #[test]
    fn test_load_config_rejects_bad_detach_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[attach]\ndetach_keys = \"ctrl-\"\n").unwrap();
        assert!(BerthConfig::load(&path).is_err());
    }
}
