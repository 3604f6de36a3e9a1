use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TangoFsConfig {
    /// Lifetime of cached child enumerations and property values. `None`
    /// keeps them until explicitly invalidated.
    pub ttl_secs: Option<u64>,
    /// Minimum interval between two reads of the same attribute.
    pub attribute_debounce_ms: u64,
    /// Age after which an unconsumed precomputed read payload is discarded.
    pub overlay_stale_after_ms: u64,
    /// Stands in for `/` inside entity names at the filesystem boundary.
    pub slash_substitute: char,
    /// Regexes recognizing editor temporary files.
    pub temp_name_patterns: Vec<String>,
    pub attr_timeout_ms: u64,
    pub entry_timeout_ms: u64,
    pub uid: u32,
    pub gid: u32,
    /// Use the last property history date as the file mtime. Costs one
    /// history query per property.
    pub property_mtime_from_history: bool,
    /// Per-call timeout handed to the control-system client.
    pub request_timeout_ms: u64,
    /// Program the generated command scripts call to run a command.
    pub command_runner: String,
    /// Largest property file a write or truncate may produce.
    pub max_property_bytes: usize,
}

impl Default for TangoFsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Some(10),
            attribute_debounce_ms: 500,
            overlay_stale_after_ms: 5000,
            slash_substitute: '%',
            temp_name_patterns: vec![r"^sed\w{6}$".to_string()],
            attr_timeout_ms: 1000,
            entry_timeout_ms: 1000,
            uid: 0,
            gid: 0,
            property_mtime_from_history: false,
            request_timeout_ms: 3000,
            command_runner: "tangofs".to_string(),
            max_property_bytes: 16 << 20,
        }
    }
}

impl TangoFsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: TangoFsConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: TangoFsConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }

    pub fn attribute_debounce(&self) -> Duration {
        Duration::from_millis(self.attribute_debounce_ms)
    }

    pub fn overlay_stale_after(&self) -> Duration {
        Duration::from_millis(self.overlay_stale_after_ms)
    }

    pub fn attr_timeout(&self) -> Duration {
        Duration::from_millis(self.attr_timeout_ms)
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}
