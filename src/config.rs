use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::output::OutputFormat;
use crate::pklg::protocol::DEFAULT_MAX_PAYLOAD;
use crate::pklg::provisioning::ProvisioningEvent;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub keys: Option<KeysConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TraceConfig {
    /// Largest accepted record payload; larger records abort the run
    pub max_record_len: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReassemblyConfig {
    pub max_sessions: usize,
    /// Idle time, in trace time, before a partial message is dropped
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Key material known before the trace starts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    /// Hex
    pub iv_index: Option<String>,
    /// Hex
    pub device_key: Option<String>,
    #[serde(default)]
    pub netkeys: Vec<IndexedKey>,
    #[serde(default)]
    pub appkeys: Vec<IndexedKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexedKey {
    pub index: u16,
    /// Hex
    pub key: String,
}

impl KeysConfig {
    /// The configured keys as provisioning lines, applied like in-band notes
    pub fn provisioning_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(iv_index) = &self.iv_index {
            lines.push(format!("mesh-iv-index: {}", iv_index));
        }
        if let Some(device_key) = &self.device_key {
            lines.push(format!("mesh-devkey: {}", device_key));
        }
        for k in &self.netkeys {
            lines.push(format!("mesh-netkey-{:04x}: {}", k.index, k.key));
        }
        for k in &self.appkeys {
            lines.push(format!("mesh-appkey-{:04x}: {}", k.index, k.key));
        }
        lines
    }

    /// Parse the configured keys. An entry that does not parse is skipped
    /// with a warning; the rest still apply.
    pub fn provisioning_events(&self) -> Vec<ProvisioningEvent> {
        let mut events = Vec::new();
        for line in self.provisioning_lines() {
            match ProvisioningEvent::parse(&line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Skipping [keys] entry {:?}: {:#}", line, e),
            }
        }
        events
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_sessions: 256,
            idle_timeout_secs: 60,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: TraceConfig::default(),
            reassembly: ReassemblyConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            keys: None,
        }
    }
}
