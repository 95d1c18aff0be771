use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm_params: LlmParams,
    #[serde(default)]
    pub stream_settings: StreamSettings,
    #[serde(default)]
    pub tool_settings: ToolSettings,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmParams {
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_rounds() -> u32 {
    4
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            connect_timeout_secs: None,
        }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: default_max_rounds(),
        }
    }
}

impl StreamSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        if config.llm_params.api_base.trim().is_empty() {
            anyhow::bail!("llm_params.api_base must not be empty");
        }
        Ok(config)
    }
}
