use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub assets: AssetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    /// Host advertised in rewritten asset URLs. May differ from the bind
    /// address when the relay sits behind NAT.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default = "default_public_port")]
    pub public_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_mcp_url")]
    pub url: String,
    #[serde(default = "default_mcp_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    #[serde(default = "default_asset_base_dir")]
    pub base_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            public_host: default_public_host(),
            public_port: default_public_port(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            url: default_mcp_url(),
            timeout_ms: default_mcp_timeout_ms(),
        }
    }
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            base_dir: default_asset_base_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            mcp: McpConfig::default(),
            assets: AssetConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(
        &mut self,
        bind: Option<&str>,
        llm_url: Option<&str>,
        mcp_url: Option<&str>,
    ) {
        if let Some(bind) = bind {
            self.server.bind = bind.to_owned();
        }
        if let Some(url) = llm_url {
            self.llm.url = url.to_owned();
        }
        if let Some(url) = mcp_url {
            self.mcp.url = url.to_owned();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SCENARIO_RELAY_BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_PUBLIC_HOST") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.public_host = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_PUBLIC_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.server.public_port = n;
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_LLM_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.llm.url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_LLM_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.llm.timeout_ms = n.max(1_000);
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_MCP_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.mcp.url = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_MCP_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.mcp.timeout_ms = n.max(1_000);
            }
        }
        if let Ok(v) = env::var("SCENARIO_RELAY_ASSET_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.assets.base_dir = PathBuf::from(trimmed);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.server.public_host.trim().is_empty() {
            anyhow::bail!("server.public_host must not be empty");
        }
        Url::parse(&self.llm.url)
            .with_context(|| format!("llm.url is not a valid URL: {}", self.llm.url))?;
        Url::parse(&self.mcp.url)
            .with_context(|| format!("mcp.url is not a valid URL: {}", self.mcp.url))?;
        if self.llm.timeout_ms == 0 || self.mcp.timeout_ms == 0 {
            anyhow::bail!("llm.timeout_ms and mcp.timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Base prefix used by the response rewriter for every asset URL it emits.
    pub fn public_base_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.server.public_host, self.server.public_port
        )
    }
}

fn default_server_bind() -> String {
    "0.0.0.0:8001".to_owned()
}

fn default_public_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_public_port() -> u16 {
    8001
}

fn default_llm_url() -> String {
    "http://localhost:8000/generate".to_owned()
}

fn default_llm_timeout_ms() -> u64 {
    120_000
}

fn default_mcp_url() -> String {
    "http://localhost:1337/mcp".to_owned()
}

fn default_mcp_timeout_ms() -> u64 {
    120_000
}

fn default_asset_base_dir() -> PathBuf {
    PathBuf::from("./dist/tools")
}
