use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

use crate::config::Config;
use crate::llm::LlmClient;
use crate::mcp::McpClient;
use crate::relay_server::{RelayServer, ServerState};

pub struct RelayRuntime {
    config: Config,
    state: Arc<ServerState>,
}

impl RelayRuntime {
    /// Builds the shared HTTP client and performs the MCP handshake. A
    /// handshake failure bubbles out of `main` and the process exits before
    /// serving anything; no tool call can succeed without a session.
    pub async fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed building shared HTTP client")?;
        let mcp = McpClient::connect(
            http.clone(),
            config.mcp.url.clone(),
            config.mcp.timeout_ms,
        )
        .await
        .context("mcp session initialization failed")?;
        let llm = LlmClient::new(http, config.llm.url.clone(), config.llm.timeout_ms);
        let state = Arc::new(ServerState {
            llm,
            mcp,
            public_base: config.public_base_url(),
            asset_dir: config.assets.base_dir.clone(),
            started_at: Instant::now(),
        });
        Ok(Self { config, state })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting relay (bind={}, llm={}, mcp={}, assets={}, public={})",
            self.config.server.bind,
            self.config.llm.url,
            self.config.mcp.url,
            self.config.assets.base_dir.display(),
            self.state.public_base
        );

        let server = RelayServer::new(self.state.clone());
        tokio::select! {
            res = server.run(&self.config.server.bind) => res,
            _ = signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                Ok(())
            }
        }
    }
}
