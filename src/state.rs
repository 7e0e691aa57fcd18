//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::session::SessionHandle;
use crate::core::tools::{HttpTool, ToolRegistry};
use crate::transcript::TranscriptRepository;

/// A session currently served by this process.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub handle: SessionHandle,
    pub started_at: OffsetDateTime,
}

/// State shared by every route.
#[derive(Debug)]
pub struct AppState {
    pub config: ServerConfig,
    /// `None` when transcript persistence is disabled
    pub transcripts: Option<Arc<TranscriptRepository>>,
    /// Shared client for webhook tools
    pub http_client: reqwest::Client,
    /// Live sessions by id
    pub sessions: DashMap<String, ActiveSession>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let transcripts = match &config.transcript_dir {
            Some(dir) => {
                let repo = TranscriptRepository::open(dir)?;
                info!(dir = %dir.display(), "Transcript persistence enabled");
                Some(Arc::new(repo))
            }
            None => None,
        };

        let http_client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Arc::new(Self {
            config,
            transcripts,
            http_client,
            sessions: DashMap::new(),
        }))
    }

    /// Webhook tools from the configuration, ready to hand to a new session.
    ///
    /// Tools marked dangerous are refused under the safe-only approval
    /// policy.
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in &self.config.tools {
            let handler = match HttpTool::from_config(self.http_client.clone(), tool) {
                Ok(handler) => Arc::new(handler),
                Err(e) => {
                    warn!(tool = %tool.name, error = %e, "Skipping webhook tool with invalid url");
                    continue;
                }
            };
            let result = if tool.dangerous {
                registry.register_dangerous(tool.definition(), handler)
            } else {
                registry.register(tool.definition(), handler)
            };
            if let Err(e) = result {
                warn!(tool = %tool.name, error = %e, "Skipping webhook tool");
            }
        }
        registry
    }
}
