use crate::{LegatusError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// How sub-tasks of a campaign are executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One dev agent at a time, mutating the workspace in place.
    Sequential,
    /// Every ready sub-task at once, each in its own worktree and branch.
    Parallel,
}

/// Whether a gate runs per sub-task or once for the whole campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    PerSubtask,
    PerCampaign,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Empty selects the in-process backend (dev/test only; not durable).
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mem0Settings {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub image: String,
    pub network: String,
    /// Seconds before the agent runtime gives up. PM/Architect get half.
    pub timeout: u64,
    pub max_turns: u32,
    /// Docker volume source when the orchestrator itself runs in a
    /// container and `workspace_path` is container-internal.
    pub host_workspace_path: Option<String>,
    pub architect_review: bool,
    pub reviewer_enabled: bool,
    pub review_mode: ReviewMode,
    pub reviewer_max_retries: u32,
    pub qa_enabled: bool,
    pub qa_mode: ReviewMode,
    pub qa_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub redis: RedisSettings,
    pub mem0: Mem0Settings,
    pub orchestrator: OrchestratorSettings,
    pub agent: AgentSettings,
    pub workspace_path: PathBuf,
    pub worktree_base: PathBuf,
    pub dispatch_mode: DispatchMode,
    pub anthropic_api_key: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    /// Load settings from the environment (and `.env`, if present).
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let workspace_path = PathBuf::from(env_or("LEGATUS_WORKSPACE_PATH", "/workspace"));
        let worktree_base = env::var("LEGATUS_WORKTREE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_path.join(".legatus-worktrees"));

        let dispatch_mode = match env_or("LEGATUS_PARALLEL", "false").to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "parallel" => DispatchMode::Parallel,
            _ => DispatchMode::Sequential,
        };

        let review_mode = Self::parse_mode("LEGATUS_REVIEW_MODE")?;
        let qa_mode = Self::parse_mode("LEGATUS_QA_MODE")?;

        let agent = AgentSettings {
            image: env_or("LEGATUS_AGENT_IMAGE", "legatus-agent:latest"),
            network: env_or("LEGATUS_AGENT_NETWORK", "legatus_default"),
            timeout: env_parse("LEGATUS_AGENT_TIMEOUT", 600),
            max_turns: env_parse("LEGATUS_AGENT_MAX_TURNS", 50),
            host_workspace_path: env::var("LEGATUS_HOST_WORKSPACE_PATH").ok().filter(|v| !v.is_empty()),
            architect_review: env_bool("LEGATUS_ARCHITECT_REVIEW", true),
            reviewer_enabled: env_bool("LEGATUS_REVIEWER_ENABLED", false),
            review_mode,
            reviewer_max_retries: env_parse("LEGATUS_REVIEWER_MAX_RETRIES", 1),
            qa_enabled: env_bool("LEGATUS_QA_ENABLED", false),
            qa_mode,
            qa_max_retries: env_parse("LEGATUS_QA_MAX_RETRIES", 1),
        };

        if agent.timeout == 0 {
            return Err(LegatusError::Configuration(
                "LEGATUS_AGENT_TIMEOUT must be positive".to_string(),
            ));
        }

        Ok(Settings {
            redis: RedisSettings {
                url: env_or("LEGATUS_REDIS_URL", "redis://localhost:6379"),
            },
            mem0: Mem0Settings {
                url: env_or("LEGATUS_MEM0_URL", "http://localhost:8000"),
            },
            orchestrator: OrchestratorSettings {
                host: env_or("LEGATUS_HOST", "0.0.0.0"),
                port: env_parse("LEGATUS_PORT", 8420),
            },
            agent,
            workspace_path,
            worktree_base,
            dispatch_mode,
            anthropic_api_key: env_or("LEGATUS_ANTHROPIC_API_KEY", ""),
        })
    }

    fn parse_mode(key: &str) -> Result<ReviewMode> {
        match env_or(key, "per_subtask").to_lowercase().as_str() {
            "per_subtask" => Ok(ReviewMode::PerSubtask),
            "per_campaign" => Ok(ReviewMode::PerCampaign),
            other => Err(LegatusError::Configuration(format!(
                "{key} must be per_subtask or per_campaign, got {other:?}"
            ))),
        }
    }

    /// Is the reviewer gate configured for a task at this level?
    pub fn reviewer_for(&self, is_subtask: bool) -> bool {
        self.agent.reviewer_enabled
            && match self.agent.review_mode {
                ReviewMode::PerSubtask => is_subtask,
                ReviewMode::PerCampaign => !is_subtask,
            }
    }

    /// Is the QA gate configured for a task at this level?
    pub fn qa_for(&self, is_subtask: bool) -> bool {
        self.agent.qa_enabled
            && match self.agent.qa_mode {
                ReviewMode::PerSubtask => is_subtask,
                ReviewMode::PerCampaign => !is_subtask,
            }
    }

    /// Test-friendly defaults: in-memory store, sequential dispatch, no
    /// gates, pointing at a caller-provided workspace.
    pub fn test_settings(workspace: impl Into<PathBuf>) -> Self {
        let workspace_path = workspace.into();
        let worktree_base = workspace_path.join(".legatus-worktrees");
        Settings {
            redis: RedisSettings { url: String::new() },
            mem0: Mem0Settings {
                url: "http://localhost:8000".to_string(),
            },
            orchestrator: OrchestratorSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            agent: AgentSettings {
                image: "legatus-agent:test".to_string(),
                network: "none".to_string(),
                timeout: 30,
                max_turns: 5,
                host_workspace_path: None,
                architect_review: false,
                reviewer_enabled: false,
                review_mode: ReviewMode::PerSubtask,
                reviewer_max_retries: 1,
                qa_enabled: false,
                qa_mode: ReviewMode::PerSubtask,
                qa_max_retries: 1,
            },
            workspace_path,
            worktree_base,
            dispatch_mode: DispatchMode::Sequential,
            anthropic_api_key: String::new(),
        }
    }
}
