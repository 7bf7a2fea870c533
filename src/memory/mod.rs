//! Client for the semantic memory service (a Mem0-style HTTP API).
//!
//! Memory is advisory: every caller treats failures as absence, and
//! nothing in orchestration ever blocks on this service.

use crate::{LegatusError, Result};
use serde_json::{json, Value};
use std::time::Duration;

/// Scoping for memories: either the global user namespace or a
/// per-project namespace.
#[derive(Debug, Clone)]
pub enum MemoryNamespace {
    Global,
    Project(String),
}

impl MemoryNamespace {
    pub fn from_query(namespace: &str, project_id: Option<&str>) -> Self {
        if namespace == "global" {
            MemoryNamespace::Global
        } else {
            MemoryNamespace::Project(project_id.unwrap_or("default").to_string())
        }
    }

    /// (user_id, agent_id) pair the memory API scopes by.
    fn scope(&self) -> (Option<String>, Option<String>) {
        match self {
            MemoryNamespace::Global => (Some("legatus".to_string()), None),
            MemoryNamespace::Project(project) => (None, Some(format!("project-{project}"))),
        }
    }
}

#[derive(Clone)]
pub struct MemoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl MemoryClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn list(&self, namespace: &MemoryNamespace) -> Result<Vec<Value>> {
        let (user_id, agent_id) = namespace.scope();
        let mut request = self.http.get(format!("{}/memories", self.base_url));
        if let Some(user_id) = user_id {
            request = request.query(&[("user_id", user_id)]);
        }
        if let Some(agent_id) = agent_id {
            request = request.query(&[("agent_id", agent_id)]);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(unwrap_results(response.json().await?))
    }

    pub async fn search(
        &self,
        query: &str,
        namespace: &MemoryNamespace,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let (user_id, agent_id) = namespace.scope();
        let mut payload = json!({ "query": query, "limit": limit });
        if let Some(user_id) = user_id {
            payload["user_id"] = json!(user_id);
        }
        if let Some(agent_id) = agent_id {
            payload["agent_id"] = json!(agent_id);
        }
        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(unwrap_results(response.json().await?))
    }

    pub async fn delete(&self, memory_id: &str) -> Result<()> {
        // Path-injection guard: ids are opaque but must stay one segment.
        if memory_id.contains('/') || memory_id.contains("..") {
            return Err(LegatusError::Memory(format!(
                "invalid memory id: {memory_id}"
            )));
        }
        self.http
            .delete(format!("{}/memories/{memory_id}", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The memory API sometimes wraps lists as `{"results": [...]}`.
fn unwrap_results(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
