//! The `legion` CLI: a thin HTTP client over the orchestrator.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_URL: &str = "http://localhost:8420";
const CONFIG_PATHS: [&str; 2] = [".agent-team/config.yaml", ".legatus/config.yaml"];

#[derive(Parser)]
#[command(
    name = "legion",
    about = "Legatus - multi-agent software engineering orchestration",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialise a project config in .legatus/
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
        /// Orchestrator URL to record
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Start a new campaign from a prompt
    Start {
        /// Task description
        prompt: Option<String>,
        /// Read the prompt from a spec file instead
        #[arg(long, short)]
        spec: Option<PathBuf>,
        /// Skip PM decomposition and run a single dev agent
        #[arg(long)]
        direct: bool,
    },
    /// Show tasks, agents, and pending checkpoints
    Status {
        /// Refresh every two seconds
        #[arg(long)]
        watch: bool,
    },
    /// Approve a pending checkpoint (the oldest, when no id is given)
    Approve { checkpoint_id: Option<String> },
    /// Reject a pending checkpoint
    Reject {
        checkpoint_id: String,
        reason: Option<String>,
    },
    /// Show the activity log
    Logs {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
        /// Stream events live over the WebSocket
        #[arg(long)]
        follow: bool,
    },
    /// Show the cost ledger for the current project
    Cost,
    /// Show finished tasks
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// Pause dispatching (running agents finish)
    Pause,
    /// Resume dispatching
    Resume,
    /// Inspect the semantic memory service
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
}

#[derive(Subcommand)]
pub enum MemoryCommands {
    /// List memories
    Show {
        #[arg(long, default_value = "project")]
        namespace: String,
    },
    /// Search memories by semantic similarity
    Search {
        query: String,
        #[arg(long, default_value = "project")]
        namespace: String,
    },
    /// Delete a memory by id
    Forget { memory_id: String },
    /// Dump all memories as JSON
    Export {
        #[arg(long, default_value = "project")]
        namespace: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    orchestrator: OrchestratorSection,
    #[serde(default)]
    project: ProjectSection,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorSection {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProjectSection {
    name: Option<String>,
}

fn load_file_config() -> FileConfig {
    for path in CONFIG_PATHS {
        let path = Path::new(path);
        if let Ok(contents) = std::fs::read_to_string(path) {
            match serde_yaml::from_str(&contents) {
                Ok(config) => return config,
                Err(e) => eprintln!("warning: malformed {}: {e}", path.display()),
            }
        }
    }
    FileConfig::default()
}

fn orchestrator_url(config: &FileConfig) -> String {
    if let Ok(url) = std::env::var("LEGATUS_ORCHESTRATOR_URL") {
        if !url.is_empty() {
            return url;
        }
    }
    config
        .orchestrator
        .url
        .clone()
        .unwrap_or_else(|| DEFAULT_URL.to_string())
}

struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base_url, http })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .with_context(|| format!("cannot connect to orchestrator at {}", self.base_url))?;
        Self::parse(response).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let mut request = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("cannot connect to orchestrator at {}", self.base_url))?;
        Self::parse(response).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let response = self
            .http
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("cannot connect to orchestrator at {}", self.base_url))?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> anyhow::Result<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("orchestrator returned {status}: {body}");
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }
}

/// Run one CLI invocation. Errors map to exit code 1 in the binary.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_file_config();
    let url = orchestrator_url(&config);
    let project = config.project.name.clone();
    let client = Client::new(url.clone())?;

    match cli.command {
        Commands::Init { name, url } => init_project(name, &url),
        Commands::Start { prompt, spec, direct } => {
            let prompt = match (prompt, spec) {
                (_, Some(spec)) => std::fs::read_to_string(&spec)
                    .with_context(|| format!("cannot read spec file {}", spec.display()))?,
                (Some(prompt), None) => prompt,
                (None, None) => bail!("provide a prompt or --spec <file>"),
            };

            let mut body = serde_json::json!({ "prompt": prompt, "direct": direct });
            if let Some(project) = &project {
                body["project"] = serde_json::json!(project);
            }
            let task = client.post("/tasks", Some(body)).await?;
            println!("Task created: {}", task["id"].as_str().unwrap_or("?"));
            println!("  Title:  {}", task["title"].as_str().unwrap_or("?"));
            println!("  Status: {}", task["status"].as_str().unwrap_or("?"));
            if let Some(agent) = task["assigned_to"].as_str() {
                println!("  Agent:  {agent}");
            }
            println!();
            println!("Run `legion status` to monitor progress");
            Ok(())
        }
        Commands::Status { watch } => {
            loop {
                print_status(&client).await?;
                if !watch {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                println!();
            }
            Ok(())
        }
        Commands::Approve { checkpoint_id } => {
            let id = match checkpoint_id {
                Some(id) => id,
                None => oldest_pending(&client).await?,
            };
            let cp = client.post(&format!("/checkpoints/{id}/approve"), None).await?;
            println!("Approved {} ({})", id, cp["title"].as_str().unwrap_or(""));
            Ok(())
        }
        Commands::Reject { checkpoint_id, reason } => {
            let reason = reason.unwrap_or_default();
            let path = format!(
                "/checkpoints/{checkpoint_id}/reject?reason={}",
                urlencode(&reason)
            );
            let cp = client.post(&path, None).await?;
            println!("Rejected {} ({})", checkpoint_id, cp["title"].as_str().unwrap_or(""));
            Ok(())
        }
        Commands::Logs { lines, follow } => {
            if follow {
                return follow_logs(&url).await;
            }
            let logs = client.get("/logs", &[("limit", lines.to_string())]).await?;
            for entry in logs.as_array().into_iter().flatten().rev() {
                println!(
                    "{} {:<14} task={} agent={}",
                    entry["timestamp"].as_str().unwrap_or(""),
                    entry["type"].as_str().unwrap_or("?"),
                    entry["task_id"].as_str().unwrap_or("-"),
                    entry["agent_id"].as_str().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Commands::Cost => {
            let mut query = Vec::new();
            if let Some(project) = &project {
                query.push(("project_id", project.clone()));
            }
            let costs = client.get("/costs", &query).await?;
            println!("Total: ${:.4}", costs["total"].as_f64().unwrap_or(0.0));
            if let Some(by_role) = costs["by_role"].as_object() {
                for (role, amount) in by_role {
                    println!("  {:<10} ${:.4}", role, amount.as_f64().unwrap_or(0.0));
                }
            }
            println!("Entries: {}", costs["entries"].as_array().map_or(0, |e| e.len()));
            Ok(())
        }
        Commands::History { lines } => {
            let tasks = client
                .get("/tasks/history", &[("limit", lines.to_string())])
                .await?;
            for task in tasks.as_array().into_iter().flatten() {
                println!(
                    "{:<14} {:<9} {}",
                    task["id"].as_str().unwrap_or("?"),
                    task["status"].as_str().unwrap_or("?"),
                    task["title"].as_str().unwrap_or("?"),
                );
            }
            Ok(())
        }
        Commands::Pause => {
            client.post("/system/pause", None).await?;
            println!("Dispatch paused. Running agents will finish.");
            Ok(())
        }
        Commands::Resume => {
            client.post("/system/resume", None).await?;
            println!("Dispatch resumed.");
            Ok(())
        }
        Commands::Memory { command } => run_memory(&client, project.as_deref(), command).await,
    }
}

fn init_project(name: Option<String>, url: &str) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "project".to_string())
    });

    std::fs::create_dir_all(".legatus")?;
    let config = format!(
        "project:\n  name: {name}\norchestrator:\n  url: {url}\n"
    );
    std::fs::write(".legatus/config.yaml", config)?;
    println!("Initialised .legatus/config.yaml for project `{name}`");
    Ok(())
}

async fn print_status(client: &Client) -> anyhow::Result<()> {
    let status = client.get("/system/status", &[]).await?;
    let tasks = client.get("/tasks", &[]).await?;
    let agents = client.get("/agents", &[]).await?;
    let checkpoints = client.get("/checkpoints", &[]).await?;

    if status["paused"].as_bool() == Some(true) {
        println!("[PAUSED]");
    }

    println!("Tasks:");
    for task in tasks.as_array().into_iter().flatten() {
        let indent = if task["parent_id"].is_string() { "    " } else { "  " };
        println!(
            "{}{:<14} {:<9} {}",
            indent,
            task["id"].as_str().unwrap_or("?"),
            task["status"].as_str().unwrap_or("?"),
            task["title"].as_str().unwrap_or("?"),
        );
    }

    let agents: Vec<_> = agents.as_array().cloned().unwrap_or_default();
    if !agents.is_empty() {
        println!("Agents:");
        for agent in &agents {
            println!(
                "  {:<18} {:<9} task={}",
                agent["id"].as_str().unwrap_or("?"),
                agent["status"].as_str().unwrap_or("?"),
                agent["task_id"].as_str().unwrap_or("-"),
            );
        }
    }

    let pending: Vec<_> = checkpoints.as_array().cloned().unwrap_or_default();
    if !pending.is_empty() {
        println!("Pending checkpoints:");
        for cp in &pending {
            println!(
                "  {:<12} [{}] {}",
                cp["id"].as_str().unwrap_or("?"),
                cp["source_role"].as_str().unwrap_or("?"),
                cp["title"].as_str().unwrap_or("?"),
            );
        }
        println!();
        println!("Resolve with `legion approve [id]` or `legion reject <id> [reason]`");
    }
    Ok(())
}

async fn oldest_pending(client: &Client) -> anyhow::Result<String> {
    let checkpoints = client.get("/checkpoints", &[]).await?;
    let first = checkpoints
        .as_array()
        .and_then(|list| list.first())
        .and_then(|cp| cp["id"].as_str())
        .map(str::to_string);
    match first {
        Some(id) => Ok(id),
        None => bail!("no pending checkpoints"),
    }
}

/// Stream agent events over the orchestrator WebSocket until interrupted.
async fn follow_logs(base_url: &str) -> anyhow::Result<()> {
    let ws_url = base_url
        .replacen("http://", "ws://", 1)
        .replacen("https://", "wss://", 1)
        + "/ws";

    let (stream, _) = tokio_tungstenite::connect_async(ws_url.as_str())
        .await
        .with_context(|| format!("cannot connect to {ws_url}"))?;
    let (_write, mut read) = stream.split();

    println!("Following agent events (ctrl-c to stop)...");
    while let Some(message) = read.next().await {
        let message = message?;
        if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
            match serde_json::from_str::<Value>(&text) {
                Ok(event) => println!(
                    "{} {:<14} task={} agent={}",
                    event["timestamp"].as_str().unwrap_or(""),
                    event["type"].as_str().unwrap_or("?"),
                    event["task_id"].as_str().unwrap_or("-"),
                    event["agent_id"].as_str().unwrap_or("-"),
                ),
                Err(_) => println!("{text}"),
            }
        }
    }
    Ok(())
}

async fn run_memory(
    client: &Client,
    project: Option<&str>,
    command: MemoryCommands,
) -> anyhow::Result<()> {
    let project_query = |namespace: &str| {
        let mut query = vec![("namespace", namespace.to_string())];
        if let Some(project) = project {
            query.push(("project_id", project.to_string()));
        }
        query
    };

    match command {
        MemoryCommands::Show { namespace } => {
            let memories = client.get("/memory", &project_query(&namespace)).await?;
            for memory in memories.as_array().into_iter().flatten() {
                println!(
                    "{:<14} {}",
                    memory["id"].as_str().unwrap_or("?"),
                    memory["memory"]
                        .as_str()
                        .or_else(|| memory["text"].as_str())
                        .unwrap_or("?"),
                );
            }
            Ok(())
        }
        MemoryCommands::Search { query, namespace } => {
            let mut params = project_query(&namespace);
            params.push(("query", query));
            let memories = client.get("/memory/search", &params).await?;
            for memory in memories.as_array().into_iter().flatten() {
                println!(
                    "{:<14} {}",
                    memory["id"].as_str().unwrap_or("?"),
                    memory["memory"]
                        .as_str()
                        .or_else(|| memory["text"].as_str())
                        .unwrap_or("?"),
                );
            }
            Ok(())
        }
        MemoryCommands::Forget { memory_id } => {
            client.delete(&format!("/memory/{memory_id}")).await?;
            println!("Forgot {memory_id}");
            Ok(())
        }
        MemoryCommands::Export { namespace, out } => {
            let memories = client.get("/memory", &project_query(&namespace)).await?;
            let dump = serde_json::to_string_pretty(&memories)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, dump)?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{dump}"),
            }
            Ok(())
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
