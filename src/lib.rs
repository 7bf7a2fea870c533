//! # Legatus
//!
//! Legatus orchestrates a team of ephemeral AI coding agents. A user
//! submits a feature request (a *campaign*); a PM agent decomposes it
//! into sub-tasks; dev agents execute each sub-task in an isolated
//! container on a private git branch; reviewer and QA gates check the
//! work; and human-in-the-loop checkpoints guard every irreversible
//! decision.
//!
//! ## Architecture
//!
//! The system consists of:
//! - **Event reactor**: single-consumer loop that advances the task
//!   state machine on agent events
//! - **Task dispatcher**: sequential or parallel (worktree-per-task)
//!   sub-task scheduling
//! - **Checkpoint manager**: human approval gates bound to tasks
//! - **Git operator**: workspace, branch, worktree, and merge discipline
//! - **Agent spawner**: ephemeral containers behind a runtime trait
//! - **Persistent store**: Redis-backed (or in-process) state, pub/sub,
//!   activity log, and cost ledger
//! - **HTTP/WebSocket API** and the `legion` CLI on top

/// HTTP API server and endpoints
pub mod api;
/// Checkpoint lifecycle management
pub mod checkpoints;
/// CLI client commands
pub mod cli;
/// System configuration
pub mod config;
/// Sub-task dispatching
pub mod dispatch;
/// Error types and handling
pub mod error;
/// Git operations on the workspace
pub mod git;
/// Semantic memory service client
pub mod memory;
/// Core data models
pub mod models;
/// Agent output parsers
pub mod parsers;
/// The event reactor
pub mod reactor;
/// Agent container spawning
pub mod spawner;
/// Persistent store and pub/sub
pub mod store;

#[cfg(test)]
mod tests;

pub use error::{LegatusError, Result};
