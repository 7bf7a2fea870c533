//! End-to-end orchestration scenarios.
//!
//! These drive the event reactor directly with synthetic agent messages
//! over the in-process store, a fake container runtime, and a real git
//! repository in a temp directory.

#[cfg(test)]
mod scenario_tests;
