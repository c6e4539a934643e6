// src/lib.rs

//! `evalforge` is an orchestrator for agentic-LLM evaluations: it enumerates tasks from an
//! on-disk catalog, prepares isolated per-task state for a target service, drives an LLM agent
//! against that service's MCP tool server under a turn/time budget, runs an out-of-process
//! verifier, and aggregates outcomes across services, models and repeated runs into pass@k-style
//! metrics.

pub mod evalforge;

// Re-exporting key items for easier external access.
pub use evalforge::client_wrapper::{ClientWrapper, Message, Role};

pub use evalforge::aggregator;
pub use evalforge::agent_runner;
pub use evalforge::artefacts;
pub use evalforge::catalog;
pub use evalforge::client_wrapper;
pub use evalforge::clients;
pub use evalforge::config;
pub use evalforge::event;
pub use evalforge::mcp;
pub use evalforge::model;
pub use evalforge::pipeline;
pub use evalforge::registry;
pub use evalforge::state_manager;
pub use evalforge::state_managers;
pub use evalforge::verifier_runner;
pub use evalforge::worker_pool;
