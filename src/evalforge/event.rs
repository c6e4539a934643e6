//! Evaluation event system.
//!
//! Provides a callback-based observability layer for a single task run.
//! Implement [`EventHandler`] to receive real-time notifications about:
//!
//! - **Agent turns**: model round-trips, tool dispatch, budget exhaustion
//! - **State lifecycle**: service state prepared/cleaned for a run
//! - **Verification**: verifier process completion
//! - **Retries**: the pipeline scheduling a retryable attempt
//!
//! # Architecture
//!
//! Events flow through a single [`EventHandler`] trait with one method,
//! [`on_event`](EventHandler::on_event). The default implementation is a
//! no-op, so a handler only overrides what it cares about. Handlers are
//! wrapped in `Arc<dyn EventHandler>` and shared across the worker pool's
//! concurrent runs.
//!
//! The turn-level variants mirror [`crate::model::TraceEventKind`] exactly;
//! the agent runner's [`EventHandler`] implementation is what materialises
//! the ordered, timestamped [`crate::model::AgentTrace`] persisted as
//! `messages.json` (§3 of the task catalog layout), by appending every
//! [`EvalEvent::Turn`] it observes for its own `run_id`.
//!
//! # Example
//!
//! ```rust,no_run
//! use evalforge::event::{EvalEvent, EventHandler};
//! use async_trait::async_trait;
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventHandler for Logger {
//!     async fn on_event(&self, event: &EvalEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{ServiceName, TraceEventKind};

/// Events emitted while a single [`crate::model::RunContext`] is executed.
///
/// Every variant carries the `run_id` of the run it describes, so a handler
/// shared across the worker pool's concurrently executing runs can
/// demultiplex without external state.
#[derive(Debug, Clone)]
pub enum EvalEvent {
    /// An agent-runner turn event. Carries the same payload that is appended
    /// to the run's [`crate::model::AgentTrace`].
    Turn {
        run_id: Uuid,
        turn: u32,
        kind: TraceEventKind,
    },

    /// [`crate::state_manager::StateManager::set`] completed for this run.
    StatePrepared { run_id: Uuid, service: ServiceName },

    /// [`crate::state_manager::StateManager::clean`] completed for this run.
    StateCleaned {
        run_id: Uuid,
        service: ServiceName,
        /// `false` if cleanup itself failed; the pipeline logs but does not
        /// fail the run on a cleanup error.
        ok: bool,
    },

    /// The verifier process for this run finished.
    VerificationCompleted { run_id: Uuid, passed: bool },

    /// The pipeline classified an outcome as retryable and is about to
    /// re-attempt state preparation and execution.
    RetryScheduled {
        run_id: Uuid,
        attempt: u32,
        reason: String,
    },

    /// The run reached a terminal outcome (success, verification failure, or
    /// an exhausted retry budget) and its artefacts have been written.
    RunCompleted { run_id: Uuid },
}

/// Trait for receiving evaluation events.
///
/// The default implementation is a no-op, so a handler only needs to
/// override the variants it cares about.
///
/// # Thread Safety
///
/// The `Send + Sync` bound allows the handler to be shared across
/// concurrently executing runs via `Arc<dyn EventHandler>`. Make sure any
/// internal state uses appropriate synchronization (e.g. a `Mutex` or
/// `tokio::sync::mpsc` sender).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called whenever an [`EvalEvent`] is emitted.
    async fn on_event(&self, _event: &EvalEvent) {}
}
