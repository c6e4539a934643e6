//! State Manager (C3): the `Set` / `Retrieve` / `Clean` / `PrepareAgentConfig` interface every
//! service implements to give each run an isolated, reproducible sandbox.

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;

use crate::model::{InitialStateInfo, Task};
use crate::registry::CredentialBundle;

/// Per-service state lifecycle. Implementations must name every artefact they create with a
/// run-unique suffix (the `run_id` passed to every method) so concurrent runs against the same
/// task never collide, and must make `clean` idempotent so a retried pipeline can call it
/// against state that was already torn down.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Prepare isolated initial state for `task` under `run_id`. Returns the locators used to
    /// render the task description and an opaque handle `clean`/`retrieve` can use to find the
    /// state again.
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>>;

    /// Fetch the current contents of the prepared state, for verifiers or diagnostics that need
    /// to inspect it directly rather than through the tool server.
    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;

    /// Tear down everything `set` created. Must tolerate being called against state that no
    /// longer exists (e.g. a retried run whose previous attempt's cleanup already ran).
    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Produce the credential bundle the tool-server launcher substitutes into the service's
    /// launch descriptor for this specific run (e.g. a filesystem test directory path).
    fn prepare_agent_config(&self, state: &InitialStateInfo) -> CredentialBundle {
        let mut bundle = CredentialBundle::default();
        for (key, value) in &state.locators {
            bundle.extra_args.push(format!("{key}={value}"));
        }
        bundle
    }
}

/// Config needed by every state manager to resolve a task-local working root. Kept separate
/// from [`crate::registry::ServiceDefinition`] because state managers are constructed once per
/// service after config resolution, not looked up per-call.
pub struct StateManagerConfig {
    pub values: HashMap<String, String>,
}

impl StateManagerConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }
}
