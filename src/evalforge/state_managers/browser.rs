//! Browser state manager: instantiates an isolated browser context from a pre-authenticated
//! storage-state file for each run and closes it on cleanup. Unlike the other services the
//! "state" here is a live process handle rather than a remote resource, so `set` launches a
//! dedicated context process and `clean` terminates it.

use std::collections::HashMap;
use std::error::Error;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::model::{InitialStateInfo, Task};
use crate::state_manager::StateManager;

pub struct BrowserStateManager {
    headless: bool,
    browser: String,
    storage_state_path: Option<String>,
    handles: Mutex<HashMap<String, Child>>,
}

impl BrowserStateManager {
    pub fn new(headless: bool, browser: String, storage_state_path: Option<String>) -> Self {
        BrowserStateManager {
            headless,
            browser,
            storage_state_path,
            handles: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StateManager for BrowserStateManager {
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>> {
        let profile_dir = std::env::temp_dir().join(format!("evalforge-browser-{}-{run_id}", task.name));
        std::fs::create_dir_all(&profile_dir)?;

        let mut command = Command::new("npx");
        command
            .arg("-y")
            .arg("@playwright/mcp")
            .arg("--browser")
            .arg(&self.browser)
            .arg("--user-data-dir")
            .arg(&profile_dir);
        if self.headless {
            command.arg("--headless");
        }
        if let Some(storage_state) = &self.storage_state_path {
            command.arg("--storage-state").arg(storage_state);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn()?;
        let handle_key = format!("{}-{run_id}", task.name);

        let mut locators = HashMap::new();
        locators.insert("profile_dir".to_string(), profile_dir.to_string_lossy().to_string());

        self.handles.lock().await.insert(handle_key.clone(), child);

        Ok(InitialStateInfo {
            locators,
            state_handle: handle_key,
        })
    }

    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let handles = self.handles.lock().await;
        let alive = handles.contains_key(&state.state_handle);
        Ok(serde_json::json!({ "handle": state.state_handle, "alive": alive }))
    }

    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut handles = self.handles.lock().await;
        if let Some(mut child) = handles.remove(&state.state_handle) {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        Ok(())
    }
}
