//! GitHub state manager: creates a run-scoped repository from a read-only template in the
//! source org, under the evaluation org, and deletes it on cleanup.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::model::{InitialStateInfo, Task};
use crate::state_manager::StateManager;

const GITHUB_API_BASE: &str = "https://api.github.com";

pub struct GithubStateManager {
    client: Client,
    token: String,
    eval_org: String,
    source_org: String,
}

impl GithubStateManager {
    pub fn new(token: String, eval_org: String, source_org: String) -> Self {
        GithubStateManager {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("evalforge/0.1")
                .build()
                .expect("reqwest client builds with static config"),
            token,
            eval_org,
            source_org,
        }
    }

    fn repo_name(task: &Task, run_id: uuid::Uuid) -> String {
        format!("{}-{run_id}", task.name)
    }
}

#[async_trait]
impl StateManager for GithubStateManager {
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>> {
        let template_repo = task
            .meta
            .extra
            .get("template_repo")
            .and_then(|v| v.as_str())
            .ok_or("task meta.json missing template_repo")?;

        let repo_name = Self::repo_name(task, run_id);

        let created = self
            .client
            .post(format!(
                "{GITHUB_API_BASE}/repos/{}/{template_repo}/generate",
                self.source_org
            ))
            .bearer_auth(&self.token)
            .json(&json!({
                "owner": self.eval_org,
                "name": repo_name,
                "private": true,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        let full_name = created["full_name"]
            .as_str()
            .ok_or("github repo creation response missing full_name")?
            .to_string();
        let clone_url = created["clone_url"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let mut locators = HashMap::new();
        locators.insert("repo_full_name".to_string(), full_name.clone());
        locators.insert("repo_clone_url".to_string(), clone_url);

        Ok(InitialStateInfo {
            locators,
            state_handle: full_name,
        })
    }

    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let repo = self
            .client
            .get(format!("{GITHUB_API_BASE}/repos/{}", state.state_handle))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        Ok(repo)
    }

    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>> {
        let resp = self
            .client
            .delete(format!("{GITHUB_API_BASE}/repos/{}", state.state_handle))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceName, TaskMeta};
    use std::path::PathBuf;

    fn task(name: &str) -> Task {
        Task {
            service: ServiceName::Github,
            category: "repos".to_string(),
            name: name.to_string(),
            root: PathBuf::new(),
            description_template: String::new(),
            meta: TaskMeta {
                category_id: 1,
                category_name: "Repos".to_string(),
                tags: vec![],
                timeout_seconds: 60,
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn repo_name_is_task_name_suffixed_with_run_id() {
        let run_id = uuid::Uuid::nil();
        let name = GithubStateManager::repo_name(&task("open-a-pr"), run_id);
        assert_eq!(name, format!("open-a-pr-{run_id}"));
    }
}
