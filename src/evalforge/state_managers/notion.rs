//! Notion state manager: duplicates a template page tree into the evaluation workspace for each
//! run and deletes it on cleanup. The public Notion API has no atomic "duplicate page" endpoint,
//! so this walks the template's block children and recreates them under a new page the way the
//! original harness's duplication helper does, rather than a single API call.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::model::{InitialStateInfo, Task};
use crate::state_manager::StateManager;

const NOTION_VERSION: &str = "2022-06-28";
const NOTION_API_BASE: &str = "https://api.notion.com/v1";

pub struct NotionStateManager {
    client: Client,
    source_api_key: String,
    eval_api_key: String,
    eval_parent_page_title: String,
}

impl NotionStateManager {
    pub fn new(source_api_key: String, eval_api_key: String, eval_parent_page_title: String) -> Self {
        NotionStateManager {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
            source_api_key,
            eval_api_key,
            eval_parent_page_title,
        }
    }

    async fn find_parent_page_id(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let resp = self
            .client
            .post(format!("{NOTION_API_BASE}/search"))
            .bearer_auth(&self.eval_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&json!({ "query": self.eval_parent_page_title, "page_size": 1 }))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        resp["results"][0]["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| "eval parent page not found by title search".into())
    }

    async fn duplicate_template_page(
        &self,
        template_page_id: &str,
        parent_id: &str,
        title_suffix: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let template = self
            .client
            .get(format!("{NOTION_API_BASE}/pages/{template_page_id}"))
            .bearer_auth(&self.source_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        let mut properties = template["properties"].clone();
        if let Some(title_prop) = properties
            .as_object_mut()
            .and_then(|m| m.values_mut().find(|v| v["type"] == "title"))
        {
            if let Some(text) = title_prop["title"][0]["text"]["content"].as_str() {
                title_prop["title"][0]["text"]["content"] = json!(format!("{text} {title_suffix}"));
            }
        }

        let created = self
            .client
            .post(format!("{NOTION_API_BASE}/pages"))
            .bearer_auth(&self.eval_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&json!({
                "parent": { "page_id": parent_id },
                "properties": properties,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        let new_page_id = created["id"]
            .as_str()
            .ok_or("notion page creation response missing id")?
            .to_string();

        let children = self
            .client
            .get(format!("{NOTION_API_BASE}/blocks/{template_page_id}/children"))
            .bearer_auth(&self.source_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;

        if let Some(blocks) = children["results"].as_array() {
            if !blocks.is_empty() {
                self.client
                    .patch(format!("{NOTION_API_BASE}/blocks/{new_page_id}/children"))
                    .bearer_auth(&self.eval_api_key)
                    .header("Notion-Version", NOTION_VERSION)
                    .json(&json!({ "children": blocks }))
                    .send()
                    .await?
                    .error_for_status()?;
            }
        }

        Ok(new_page_id)
    }
}

#[async_trait]
impl StateManager for NotionStateManager {
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>> {
        let template_page_id = task
            .meta
            .extra
            .get("template_page_id")
            .and_then(|v| v.as_str())
            .ok_or("task meta.json missing template_page_id")?;

        let parent_id = self.find_parent_page_id().await?;
        let page_id = self
            .duplicate_template_page(template_page_id, &parent_id, &format!("(run {run_id})"))
            .await?;

        let mut locators = HashMap::new();
        locators.insert("page_id".to_string(), page_id.clone());
        locators.insert(
            "page_url".to_string(),
            format!("https://notion.so/{}", page_id.replace('-', "")),
        );

        Ok(InitialStateInfo {
            locators,
            state_handle: page_id,
        })
    }

    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let page = self
            .client
            .get(format!("{NOTION_API_BASE}/pages/{}", state.state_handle))
            .bearer_auth(&self.eval_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        Ok(page)
    }

    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>> {
        let resp = self
            .client
            .patch(format!("{NOTION_API_BASE}/pages/{}", state.state_handle))
            .bearer_auth(&self.eval_api_key)
            .header("Notion-Version", NOTION_VERSION)
            .json(&json!({ "archived": true }))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}
