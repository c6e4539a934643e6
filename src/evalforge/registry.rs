//! Service Registry (C1): one declarative definition per supported service, modelled closely on
//! the `SERVICES` table this crate's evaluation harness inherited its shape from — each service
//! names its config schema, its tool-server launch descriptor, and the projection of resolved
//! config into the credential bundle handed to the agent at launch time.

use std::collections::HashMap;

use crate::config::{resolve, ConfigKeySpec, ConfigValue, ResolvedConfig, Transform, Validator};
use crate::model::ServiceName;

/// Describes how to reach a task's MCP tool server.
#[derive(Debug, Clone)]
pub enum ToolServerLaunch {
    Stdio {
        command: &'static str,
        args: Vec<&'static str>,
        timeout_s: u64,
        cache_tools: bool,
    },
    Http {
        url: &'static str,
        timeout_s: u64,
        cache_tools: bool,
    },
}

/// A fully-specified service: its config schema and how to launch its tool server.
pub struct ServiceDefinition {
    pub name: ServiceName,
    pub config_schema: Vec<ConfigKeySpec>,
    pub launch: ToolServerLaunch,
}

/// Credential/header bundle handed to the tool-server launcher after `{key}` substitution.
#[derive(Debug, Clone, Default)]
pub struct CredentialBundle {
    pub env: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub extra_args: Vec<String>,
}

fn notion_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: ServiceName::Notion,
        config_schema: vec![
            ConfigKeySpec::new("source_api_key", "SOURCE_NOTION_API_KEY")
                .described("Notion API key for the source hub that holds task templates"),
            ConfigKeySpec::new("eval_api_key", "EVAL_NOTION_API_KEY")
                .described("Notion API key for the evaluation workspace"),
            ConfigKeySpec::new("eval_parent_page_title", "EVAL_PARENT_PAGE_TITLE")
                .described("Title of the parent page in the evaluation workspace"),
            ConfigKeySpec::new("playwright_headless", "PLAYWRIGHT_HEADLESS")
                .optional("true")
                .with_transform(Transform::Bool),
            ConfigKeySpec::new("playwright_browser", "PLAYWRIGHT_BROWSER")
                .optional("firefox")
                .with_validator(Validator::OneOf(&["chromium", "firefox", "webkit"])),
        ],
        launch: ToolServerLaunch::Stdio {
            command: "npx",
            args: vec!["-y", "@notionhq/notion-mcp-server"],
            timeout_s: 120,
            cache_tools: true,
        },
    }
}

fn github_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: ServiceName::Github,
        config_schema: vec![
            ConfigKeySpec::new("api_key", "GITHUB_TOKEN")
                .described("GitHub personal access token"),
            ConfigKeySpec::new("eval_org", "GITHUB_EVAL_ORG").optional("MCPLeague-Eval"),
            ConfigKeySpec::new("source_org", "GITHUB_SOURCE_ORG").optional("MCPLeague-Source"),
        ],
        launch: ToolServerLaunch::Http {
            url: "https://api.githubcopilot.com/mcp/",
            timeout_s: 30,
            cache_tools: true,
        },
    }
}

fn filesystem_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: ServiceName::Filesystem,
        config_schema: vec![
            ConfigKeySpec::new("test_root", "FILESYSTEM_TEST_ROOT")
                .optional("")
                .with_transform(Transform::Path),
            ConfigKeySpec::new("cleanup_on_exit", "FILESYSTEM_CLEANUP")
                .optional("true")
                .with_transform(Transform::Bool),
        ],
        launch: ToolServerLaunch::Stdio {
            command: "npx",
            args: vec!["-y", "@modelcontextprotocol/server-filesystem"],
            timeout_s: 120,
            cache_tools: true,
        },
    }
}

fn postgres_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: ServiceName::Postgres,
        config_schema: vec![
            ConfigKeySpec::new("host", "POSTGRES_HOST").optional("localhost"),
            ConfigKeySpec::new("port", "POSTGRES_PORT")
                .optional("5432")
                .with_transform(Transform::Int)
                .with_validator(Validator::Port),
            ConfigKeySpec::new("database", "POSTGRES_DATABASE"),
            ConfigKeySpec::new("username", "POSTGRES_USERNAME"),
            ConfigKeySpec::new("password", "POSTGRES_PASSWORD"),
        ],
        // No published MCP server exists for Postgres in the original catalog; the state
        // manager talks to the database directly, so the agent's tool server is assumed to be
        // started by the task's own fixtures and is addressed over stdio by the task's catalog
        // entry itself. We still declare a launch shape so the pipeline has something uniform
        // to dispatch on.
        launch: ToolServerLaunch::Stdio {
            command: "npx",
            args: vec!["-y", "@modelcontextprotocol/server-postgres"],
            timeout_s: 60,
            cache_tools: true,
        },
    }
}

fn browser_definition() -> ServiceDefinition {
    ServiceDefinition {
        name: ServiceName::Browser,
        config_schema: vec![
            ConfigKeySpec::new("playwright_headless", "PLAYWRIGHT_HEADLESS")
                .optional("true")
                .with_transform(Transform::Bool),
            ConfigKeySpec::new("playwright_browser", "PLAYWRIGHT_BROWSER")
                .optional("firefox")
                .with_validator(Validator::OneOf(&["chromium", "firefox", "webkit"])),
            ConfigKeySpec::new("storage_state_path", "BROWSER_STORAGE_STATE")
                .optional("")
                .with_transform(Transform::Path),
        ],
        launch: ToolServerLaunch::Stdio {
            command: "npx",
            args: vec!["-y", "@playwright/mcp"],
            timeout_s: 60,
            cache_tools: true,
        },
    }
}

/// Looks up [`ServiceDefinition`]s by name and resolves their config schemas.
pub struct ServiceRegistry {
    definitions: HashMap<ServiceName, ServiceDefinition>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        let mut definitions = HashMap::new();
        for def in [
            notion_definition(),
            github_definition(),
            filesystem_definition(),
            postgres_definition(),
            browser_definition(),
        ] {
            definitions.insert(def.name, def);
        }
        ServiceRegistry { definitions }
    }
}

impl ServiceRegistry {
    pub fn get(&self, service: ServiceName) -> Option<&ServiceDefinition> {
        self.definitions.get(&service)
    }

    pub fn services(&self) -> impl Iterator<Item = ServiceName> + '_ {
        self.definitions.keys().copied()
    }

    /// Resolve a service's config schema against CLI overrides and the environment.
    pub fn resolve(
        &self,
        service: ServiceName,
        cli_args: &HashMap<String, String>,
    ) -> Result<ResolvedConfig, crate::config::ConfigError> {
        let def = self.definitions.get(&service).ok_or_else(|| {
            crate::config::ConfigError {
                problems: vec![format!("no service definition for {service}")],
            }
        })?;
        resolve(&def.config_schema, cli_args)
    }
}

/// Substitute `{key}` placeholders in `template` using `values`, matching the original launch
/// descriptors' `"Bearer {notion_key}"`-style interpolation.
pub fn substitute_placeholders(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Project a resolved config into a credential bundle for Notion: the evaluation key is used
/// for the `Authorization` header, matching the `eval_config: {"notion_key": "eval_api_key"}`
/// mapping.
pub fn notion_credentials(resolved: &ResolvedConfig) -> CredentialBundle {
    let mut bundle = CredentialBundle::default();
    if let Some(ConfigValue::String(key)) = resolved.get("eval_api_key") {
        let mut values = HashMap::new();
        values.insert("notion_key".to_string(), key.clone());
        bundle.env.insert(
            "OPENAPI_MCP_HEADERS".to_string(),
            substitute_placeholders(
                r#"{"Authorization": "Bearer {notion_key}", "Notion-Version": "2022-06-28"}"#,
                &values,
            ),
        );
    }
    bundle
}

/// Project a resolved config into a credential bundle for GitHub.
pub fn github_credentials(resolved: &ResolvedConfig) -> CredentialBundle {
    let mut bundle = CredentialBundle::default();
    if let Some(ConfigValue::String(token)) = resolved.get("api_key") {
        let mut values = HashMap::new();
        values.insert("github_token".to_string(), token.clone());
        bundle.headers.insert(
            "Authorization".to_string(),
            substitute_placeholders("Bearer {github_token}", &values),
        );
        bundle
            .headers
            .insert("User-Agent".to_string(), "evalforge/0.1".to_string());
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_five_services() {
        let registry = ServiceRegistry::default();
        assert!(registry.get(ServiceName::Notion).is_some());
        assert!(registry.get(ServiceName::Github).is_some());
        assert!(registry.get(ServiceName::Filesystem).is_some());
        assert!(registry.get(ServiceName::Postgres).is_some());
        assert!(registry.get(ServiceName::Browser).is_some());
    }

    #[test]
    fn substitutes_multiple_placeholders() {
        let mut values = HashMap::new();
        values.insert("a".to_string(), "1".to_string());
        values.insert("b".to_string(), "2".to_string());
        assert_eq!(substitute_placeholders("{a}-{b}", &values), "1-2");
    }

    #[test]
    fn notion_credentials_embed_bearer_header_value() {
        let mut cli = HashMap::new();
        cli.insert("eval_api_key".to_string(), "secret-token".to_string());
        cli.insert("source_api_key".to_string(), "src-token".to_string());
        cli.insert(
            "eval_parent_page_title".to_string(),
            "Eval Root".to_string(),
        );
        let registry = ServiceRegistry::default();
        let resolved = registry.resolve(ServiceName::Notion, &cli).unwrap();
        let bundle = notion_credentials(&resolved);
        let header = bundle.env.get("OPENAPI_MCP_HEADERS").unwrap();
        assert!(header.contains("secret-token"));
    }
}
