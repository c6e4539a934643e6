//! End-to-end pipeline test: runs a single `(task, model, run_index)` through the real
//! `FilesystemStateManager`, a stub [`ClientWrapper`] scripted to call one tool then finish,
//! a hermetic stdio tool server (an inline shell script, no `npx` involved), and a real
//! `verify.sh`, then checks the persisted [`TaskRunResult`] shape matches the filesystem
//! happy-path scenario.

use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use evalforge::agent_runner::AgentLimits;
use evalforge::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
use evalforge::event::EventHandler;
use evalforge::model::{Cancellation, RunContext, ServiceName, Task, TaskMeta};
use evalforge::pipeline::{self, PipelineDeps};
use evalforge::registry::{CredentialBundle, ToolServerLaunch};
use evalforge::state_manager::StateManager;
use evalforge::state_managers::filesystem::FilesystemStateManager;

struct NoopEvents;

#[async_trait]
impl EventHandler for NoopEvents {}

/// A tool server whose whole implementation is a one-line `sh -c` script, so the test needs
/// neither a real MCP package nor a temp file on disk for the server binary itself.
const TOOL_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *call_tool*) echo '{"result": {"ok": true}}' ;;
    *) echo '{"result": [{"name": "write_file", "description": "write a file", "inputSchema": {"type": "object", "properties": {}}}]}' ;;
  esac
done
"#;

/// Replies with a scripted assistant message per call: first issues a tool call, then finishes.
struct ScriptedClient {
    responses: StdMutex<VecDeque<Message>>,
}

impl ScriptedClient {
    fn new(responses: Vec<Message>) -> Self {
        ScriptedClient {
            responses: StdMutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn model_name(&self) -> &str {
        "stub-model"
    }

    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or(Message {
            role: Role::Assistant,
            content: Arc::from("done"),
            tool_calls: vec![],
        }))
    }
}

fn write_verifier(dir: &Path, exit_code: i32) {
    let path = dir.join("verify.sh");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh\nexit {exit_code}").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

fn task(root: &Path) -> Task {
    Task {
        service: ServiceName::Filesystem,
        category: "files".to_string(),
        name: "write-a-file".to_string(),
        root: root.to_path_buf(),
        description_template: "Write a greeting into {{test_directory}}.".to_string(),
        meta: TaskMeta {
            category_id: 1,
            category_name: "Files".to_string(),
            tags: vec![],
            timeout_seconds: 30,
            extra: Default::default(),
        },
    }
}

#[tokio::test]
async fn filesystem_happy_path_passes_verification() {
    let catalog_dir = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-{}",
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&catalog_dir).unwrap();
    write_verifier(&catalog_dir, 0);

    let output_root = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-out-{}",
        uuid::Uuid::new_v4()
    ));

    let ctx = RunContext {
        run_id: uuid::Uuid::new_v4(),
        task: task(&catalog_dir),
        model: "stub-model".to_string(),
        run_index: 0,
        k: 1,
        output_root: output_root.clone(),
    };

    let tool_call = Message {
        role: Role::Assistant,
        content: Arc::from(""),
        tool_calls: vec![NativeToolCall {
            id: "call_1".to_string(),
            name: "write_file".to_string(),
            arguments: serde_json::json!({"path": "greeting.txt", "content": "hello"}),
        }],
    };
    let final_answer = Message {
        role: Role::Assistant,
        content: Arc::from("Wrote the greeting file."),
        tool_calls: vec![],
    };

    let deps = PipelineDeps {
        state_manager: Arc::new(FilesystemStateManager::new(true)) as Arc<dyn StateManager>,
        client: Arc::new(ScriptedClient::new(vec![tool_call, final_answer])) as Arc<dyn ClientWrapper>,
        launch: ToolServerLaunch::Stdio {
            command: "sh",
            args: vec!["-c", TOOL_SERVER_SCRIPT],
            timeout_s: 5,
            cache_tools: false,
        },
        base_credentials: CredentialBundle::default(),
        limits: AgentLimits::default(),
        cancel: Cancellation::new(),
        events: Arc::new(NoopEvents),
    };

    let result = pipeline::run(&ctx, &deps).await;

    assert_eq!(result.attempts, 1);
    assert!(result.execution.completed, "agent execution should complete");
    assert!(result.execution.error_kind.is_none());
    let verification = result.verification.expect("verifier ran");
    assert!(verification.passed);
    assert_eq!(verification.exit_code, 0);

    // meta.json was persisted under the run directory.
    let meta_path = ctx.run_dir().join("meta.json");
    assert!(meta_path.is_file(), "expected {meta_path:?} to exist");

    std::fs::remove_dir_all(&catalog_dir).ok();
    std::fs::remove_dir_all(&output_root).ok();
}

#[tokio::test]
async fn failing_verifier_without_execution_failure_reports_unsuccessful_run() {
    let catalog_dir = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-failverify-{}",
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&catalog_dir).unwrap();
    write_verifier(&catalog_dir, 1);

    let output_root = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-failverify-out-{}",
        uuid::Uuid::new_v4()
    ));

    let ctx = RunContext {
        run_id: uuid::Uuid::new_v4(),
        task: task(&catalog_dir),
        model: "stub-model".to_string(),
        run_index: 0,
        k: 1,
        output_root: output_root.clone(),
    };

    let final_answer = Message {
        role: Role::Assistant,
        content: Arc::from("I think I'm done."),
        tool_calls: vec![],
    };

    let deps = PipelineDeps {
        state_manager: Arc::new(FilesystemStateManager::new(true)) as Arc<dyn StateManager>,
        client: Arc::new(ScriptedClient::new(vec![final_answer])) as Arc<dyn ClientWrapper>,
        launch: ToolServerLaunch::Stdio {
            command: "sh",
            args: vec!["-c", TOOL_SERVER_SCRIPT],
            timeout_s: 5,
            cache_tools: false,
        },
        base_credentials: CredentialBundle::default(),
        limits: AgentLimits::default(),
        cancel: Cancellation::new(),
        events: Arc::new(NoopEvents),
    };

    let result = pipeline::run(&ctx, &deps).await;

    assert!(result.execution.completed, "the agent itself did not error");
    let verification = result.verification.expect("verifier ran");
    assert!(!verification.passed);
    assert!(!result.succeeded());

    std::fs::remove_dir_all(&catalog_dir).ok();
    std::fs::remove_dir_all(&output_root).ok();
}

#[tokio::test]
async fn turn_limit_reached_skips_verification_and_is_not_a_success() {
    let catalog_dir = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-turnlimit-{}",
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&catalog_dir).unwrap();
    write_verifier(&catalog_dir, 0);

    let output_root = std::env::temp_dir().join(format!(
        "evalforge-pipeline-itest-turnlimit-out-{}",
        uuid::Uuid::new_v4()
    ));

    let ctx = RunContext {
        run_id: uuid::Uuid::new_v4(),
        task: task(&catalog_dir),
        model: "stub-model".to_string(),
        run_index: 0,
        k: 1,
        output_root: output_root.clone(),
    };

    // The client never stops calling tools, so the agent runner's turn budget trips first.
    // Two scripted responses is enough: with max_turns = 2 the loop never places a third
    // model call, it trips the budget check before making one.
    let endless_tool_call = || Message {
        role: Role::Assistant,
        content: Arc::from(""),
        tool_calls: vec![NativeToolCall {
            id: "call_1".to_string(),
            name: "write_file".to_string(),
            arguments: serde_json::json!({}),
        }],
    };

    let deps = PipelineDeps {
        state_manager: Arc::new(FilesystemStateManager::new(true)) as Arc<dyn StateManager>,
        client: Arc::new(ScriptedClient::new(vec![endless_tool_call(), endless_tool_call()]))
            as Arc<dyn ClientWrapper>,
        launch: ToolServerLaunch::Stdio {
            command: "sh",
            args: vec!["-c", TOOL_SERVER_SCRIPT],
            timeout_s: 5,
            cache_tools: false,
        },
        base_credentials: CredentialBundle::default(),
        limits: AgentLimits {
            max_turns: 2,
            ..AgentLimits::default()
        },
        cancel: Cancellation::new(),
        events: Arc::new(NoopEvents),
    };

    let result = pipeline::run(&ctx, &deps).await;

    assert!(!result.execution.completed);
    assert!(result.verification.is_none(), "verifier must not run after a budget failure");
    assert!(!result.succeeded());

    std::fs::remove_dir_all(&catalog_dir).ok();
    std::fs::remove_dir_all(&output_root).ok();
}
