//! Schedules several `(task, model, run_index)` runs through the real [`WorkerPool`] against a
//! hermetic filesystem task with a deliberately flaky verifier, persists each run's `meta.json`
//! via the real pipeline, then feeds the output tree through the aggregator and checks the
//! resulting `pass@1`/`pass@k`/`pass^k`/`avg@k` numbers match the `v = [1, 0, 1, 1]` example.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use evalforge::agent_runner::AgentLimits;
use evalforge::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition};
use evalforge::event::EventHandler;
use evalforge::model::{Cancellation, RunContext, ServiceName, Task, TaskMeta};
use evalforge::pipeline::PipelineDeps;
use evalforge::registry::{CredentialBundle, ToolServerLaunch};
use evalforge::state_manager::StateManager;
use evalforge::state_managers::filesystem::FilesystemStateManager;
use evalforge::aggregator;
use evalforge::worker_pool::{ScheduledRun, WorkerPool, WorkerPoolConfig};

struct NoopEvents;

#[async_trait]
impl EventHandler for NoopEvents {}

const TOOL_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  echo '{"result": [{"name": "write_file", "description": "write a file", "inputSchema": {"type": "object", "properties": {}}}]}'
done
"#;

/// Always answers immediately with no tool calls, so every run's agent execution succeeds;
/// whether the *run* succeeds is driven entirely by each run's own verifier exit code.
struct AlwaysDoneClient;

#[async_trait]
impl ClientWrapper for AlwaysDoneClient {
    fn model_name(&self) -> &str {
        "stub-model"
    }

    async fn send_message(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        Ok(Message {
            role: Role::Assistant,
            content: Arc::from("done"),
            tool_calls: vec![],
        })
    }
}

fn write_verifier(dir: &Path, exit_code: i32) {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

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
        name: "flaky-write".to_string(),
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
async fn worker_pool_runs_feed_aggregator_to_expected_k_run_metrics() {
    let catalog_dir = std::env::temp_dir().join(format!(
        "evalforge-kagg-itest-{}",
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&catalog_dir).unwrap();

    let output_root = std::env::temp_dir().join(format!(
        "evalforge-kagg-itest-out-{}",
        uuid::Uuid::new_v4()
    ));

    // v = [1, 0, 1, 1]: run 1 verifies, run 2 fails verification, runs 3 and 4 verify.
    let verifier_exit_codes = [0, 1, 0, 0];

    let cancel = Cancellation::new();
    let pool = WorkerPool::new(WorkerPoolConfig::default(), cancel.clone());

    let mut runs = Vec::new();
    for (run_index, exit_code) in verifier_exit_codes.iter().enumerate() {
        // Each run gets its own task root so its own verify.sh can have its own exit code;
        // the aggregator groups by task name, so give every one the same task identity.
        let task_root = catalog_dir.join(format!("run-{run_index}"));
        std::fs::create_dir_all(&task_root).unwrap();
        write_verifier(&task_root, *exit_code);
        let mut t = task(&task_root);
        t.name = "flaky-write".to_string();

        let ctx = RunContext {
            run_id: uuid::Uuid::new_v4(),
            task: t,
            model: "stub-model".to_string(),
            run_index: run_index as u32,
            k: verifier_exit_codes.len() as u32,
            output_root: output_root.clone(),
        };

        let deps = PipelineDeps {
            state_manager: Arc::new(FilesystemStateManager::new(true)) as Arc<dyn StateManager>,
            client: Arc::new(AlwaysDoneClient) as Arc<dyn ClientWrapper>,
            launch: ToolServerLaunch::Stdio {
                command: "sh",
                args: vec!["-c", TOOL_SERVER_SCRIPT],
                timeout_s: 5,
                cache_tools: false,
            },
            base_credentials: CredentialBundle::default(),
            limits: AgentLimits::default(),
            cancel: cancel.clone(),
            events: Arc::new(NoopEvents),
        };

        runs.push(ScheduledRun { ctx, deps });
    }

    // `pipeline::run` (invoked by the pool) already persisted each run's own `meta.json` under
    // `output_root` as a side effect, keyed by its own `run_index` — no separate write needed.
    let results = pool.run_all(runs).await;
    assert_eq!(results.len(), 4);

    let discovered = aggregator::discover_results(&output_root).unwrap();
    assert_eq!(discovered.len(), 4);

    let summary = aggregator::aggregate(&discovered, 4, "k-agg-itest");
    assert_eq!(summary.detailed_task_metrics.len(), 1);
    let metrics = &summary.detailed_task_metrics["filesystem__stub-model/files/flaky-write"];
    assert_eq!(metrics.successes, 3);
    assert_eq!(metrics.pass_at_1, 1.0);
    assert_eq!(metrics.pass_at_k, 1.0);
    assert_eq!(metrics.pass_hat_k, 0.0);
    assert_eq!(metrics.avg_at_k, 0.75);
    assert_eq!(metrics.individual_results, vec![true, false, true, true]);

    std::fs::remove_dir_all(&catalog_dir).ok();
    std::fs::remove_dir_all(&output_root).ok();
}
