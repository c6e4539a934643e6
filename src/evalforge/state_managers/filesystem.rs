//! Filesystem state manager: copies a task's seed tree into a run-scoped temp directory and
//! removes it on cleanup. The `walkdir` copy/strip-prefix idiom and the tolerant
//! already-removed cleanup path mirror [`crate::verifier_runner`]'s own subprocess-lifecycle
//! care around cleaning up on every exit path.

use std::collections::HashMap;
use std::error::Error;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::model::{InitialStateInfo, Task};
use crate::state_manager::StateManager;

pub struct FilesystemStateManager {
    cleanup_on_exit: bool,
}

impl FilesystemStateManager {
    pub fn new(cleanup_on_exit: bool) -> Self {
        FilesystemStateManager { cleanup_on_exit }
    }

    fn run_root(task: &Task, run_id: uuid::Uuid) -> PathBuf {
        std::env::temp_dir().join(format!("evalforge-{}-{run_id}", task.name))
    }

    fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dst)?;
        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry?;
            let rel = entry.path().strip_prefix(src).expect("walked under src");
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateManager for FilesystemStateManager {
    async fn set(
        &self,
        task: &Task,
        run_id: uuid::Uuid,
    ) -> Result<InitialStateInfo, Box<dyn Error + Send + Sync>> {
        let seed_dir = task.root.join("seed");
        let test_directory = Self::run_root(task, run_id);

        if seed_dir.is_dir() {
            Self::copy_tree(&seed_dir, &test_directory)?;
        } else {
            std::fs::create_dir_all(&test_directory)?;
        }

        let mut locators = HashMap::new();
        locators.insert(
            "test_directory".to_string(),
            test_directory.to_string_lossy().to_string(),
        );

        Ok(InitialStateInfo {
            locators,
            state_handle: test_directory.to_string_lossy().to_string(),
        })
    }

    async fn retrieve(
        &self,
        state: &InitialStateInfo,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let root = PathBuf::from(&state.state_handle);
        let mut entries = Vec::new();
        if root.is_dir() {
            for entry in WalkDir::new(&root).min_depth(1) {
                let entry = entry?;
                entries.push(entry.path().strip_prefix(&root)?.to_string_lossy().to_string());
            }
        }
        Ok(serde_json::json!({ "entries": entries }))
    }

    async fn clean(&self, state: &InitialStateInfo) -> Result<(), Box<dyn Error + Send + Sync>> {
        if !self.cleanup_on_exit {
            return Ok(());
        }
        let root = PathBuf::from(&state.state_handle);
        match std::fs::remove_dir_all(&root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// `@modelcontextprotocol/server-filesystem` takes its sandbox root as a positional CLI
    /// argument rather than an environment variable, so this overrides the default
    /// key=value-pair projection with the bare directory path `mcp::launch` appends to its args.
    fn prepare_agent_config(&self, state: &InitialStateInfo) -> crate::registry::CredentialBundle {
        let mut bundle = crate::registry::CredentialBundle::default();
        bundle.extra_args.push(state.state_handle.clone());
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceName, TaskMeta};

    fn task_with_seed(root: &Path) -> Task {
        Task {
            service: ServiceName::Filesystem,
            category: "files".to_string(),
            name: "copy-seed".to_string(),
            root: root.to_path_buf(),
            description_template: String::new(),
            meta: TaskMeta {
                category_id: 1,
                category_name: "Files".to_string(),
                tags: vec![],
                timeout_seconds: 60,
                extra: Default::default(),
            },
        }
    }

    #[tokio::test]
    async fn set_copies_seed_and_clean_removes_it() {
        let base = std::env::temp_dir().join(format!("evalforge-test-{}", uuid::Uuid::new_v4()));
        let seed = base.join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        std::fs::write(seed.join("a.txt"), b"hello").unwrap();

        let manager = FilesystemStateManager::new(true);
        let task = task_with_seed(&base);
        let run_id = uuid::Uuid::new_v4();

        let state = manager.set(&task, run_id).await.unwrap();
        let test_dir = PathBuf::from(&state.state_handle);
        assert!(test_dir.join("a.txt").is_file());

        manager.clean(&state).await.unwrap();
        assert!(!test_dir.exists());

        // Idempotent: cleaning already-cleaned state does not error.
        manager.clean(&state).await.unwrap();

        std::fs::remove_dir_all(&base).ok();
    }
}
