//! Artefact persistence for a single run (§4.6.4): `meta.json`, `messages.json`, and the
//! task's retrieved `state.json`, always written atomically via a temp file plus rename so a
//! crash mid-write never leaves a half-written artefact for the aggregator to trip over.

use std::io;
use std::path::Path;

use serde::Serialize;

use crate::model::{AgentTrace, RunContext, TaskRunResult};

/// Serialise `value` as pretty JSON to `path`, writing to `path.tmp` first and renaming into
/// place. `rename` is atomic on the same filesystem, so readers only ever see the old or the
/// new complete file, never a partial one.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, body)?;
    std::fs::rename(&tmp_path, path)
}

/// Persist a completed run's `meta.json`.
pub fn write_meta(ctx: &RunContext, result: &TaskRunResult) -> io::Result<()> {
    write_atomic(&ctx.run_dir().join("meta.json"), result)
}

/// Persist the agent's ordered event trace as `messages.json`.
pub fn write_trace(ctx: &RunContext, trace: &AgentTrace) -> io::Result<()> {
    write_atomic(&ctx.run_dir().join("messages.json"), trace)
}

/// Persist the task's retrieved post-execution state as `state.json`, when the pipeline
/// chose to capture it for diagnostics.
pub fn write_state(ctx: &RunContext, state: &serde_json::Value) -> io::Result<()> {
    write_atomic(&ctx.run_dir().join("state.json"), state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("meta.json");
        write_atomic(&path, &HashMap::from([("a", 1)])).unwrap();
        assert!(path.is_file());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn write_atomic_overwrites_existing_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        write_atomic(&path, &HashMap::from([("a", 1)])).unwrap();
        write_atomic(&path, &HashMap::from([("a", 2)])).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains('2'));
    }
}
