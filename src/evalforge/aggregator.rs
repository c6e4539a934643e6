//! Aggregator (C7): turns a directory of persisted `meta.json` run results into `pass@1`,
//! `pass@k`, `pass^k`, and `avg@k` metrics.
//!
//! A direct, idiomatic port of `aggregate_k_runs.py`'s arithmetic: for every
//! `(service, category, task, model)` group, build the `v ∈ {0,1}^k` success vector across
//! run indices (a missing run counts as a failure) and compute
//! `pass@1 = v[0]`, `pass@k = 1` iff any run passed, `pass^k = 1` iff every run passed, and
//! `avg@k = successes / k`, each rounded to 4 decimal places to match the reference output.
//!
//! This crate's artefact layout nests `run-N` under `<service>/<category>/<task>/<model>/`
//! rather than the reference's `<run-N>/<service_model>/<task>/`, so grouping is done directly
//! from each `meta.json`'s own fields instead of from directory names.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use walkdir::WalkDir;

use crate::model::{GroupKMetrics, KRunSummary, OverallMetrics, ServiceName, TaskKMetrics, TaskRunResult};

#[derive(Debug, Clone)]
pub enum AggregatorError {
    Io(String),
    Json(String),
}

impl fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorError::Io(msg) => write!(f, "aggregator io error: {msg}"),
            AggregatorError::Json(msg) => write!(f, "aggregator meta.json error: {msg}"),
        }
    }
}

impl std::error::Error for AggregatorError {}

/// Walk `output_root` and parse every `meta.json` found beneath it into a [`TaskRunResult`].
/// Files that fail to parse are skipped with a `log::warn!`, matching the reference script's
/// "log and continue" behaviour rather than aborting the whole aggregation.
pub fn discover_results(output_root: &Path) -> Result<Vec<TaskRunResult>, AggregatorError> {
    let mut results = Vec::new();
    for entry in WalkDir::new(output_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name() == "meta.json")
    {
        let raw = std::fs::read_to_string(entry.path())
            .map_err(|e| AggregatorError::Io(e.to_string()))?;
        match serde_json::from_str::<TaskRunResult>(&raw) {
            Ok(result) => results.push(result),
            Err(e) => {
                log::warn!("aggregator: skipping malformed {}: {e}", entry.path().display());
            }
        }
    }
    Ok(results)
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct TaskKey {
    service: ServiceName,
    category: String,
    task_name: String,
    model: String,
}

/// Compute a [`KRunSummary`] for `results` assuming each task was run `k` times, recorded under
/// `experiment_name` (§6.6).
pub fn aggregate(results: &[TaskRunResult], k: u32, experiment_name: &str) -> KRunSummary {
    let mut by_task: HashMap<TaskKey, Vec<Option<&TaskRunResult>>> = HashMap::new();

    for result in results {
        let key = TaskKey {
            service: result.service,
            category: result.category.clone(),
            task_name: result.task_name.clone(),
            model: result.model.clone(),
        };
        let entry = by_task
            .entry(key)
            .or_insert_with(|| vec![None; k as usize]);
        let idx = result.run_index as usize;
        if idx < entry.len() {
            entry[idx] = Some(result);
        } else {
            log::warn!(
                "aggregator: run_index {idx} out of range for k={k} on task {}/{}",
                result.service,
                result.task_name
            );
        }
    }

    let mut tasks: Vec<TaskKMetrics> = by_task
        .into_iter()
        .map(|(key, slots)| {
            let individual_results: Vec<bool> =
                slots.iter().map(|s| s.map(|r| r.succeeded()).unwrap_or(false)).collect();
            let successes = individual_results.iter().filter(|&&s| s).count() as u32;
            let pass_at_1 = if individual_results.first().copied().unwrap_or(false) {
                1.0
            } else {
                0.0
            };
            let pass_at_k = if successes > 0 { 1.0 } else { 0.0 };
            let pass_hat_k = if successes == k { 1.0 } else { 0.0 };
            let avg_at_k = if k > 0 {
                successes as f64 / k as f64
            } else {
                0.0
            };
            let avg_execution_time = avg(slots
                .iter()
                .filter_map(|s| s.map(|r| r.execution.wall_clock.as_secs_f64())));
            let avg_token_usage = avg(slots
                .iter()
                .filter_map(|s| s.and_then(|r| r.execution.tokens_used).map(|t| t as f64)));
            TaskKMetrics {
                service: key.service,
                category: key.category,
                task_name: key.task_name,
                model: key.model,
                k,
                successes,
                pass_at_1: round4(pass_at_1),
                pass_at_k: round4(pass_at_k),
                pass_hat_k: round4(pass_hat_k),
                avg_at_k: round4(avg_at_k),
                individual_results,
                avg_execution_time: round4(avg_execution_time),
                avg_token_usage: round4(avg_token_usage),
            }
        })
        .collect();

    tasks.sort_by(|a, b| {
        (a.service.to_string(), &a.category, &a.task_name, &a.model)
            .cmp(&(b.service.to_string(), &b.category, &b.task_name, &b.model))
    });

    let mut by_group: HashMap<(ServiceName, String), Vec<&TaskKMetrics>> = HashMap::new();
    for t in &tasks {
        by_group
            .entry((t.service, t.model.clone()))
            .or_default()
            .push(t);
    }

    let mut groups: Vec<GroupKMetrics> = by_group
        .into_iter()
        .map(|((service, model), group_tasks)| {
            let n = group_tasks.len() as f64;
            GroupKMetrics {
                service,
                model,
                total_tasks: group_tasks.len(),
                pass_at_1: round4(mean(group_tasks.iter().map(|t| t.pass_at_1)) / mean_guard(n)),
                pass_at_k: round4(mean(group_tasks.iter().map(|t| t.pass_at_k)) / mean_guard(n)),
                pass_hat_k: round4(mean(group_tasks.iter().map(|t| t.pass_hat_k)) / mean_guard(n)),
                avg_at_k: round4(mean(group_tasks.iter().map(|t| t.avg_at_k)) / mean_guard(n)),
            }
        })
        .collect();
    groups.sort_by(|a, b| (a.service.to_string(), &a.model).cmp(&(b.service.to_string(), &b.model)));

    let overall = OverallMetrics {
        group_count: groups.len(),
        pass_at_1: round4(avg(groups.iter().map(|g| g.pass_at_1))),
        pass_at_k: round4(avg(groups.iter().map(|g| g.pass_at_k))),
        pass_hat_k: round4(avg(groups.iter().map(|g| g.pass_hat_k))),
        avg_at_k: round4(avg(groups.iter().map(|g| g.avg_at_k))),
    };

    let service_model_breakdown = groups
        .into_iter()
        .map(|g| (format!("{}__{}", g.service, g.model), g))
        .collect::<HashMap<_, _>>();

    let detailed_task_metrics = tasks
        .into_iter()
        .map(|t| {
            let key = format!("{}__{}/{}/{}", t.service, t.model, t.category, t.task_name);
            (key, t)
        })
        .collect::<HashMap<_, _>>();

    KRunSummary {
        experiment_name: experiment_name.to_string(),
        k,
        total_unique_tasks: detailed_task_metrics.len(),
        overall_metrics: overall,
        service_model_breakdown,
        detailed_task_metrics,
    }
}

/// Sum of an iterator of `f64`; paired with [`mean_guard`] below to divide by the real count
/// without a second pass, since `group_tasks` is already consumed by the time we need its length.
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    values.sum()
}

fn mean_guard(n: f64) -> f64 {
    if n == 0.0 {
        1.0
    } else {
        n
    }
}

/// Unweighted mean across an iterator of `f64`, 0.0 for an empty iterator.
fn avg(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn result(task: &str, model: &str, run_index: u32, passed: bool) -> TaskRunResult {
        TaskRunResult {
            run_id: Uuid::new_v4(),
            service: ServiceName::Filesystem,
            category: "files".to_string(),
            task_name: task.to_string(),
            model: model.to_string(),
            run_index,
            attempts: 1,
            execution: crate::model::ExecutionOutcome {
                completed: true,
                turns_used: 1,
                wall_clock: std::time::Duration::default(),
                tokens_used: None,
                error_kind: None,
                error_message: None,
            },
            verification: Some(crate::model::VerificationOutcome {
                passed,
                exit_code: if passed { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
                duration: std::time::Duration::default(),
                infra_failure: false,
            }),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn pass_at_k_is_one_when_any_run_succeeds() {
        let results = vec![
            result("copy", "gpt-4", 0, false),
            result("copy", "gpt-4", 1, true),
            result("copy", "gpt-4", 2, false),
        ];
        let summary = aggregate(&results, 3, "exp");
        assert_eq!(summary.detailed_task_metrics.len(), 1);
        let metrics = &summary.detailed_task_metrics["filesystem__gpt-4/files/copy"];
        assert_eq!(metrics.pass_at_k, 1.0);
        assert_eq!(metrics.pass_hat_k, 0.0);
        assert_eq!(metrics.pass_at_1, 0.0);
        assert_eq!(metrics.individual_results, vec![false, true, false]);
    }

    #[test]
    fn pass_hat_k_requires_every_run_to_succeed() {
        let results = vec![
            result("copy", "gpt-4", 0, true),
            result("copy", "gpt-4", 1, true),
        ];
        let summary = aggregate(&results, 2, "exp");
        let metrics = &summary.detailed_task_metrics["filesystem__gpt-4/files/copy"];
        assert_eq!(metrics.pass_hat_k, 1.0);
        assert_eq!(metrics.avg_at_k, 1.0);
    }

    #[test]
    fn missing_run_counts_as_failure() {
        let results = vec![result("copy", "gpt-4", 0, true)];
        let summary = aggregate(&results, 3, "exp");
        let metrics = &summary.detailed_task_metrics["filesystem__gpt-4/files/copy"];
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.avg_at_k, round4(1.0 / 3.0));
        assert_eq!(metrics.individual_results, vec![true, false, false]);
    }

    #[test]
    fn overall_is_unweighted_mean_across_groups() {
        let results = vec![
            result("copy", "gpt-4", 0, true),
            result("rename", "claude-3", 0, false),
        ];
        let summary = aggregate(&results, 1, "exp");
        assert_eq!(summary.service_model_breakdown.len(), 2);
        assert_eq!(summary.overall_metrics.avg_at_k, 0.5);
    }

    #[test]
    fn avg_execution_time_and_token_usage_average_over_observed_runs() {
        let mut r0 = result("copy", "gpt-4", 0, true);
        r0.execution.wall_clock = std::time::Duration::from_secs(10);
        r0.execution.tokens_used = Some(100);
        let mut r1 = result("copy", "gpt-4", 1, true);
        r1.execution.wall_clock = std::time::Duration::from_secs(20);
        r1.execution.tokens_used = Some(300);

        let summary = aggregate(&[r0, r1], 2, "exp");
        let metrics = &summary.detailed_task_metrics["filesystem__gpt-4/files/copy"];
        assert_eq!(metrics.avg_execution_time, 15.0);
        assert_eq!(metrics.avg_token_usage, 200.0);
    }
}
