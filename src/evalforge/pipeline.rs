//! Pipeline (C6): drives one `(task, model, run_index)` through
//! `Start -> PreparingState -> Executing -> Verifying -> Reporting -> End`,
//! grounded on the teacher's orchestration engine shape — a typed state enum
//! owned by a `run()` method that returns a single typed report.
//!
//! Retry policy (§4.6.3): up to 3 attempts per retryable [`ErrorKind`],
//! exponential backoff base 2s capped at 30s with ±20% jitter, `clean`
//! invoked before every retry so a retried attempt never inherits another
//! attempt's leftover state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::agent_runner::{self, AgentLimits};
use crate::client_wrapper::ClientWrapper;
use crate::event::{EvalEvent, EventHandler};
use crate::mcp;
use crate::model::{
    Cancellation, ErrorKind, ExecutionOutcome, InitialStateInfo, RunContext, TaskRunResult,
    VerificationOutcome,
};
use crate::registry::{CredentialBundle, ToolServerLaunch};
use crate::state_manager::StateManager;
use crate::verifier_runner;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Start,
    PreparingState,
    Executing,
    Verifying,
    Reporting,
    End,
}

/// Everything the pipeline needs to drive a single run beyond the `RunContext` itself.
///
/// `base_credentials` carries the service-level secrets already resolved once from config
/// (API keys, org names); the pipeline merges the run-specific locators `state_manager.set`
/// produces on top of it before launching this run's own tool server.
pub struct PipelineDeps {
    pub state_manager: Arc<dyn StateManager>,
    pub client: Arc<dyn ClientWrapper>,
    pub launch: ToolServerLaunch,
    pub base_credentials: CredentialBundle,
    pub limits: AgentLimits,
    pub cancel: Cancellation,
    pub events: Arc<dyn EventHandler>,
}

/// Run one `(task, model, run_index)` end to end and return its persisted-shape report.
pub async fn run(ctx: &RunContext, deps: &PipelineDeps) -> TaskRunResult {
    let started_at = Utc::now();
    let mut state: Option<InitialStateInfo> = None;
    let mut rendered_description: Option<String> = None;
    let mut execution: Option<ExecutionOutcome> = None;
    let mut verification: Option<VerificationOutcome> = None;
    let mut attempts = 0u32;
    let mut phase = PipelineState::Start;

    loop {
        if deps.cancel.is_cancelled() {
            log::info!(
                "pipeline: run {} cancelled before completion ({:?})",
                ctx.run_id,
                phase
            );
            break;
        }

        phase = match phase {
            PipelineState::Start => PipelineState::PreparingState,
            PipelineState::PreparingState => {
                attempts += 1;
                log::info!(
                    "pipeline: run {} preparing state for {} (attempt {attempts})",
                    ctx.run_id,
                    ctx.task.qualified_name()
                );
                match deps.state_manager.set(&ctx.task, ctx.run_id).await {
                    Ok(info) => {
                        // Render the description against this run's actual locators now that
                        // they exist (§4.2.3); a placeholder with no matching locator is a
                        // fail-fast, non-retryable error distinct from state preparation itself.
                        match crate::catalog::render(&ctx.task.description_template, &info.locators) {
                            Ok(description) => {
                                rendered_description = Some(description);
                                state = Some(info);
                                deps.events
                                    .on_event(&EvalEvent::StatePrepared {
                                        run_id: ctx.run_id,
                                        service: ctx.task.service,
                                    })
                                    .await;
                                PipelineState::Executing
                            }
                            Err(e) => {
                                log::error!(
                                    "pipeline: run {} description template error: {e}",
                                    ctx.run_id
                                );
                                execution = Some(ExecutionOutcome {
                                    completed: false,
                                    turns_used: 0,
                                    wall_clock: Duration::default(),
                                    tokens_used: None,
                                    error_kind: Some(ErrorKind::StatePermanent),
                                    error_message: Some(e.to_string()),
                                });
                                state = Some(info);
                                PipelineState::Reporting
                            }
                        }
                    }
                    Err(e) => {
                        let kind = classify_state_error(&e);
                        if kind.is_retryable() && attempts < MAX_ATTEMPTS {
                            log::warn!(
                                "pipeline: run {} state prep failed transiently ({e}), retrying",
                                ctx.run_id
                            );
                            deps.events
                                .on_event(&EvalEvent::RetryScheduled {
                                    run_id: ctx.run_id,
                                    attempt: attempts,
                                    reason: e.to_string(),
                                })
                                .await;
                            backoff(attempts).await;
                            PipelineState::PreparingState
                        } else {
                            execution = Some(ExecutionOutcome {
                                completed: false,
                                turns_used: 0,
                                wall_clock: Duration::default(),
                                tokens_used: None,
                                error_kind: Some(kind),
                                error_message: Some(e.to_string()),
                            });
                            PipelineState::Reporting
                        }
                    }
                }
            }
            PipelineState::Executing => {
                let info = state.as_ref().expect("state prepared before executing");
                let credentials = merge_credentials(&deps.base_credentials, deps.state_manager.prepare_agent_config(info));

                let transport = match mcp::launch(&deps.launch, &credentials).await {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!("pipeline: run {} failed to launch tool server: {e}", ctx.run_id);
                        execution = Some(ExecutionOutcome {
                            completed: false,
                            turns_used: 0,
                            wall_clock: Duration::default(),
                            tokens_used: None,
                            error_kind: Some(ErrorKind::ToolServerUnavailable),
                            error_message: Some(e.to_string()),
                        });
                        if attempts < MAX_ATTEMPTS {
                            if let Err(e) = deps.state_manager.clean(info).await {
                                log::error!("pipeline: run {} cleanup before retry failed: {e}", ctx.run_id);
                            }
                            deps.events
                                .on_event(&EvalEvent::RetryScheduled {
                                    run_id: ctx.run_id,
                                    attempt: attempts,
                                    reason: "tool server unavailable".to_string(),
                                })
                                .await;
                            backoff(attempts).await;
                            attempts += 1;
                            state = None;
                            rendered_description = None;
                            phase = PipelineState::PreparingState;
                            continue;
                        }
                        phase = PipelineState::Reporting;
                        continue;
                    }
                };

                let description = rendered_description
                    .as_deref()
                    .expect("description rendered before executing");
                let (trace, outcome) = agent_runner::run(
                    ctx.run_id,
                    description,
                    None,
                    Arc::clone(&deps.client),
                    transport,
                    deps.limits.clone(),
                    deps.cancel.clone(),
                    Arc::clone(&deps.events),
                )
                .await;
                if let Err(e) = crate::artefacts::write_trace(ctx, &trace) {
                    log::error!("pipeline: run {} failed to persist trace: {e}", ctx.run_id);
                }

                let retryable_exec = outcome
                    .error_kind
                    .map(|k| k.is_retryable())
                    .unwrap_or(false);
                execution = Some(outcome);

                if retryable_exec && attempts < MAX_ATTEMPTS {
                    log::warn!(
                        "pipeline: run {} execution failed transiently, cleaning and retrying",
                        ctx.run_id
                    );
                    if let Err(e) = deps.state_manager.clean(info).await {
                        log::error!("pipeline: run {} cleanup before retry failed: {e}", ctx.run_id);
                    }
                    deps.events
                        .on_event(&EvalEvent::RetryScheduled {
                            run_id: ctx.run_id,
                            attempt: attempts,
                            reason: execution
                                .as_ref()
                                .and_then(|e| e.error_message.clone())
                                .unwrap_or_default(),
                        })
                        .await;
                    backoff(attempts).await;
                    attempts += 1;
                    state = None;
                    rendered_description = None;
                    PipelineState::PreparingState
                } else {
                    PipelineState::Verifying
                }
            }
            PipelineState::Verifying => {
                let exec = execution.as_ref().expect("execution ran before verifying");
                if !exec.completed {
                    PipelineState::Reporting
                } else {
                    let info = state.as_ref().expect("state prepared before verifying");
                    let credentials = merge_credentials(&deps.base_credentials, deps.state_manager.prepare_agent_config(info));
                    let mut env = env_from_credentials(&credentials, info);
                    env.insert(
                        "MCP_MESSAGES".to_string(),
                        ctx.run_dir().join("messages.json").to_string_lossy().to_string(),
                    );
                    let outcome = match verifier_runner::find_verifier(&ctx.task.root) {
                        Some(verifier_path) => {
                            verifier_runner::verify(
                                &verifier_path,
                                &ctx.task.root,
                                &env,
                                Duration::from_secs(ctx.task.meta.timeout_seconds),
                            )
                            .await
                        }
                        None => VerificationOutcome {
                            passed: false,
                            exit_code: -1,
                            stdout: String::new(),
                            stderr: "no verify.* found for task".to_string(),
                            duration: Duration::default(),
                            infra_failure: true,
                        },
                    };
                    deps.events
                        .on_event(&EvalEvent::VerificationCompleted {
                            run_id: ctx.run_id,
                            passed: outcome.passed,
                        })
                        .await;
                    verification = Some(outcome);
                    PipelineState::Reporting
                }
            }
            PipelineState::Reporting => {
                if let Some(info) = &state {
                    match deps.state_manager.retrieve(info).await {
                        Ok(retrieved) => {
                            if let Err(e) = crate::artefacts::write_state(ctx, &retrieved) {
                                log::error!("pipeline: run {} failed to persist state.json: {e}", ctx.run_id);
                            }
                        }
                        Err(e) => {
                            log::warn!("pipeline: run {} failed to retrieve final state: {e}", ctx.run_id);
                        }
                    }
                    if let Err(e) = deps.state_manager.clean(info).await {
                        log::error!("pipeline: run {} final cleanup failed: {e}", ctx.run_id);
                    }
                    deps.events
                        .on_event(&EvalEvent::StateCleaned {
                            run_id: ctx.run_id,
                            service: ctx.task.service,
                            ok: true,
                        })
                        .await;
                }
                PipelineState::End
            }
            PipelineState::End => break,
        };
    }

    let ended_at = Utc::now();
    let execution = execution.unwrap_or(ExecutionOutcome {
        completed: false,
        turns_used: 0,
        wall_clock: Duration::default(),
        tokens_used: None,
        error_kind: Some(ErrorKind::Orchestrator),
        error_message: Some("cancelled before execution".to_string()),
    });

    let result = TaskRunResult {
        run_id: ctx.run_id,
        service: ctx.task.service,
        category: ctx.task.category.clone(),
        task_name: ctx.task.name.clone(),
        model: ctx.model.clone(),
        run_index: ctx.run_index,
        attempts,
        execution,
        verification,
        started_at,
        ended_at,
    };

    if let Err(e) = crate::artefacts::write_meta(ctx, &result) {
        log::error!("pipeline: run {} failed to persist meta.json: {e}", ctx.run_id);
    }

    result
}

fn classify_state_error(e: &Box<dyn std::error::Error + Send + Sync>) -> ErrorKind {
    let msg = e.to_string().to_lowercase();
    if msg.contains("rate limit") || msg.contains("timeout") || msg.contains("connection") {
        ErrorKind::StateTransient
    } else {
        ErrorKind::StatePermanent
    }
}

/// Layer a run's state-specific locators on top of the service's already-resolved base
/// credentials; the base bundle's own keys win on collision since it represents the operator's
/// explicit configuration.
fn merge_credentials(base: &CredentialBundle, run_specific: CredentialBundle) -> CredentialBundle {
    let mut merged = run_specific;
    for (k, v) in &base.env {
        merged.env.insert(k.clone(), v.clone());
    }
    for (k, v) in &base.headers {
        merged.headers.insert(k.clone(), v.clone());
    }
    merged.extra_args.extend(base.extra_args.iter().cloned());
    merged
}

fn env_from_credentials(
    credentials: &CredentialBundle,
    info: &InitialStateInfo,
) -> std::collections::HashMap<String, String> {
    let mut env = credentials.env.clone();
    for (k, v) in &info.locators {
        env.entry(k.to_uppercase()).or_insert_with(|| v.clone());
    }
    env
}

async fn backoff(attempt: u32) {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let base = exp.min(BACKOFF_CAP);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let millis = (base.as_millis() as f64) * (1.0 + jitter_frac);
    tokio::time::sleep(Duration::from_millis(millis.max(0.0) as u64)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_credentials_prefers_base_on_collision() {
        let mut base = CredentialBundle::default();
        base.env.insert("API_KEY".to_string(), "base-key".to_string());
        let mut run_specific = CredentialBundle::default();
        run_specific.env.insert("API_KEY".to_string(), "stale".to_string());
        run_specific.env.insert("TEST_DIR".to_string(), "/tmp/x".to_string());

        let merged = merge_credentials(&base, run_specific);
        assert_eq!(merged.env.get("API_KEY").unwrap(), "base-key");
        assert_eq!(merged.env.get("TEST_DIR").unwrap(), "/tmp/x");
    }
}
