//! Agent Runner (C4): drives one LLM agent through a single tool server for the
//! duration of one run.
//!
//! Owns its own message-history bookkeeping directly (a plain `Vec<Message>`, not a
//! shared session type) so it can splice in tool-result messages between turns, and
//! drives it through [`crate::client_wrapper::ClientWrapper`]'s provider abstraction. The turn
//! loop generalises the same shape the teacher's agent used for its
//! single-tool-call-per-turn loop — bounded iteration count, sequential tool
//! dispatch, a textual response with no further tool calls ending the loop —
//! into the `AwaitingModel -> StreamingText | DispatchingToolCall ->
//! AwaitingModel -> Terminal` state machine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::client_wrapper::{ClientWrapper, Message, Role};
use crate::event::{EvalEvent, EventHandler};
use crate::mcp::McpTransport;
use crate::model::{AgentTrace, Cancellation, ErrorKind, ExecutionOutcome, TraceEventKind};

/// Turn/time/token budgets enforced by the runner (§4.4.1).
#[derive(Debug, Clone)]
pub struct AgentLimits {
    /// One turn = one model generation, whether or not it calls tools.
    pub max_turns: u32,
    pub wall_deadline: Duration,
    /// Soft cap; on breach the runner asks the model to wrap up instead of aborting mid-turn.
    pub max_tokens_total: Option<u64>,
    /// Per-tool-call bound, default 120s per §4.4.2.
    pub tool_call_timeout: Duration,
}

impl Default for AgentLimits {
    fn default() -> Self {
        AgentLimits {
            max_turns: 30,
            wall_deadline: Duration::from_secs(300),
            max_tokens_total: None,
            tool_call_timeout: Duration::from_secs(120),
        }
    }
}

/// `AwaitingModel -> StreamingText | DispatchingToolCall -> AwaitingModel -> Terminal` (§4.4.2).
/// `StreamingText` collapses into the same branch as a terminal model response here because the
/// runner calls [`ClientWrapper::send_message`]'s full request/response form rather than a token
/// stream; the trace still records a `ModelCallCompleted` event per turn either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    AwaitingModel,
    DispatchingToolCall,
    Terminal,
}

/// `Run(prompt, tool server, model, limits, cancel) -> (AgentTrace, ExecutionOutcome)`.
pub async fn run(
    run_id: Uuid,
    prompt: &str,
    system_hint: Option<&str>,
    client: Arc<dyn ClientWrapper>,
    transport: Arc<dyn McpTransport>,
    limits: AgentLimits,
    cancel: Cancellation,
    events: Arc<dyn EventHandler>,
) -> (AgentTrace, ExecutionOutcome) {
    let start = Instant::now();
    let trace = Arc::new(tokio::sync::Mutex::new(AgentTrace::default()));
    let turn_counter = AtomicU32::new(0);

    let emit = {
        let trace = Arc::clone(&trace);
        let events = Arc::clone(&events);
        move |turn: u32, kind: TraceEventKind| {
            let trace = Arc::clone(&trace);
            let events = Arc::clone(&events);
            async move {
                trace.lock().await.push(turn, kind.clone());
                events.on_event(&EvalEvent::Turn { run_id, turn, kind }).await;
            }
        }
    };

    let body = async {
        let tools = match transport.list_tools().await {
            Ok(tools) => tools.iter().map(|t| t.to_tool_definition()).collect::<Vec<_>>(),
            Err(e) => {
                return ExecutionOutcome {
                    completed: false,
                    turns_used: 0,
                    wall_clock: start.elapsed(),
                    tokens_used: None,
                    error_kind: Some(ErrorKind::ToolServerUnavailable),
                    error_message: Some(e.to_string()),
                };
            }
        };

        let mut messages = Vec::new();
        if let Some(hint) = system_hint {
            messages.push(Message {
                role: Role::System,
                content: Arc::from(hint),
                tool_calls: vec![],
            });
        }
        messages.push(Message {
            role: Role::User,
            content: Arc::from(prompt),
            tool_calls: vec![],
        });

        let mut tokens_used: u64 = 0;
        let mut budget_warned = false;
        let mut state = TurnState::AwaitingModel;
        let mut outcome: Option<ExecutionOutcome> = None;

        while state != TurnState::Terminal {
            if cancel.is_cancelled() {
                outcome = Some(ExecutionOutcome {
                    completed: false,
                    turns_used: turn_counter.load(Ordering::SeqCst),
                    wall_clock: start.elapsed(),
                    tokens_used: Some(tokens_used),
                    error_kind: Some(ErrorKind::Orchestrator),
                    error_message: Some("cancelled".to_string()),
                });
                break;
            }

            let turn = turn_counter.fetch_add(1, Ordering::SeqCst) + 1;
            if turn > limits.max_turns {
                emit(turn, TraceEventKind::TurnBudgetExceeded).await;
                outcome = Some(ExecutionOutcome {
                    completed: false,
                    turns_used: turn - 1,
                    wall_clock: start.elapsed(),
                    tokens_used: Some(tokens_used),
                    error_kind: Some(ErrorKind::BudgetExceeded),
                    error_message: Some("max_turns exceeded".to_string()),
                });
                break;
            }

            emit(turn, TraceEventKind::TurnStarted).await;

            // Model call with up to 3 retries on a transient provider error (§4.4.3).
            let tools_for_call = if budget_warned { None } else { Some(tools.clone()) };
            let mut attempt = 0u32;
            let response = loop {
                attempt += 1;
                match client.send_message(&messages, tools_for_call.clone()).await {
                    Ok(resp) => break Ok(resp),
                    Err(e) if attempt < 3 => {
                        let backoff = Duration::from_secs(1u64 << (attempt - 1));
                        tokio::time::sleep(backoff).await;
                        log::warn!("agent_runner: model call attempt {attempt} failed: {e}");
                        continue;
                    }
                    Err(e) => break Err(e),
                }
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    outcome = Some(ExecutionOutcome {
                        completed: false,
                        turns_used: turn,
                        wall_clock: start.elapsed(),
                        tokens_used: Some(tokens_used),
                        error_kind: Some(ErrorKind::ModelProviderTransient),
                        error_message: Some(e.to_string()),
                    });
                    break;
                }
            };

            if let Some(usage) = client.get_last_usage().await {
                tokens_used = tokens_used.saturating_add(usage.total_tokens as u64);
            }
            emit(
                turn,
                TraceEventKind::ModelCallCompleted {
                    response_chars: response.content.len(),
                },
            )
            .await;

            if let Some(max_tokens) = limits.max_tokens_total {
                if tokens_used >= max_tokens && !budget_warned {
                    budget_warned = true;
                    emit(turn, TraceEventKind::TokenBudgetExceeded).await;
                    messages.push(Message {
                        role: Role::Assistant,
                        content: response.content.clone(),
                        tool_calls: response.tool_calls.clone(),
                    });
                    messages.push(Message {
                        role: Role::User,
                        content: Arc::from(
                            "Token budget exceeded. Provide your final answer now without calling any more tools.",
                        ),
                        tool_calls: vec![],
                    });
                    continue;
                }
            }

            if response.tool_calls.is_empty() {
                messages.push(Message {
                    role: Role::Assistant,
                    content: response.content.clone(),
                    tool_calls: vec![],
                });
                state = TurnState::Terminal;
                continue;
            }

            state = TurnState::DispatchingToolCall;
            messages.push(Message {
                role: Role::Assistant,
                content: response.content.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            for call in &response.tool_calls {
                emit(
                    turn,
                    TraceEventKind::ToolCallIssued {
                        tool_name: call.name.clone(),
                        parameters: call.arguments.clone(),
                    },
                )
                .await;

                let dispatch = tokio::time::timeout(
                    limits.tool_call_timeout,
                    transport.call_tool(&call.name, call.arguments.clone()),
                )
                .await;

                let (content, success, error) = match dispatch {
                    Ok(Ok(result)) => (result.content, !result.is_error, None),
                    Ok(Err(e)) => {
                        // One re-spawn-and-replay attempt on a tool-server transient error.
                        log::warn!("agent_runner: tool call '{}' failed, retrying once: {e}", call.name);
                        let retry = tokio::time::timeout(
                            limits.tool_call_timeout,
                            transport.call_tool(&call.name, call.arguments.clone()),
                        )
                        .await;
                        match retry {
                            Ok(Ok(result)) => (result.content, !result.is_error, None),
                            Ok(Err(e2)) => {
                                outcome = Some(ExecutionOutcome {
                                    completed: false,
                                    turns_used: turn,
                                    wall_clock: start.elapsed(),
                                    tokens_used: Some(tokens_used),
                                    error_kind: Some(ErrorKind::ToolServerUnavailable),
                                    error_message: Some(e2.to_string()),
                                });
                                break;
                            }
                            Err(_) => {
                                outcome = Some(ExecutionOutcome {
                                    completed: false,
                                    turns_used: turn,
                                    wall_clock: start.elapsed(),
                                    tokens_used: Some(tokens_used),
                                    error_kind: Some(ErrorKind::ToolServerUnavailable),
                                    error_message: Some("tool server timed out twice".to_string()),
                                });
                                break;
                            }
                        }
                    }
                    Err(_) => (
                        serde_json::json!({"error": "tool call timed out"}),
                        false,
                        Some("timed out".to_string()),
                    ),
                };

                emit(
                    turn,
                    TraceEventKind::ToolCallCompleted {
                        tool_name: call.name.clone(),
                        success,
                        error: error.clone(),
                    },
                )
                .await;

                messages.push(Message {
                    role: Role::Tool {
                        call_id: call.id.clone(),
                    },
                    content: Arc::from(content.to_string().as_str()),
                    tool_calls: vec![],
                });

                if outcome.is_some() {
                    break;
                }
            }

            if outcome.is_some() {
                break;
            }
            state = TurnState::AwaitingModel;
        }

        outcome.unwrap_or_else(|| ExecutionOutcome {
            completed: true,
            turns_used: turn_counter.load(Ordering::SeqCst),
            wall_clock: start.elapsed(),
            tokens_used: Some(tokens_used),
            error_kind: None,
            error_message: None,
        })
    };

    let outcome = match tokio::time::timeout(limits.wall_deadline, body).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let turn = turn_counter.load(Ordering::SeqCst);
            emit(turn, TraceEventKind::WallClockBudgetExceeded).await;
            ExecutionOutcome {
                completed: false,
                turns_used: turn,
                wall_clock: start.elapsed(),
                tokens_used: None,
                error_kind: Some(ErrorKind::BudgetExceeded),
                error_message: Some("wall_deadline exceeded".to_string()),
            }
        }
    };

    let final_turn = turn_counter.load(Ordering::SeqCst);
    let reason = match &outcome.error_kind {
        Some(k) => k.to_string(),
        None => "completed".to_string(),
    };
    emit(final_turn, TraceEventKind::Terminal { reason }).await;
    events.on_event(&EvalEvent::RunCompleted { run_id }).await;

    let final_trace = trace.lock().await.clone();
    (final_trace, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::{NativeToolCall, ToolDefinition};
    use crate::mcp::{McpError, ToolCallResult, ToolInfo};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct NoopEvents;

    #[async_trait::async_trait]
    impl EventHandler for NoopEvents {}

    fn events() -> Arc<dyn EventHandler> {
        Arc::new(NoopEvents)
    }

    struct EmptyTransport;

    #[async_trait::async_trait]
    impl McpTransport for EmptyTransport {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
            Ok(vec![])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolCallResult, McpError> {
            Ok(ToolCallResult {
                content: serde_json::Value::Null,
                is_error: false,
            })
        }

        async fn shutdown(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn transport() -> Arc<dyn McpTransport> {
        Arc::new(EmptyTransport)
    }

    fn text_message(text: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(text),
            tool_calls: vec![],
        }
    }

    fn tool_call_message(name: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: serde_json::json!({}),
            }],
        }
    }

    enum Scripted {
        Ok(Message),
        Err(String),
        Sleep(Duration),
    }

    /// A [`ClientWrapper`] stub whose responses are scripted in advance, one per
    /// `send_message` call, so the turn loop's branches can be driven deterministically.
    struct ScriptedClient {
        responses: StdMutex<VecDeque<Scripted>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Scripted>) -> Self {
            ScriptedClient {
                responses: StdMutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ClientWrapper for ScriptedClient {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn std::error::Error>> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Ok(msg)) => Ok(msg),
                Some(Scripted::Err(e)) => Err(e.into()),
                Some(Scripted::Sleep(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(text_message("slow"))
                }
                None => Ok(text_message("default")),
            }
        }
    }

    #[tokio::test]
    async fn happy_path_single_turn_completes() {
        let client: Arc<dyn ClientWrapper> =
            Arc::new(ScriptedClient::new(vec![Scripted::Ok(text_message("done"))]));
        let (trace, outcome) = run(
            Uuid::new_v4(),
            "do the thing",
            None,
            client,
            transport(),
            AgentLimits::default(),
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(outcome.completed);
        assert_eq!(outcome.turns_used, 1);
        assert!(outcome.error_kind.is_none());
        assert!(trace
            .events
            .iter()
            .any(|e| matches!(e.kind, TraceEventKind::Terminal { .. })));
    }

    #[tokio::test]
    async fn turn_limit_exhaustion_is_budget_exceeded() {
        let responses = (0..5).map(|_| Scripted::Ok(tool_call_message("noop"))).collect();
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(responses));
        let limits = AgentLimits {
            max_turns: 2,
            ..AgentLimits::default()
        };

        let (_trace, outcome) = run(
            Uuid::new_v4(),
            "loop forever",
            None,
            client,
            transport(),
            limits,
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BudgetExceeded));
        assert_eq!(outcome.turns_used, 2);
    }

    #[tokio::test]
    async fn wall_deadline_exhaustion_is_budget_exceeded() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![Scripted::Sleep(
            Duration::from_millis(300),
        )]));
        let limits = AgentLimits {
            wall_deadline: Duration::from_millis(20),
            ..AgentLimits::default()
        };

        let (_trace, outcome) = run(
            Uuid::new_v4(),
            "slow",
            None,
            client,
            transport(),
            limits,
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::BudgetExceeded));
    }

    #[tokio::test]
    async fn tool_call_then_terminal_response_completes() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            Scripted::Ok(tool_call_message("echo")),
            Scripted::Ok(text_message("all done")),
        ]));

        let (trace, outcome) = run(
            Uuid::new_v4(),
            "use the tool",
            None,
            client,
            transport(),
            AgentLimits::default(),
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(outcome.completed);
        assert_eq!(outcome.turns_used, 2);
        assert!(trace.events.iter().any(|e| matches!(
            e.kind,
            TraceEventKind::ToolCallCompleted { success: true, .. }
        )));
    }

    #[tokio::test]
    async fn model_provider_transient_retries_then_succeeds() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            Scripted::Err("rate limited".to_string()),
            Scripted::Ok(text_message("recovered")),
        ]));

        let (_trace, outcome) = run(
            Uuid::new_v4(),
            "retry me",
            None,
            client,
            transport(),
            AgentLimits::default(),
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(outcome.completed);
        assert!(outcome.error_kind.is_none());
    }

    #[tokio::test]
    async fn model_provider_transient_exhausts_retries() {
        let client: Arc<dyn ClientWrapper> = Arc::new(ScriptedClient::new(vec![
            Scripted::Err("boom".to_string()),
            Scripted::Err("boom".to_string()),
            Scripted::Err("boom".to_string()),
        ]));

        let (_trace, outcome) = run(
            Uuid::new_v4(),
            "fail forever",
            None,
            client,
            transport(),
            AgentLimits::default(),
            Cancellation::new(),
            events(),
        )
        .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ModelProviderTransient));
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_orchestrator_error() {
        let client: Arc<dyn ClientWrapper> =
            Arc::new(ScriptedClient::new(vec![Scripted::Ok(text_message("unreached"))]));
        let cancel = Cancellation::new();
        cancel.cancel();

        let (_trace, outcome) = run(
            Uuid::new_v4(),
            "never runs",
            None,
            client,
            transport(),
            AgentLimits::default(),
            cancel,
            events(),
        )
        .await;

        assert!(!outcome.completed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Orchestrator));
    }
}
