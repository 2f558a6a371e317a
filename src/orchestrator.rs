//! The Orchestrator: the fixed 7-stage turn pipeline (§4.5) plus the
//! Tool-Execution Sub-loop (§4.6).
//!
//! Grounded on `ai/services/core_logic.py`'s `process_actions_loop`/
//! `process_single_mcp_action`/`execute_batch_calls_with_stages` for the
//! exact stage sequence, the differently-labeled duplicate Memory Manager
//! call, and the "replace, don't accumulate" feedback rule; on
//! `supervise_and_retry_main_brain`'s bounded reject-reprompt-reapprove loop
//! for Stage 4's conditional supervision; and on the teacher's
//! `orchestration.rs` for the Rust shape of a builder-constructed engine
//! with a bounded round loop and a typed error enum.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agents::{
    ActionSpec, ActionType, AgentError, Decision, ExecutorAction, ExecutorAgent, MemoryManagerAgent,
    MemoryRouterAgent, MemoryShardsAgent, PlannerAgent, RouterAgent, SupervisorAgent,
    validate_all_or_nothing,
};
use crate::client_wrapper::ClientWrapper;
use crate::config::ConclaveConfig;
use crate::event::{CallbackType, StreamDispatcher, StreamEvent};
use crate::mcp_pool::{McpClientPool, ToolResult};
use crate::memory_store::{MemoryShard, MemoryStore, MemoryStoreError};
use crate::prompt_template::PromptTemplate;
use crate::session_store::SessionStore;

/// Bound on the Planner/Supervisor/Router/Executor re-entry loop at Stage 5
/// (`core_logic.py`'s `process_actions_loop`'s `max_iterations`).
pub const MAX_OUTER_ITERATIONS: usize = 10;

/// Bound on the Tool-Execution Sub-loop's CALLING/FEEDBACK stages (§4.6;
/// `core_logic.py`'s `execute_batch_calls_with_stages`'s `max_stages`).
pub const MAX_TOOL_STAGES: usize = 10;

/// Bound on how many times Stage 3 re-prompts the Planner after a Supervisor
/// REJECT before proceeding with the latest plan anyway (`core_logic.py`'s
/// `supervise_and_retry_main_brain`'s `max_retries`).
pub const MAX_SUPERVISOR_RETRIES: usize = 3;

#[derive(Debug)]
pub enum OrchestratorError {
    Memory(MemoryStoreError),
    Agent(AgentError),
    Session(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Memory(e) => write!(f, "memory store error: {}", e),
            OrchestratorError::Agent(e) => write!(f, "agent error: {}", e),
            OrchestratorError::Session(e) => write!(f, "session persistence error: {}", e),
        }
    }
}

impl Error for OrchestratorError {}

/// The seven role prompt templates an [`Orchestrator`] is built with.
pub struct AgentTemplates {
    pub memory_manager: PromptTemplate,
    pub memory_router: PromptTemplate,
    pub planner: PromptTemplate,
    pub supervisor: PromptTemplate,
    pub router: PromptTemplate,
    pub executor: PromptTemplate,
    pub memory_shards: PromptTemplate,
}

/// One turn's full agent roster plus the shared MCP pool and persistence
/// layers. All seven roles share a single provider client — see
/// DESIGN.md's Open Question resolutions for why per-role providers were
/// not modeled.
pub struct Orchestrator<T: ClientWrapper> {
    memory_manager: MemoryManagerAgent<T>,
    memory_router: MemoryRouterAgent<T>,
    planner: PlannerAgent<T>,
    supervisor: SupervisorAgent<T>,
    router: RouterAgent<T>,
    executor: ExecutorAgent<T>,
    memory_shards: MemoryShardsAgent<T>,
    mcp_pool: McpClientPool,
    memory_root: PathBuf,
    sessions: SessionStore,
}

impl<T: ClientWrapper> Orchestrator<T> {
    pub fn new(
        client: Arc<T>,
        templates: AgentTemplates,
        mcp_pool: McpClientPool,
        config: &ConclaveConfig,
    ) -> Self {
        Self {
            memory_manager: MemoryManagerAgent::new(client.clone(), templates.memory_manager),
            memory_router: MemoryRouterAgent::new(client.clone(), templates.memory_router),
            planner: PlannerAgent::new(client.clone(), templates.planner),
            supervisor: SupervisorAgent::new(client.clone(), templates.supervisor),
            router: RouterAgent::new(client.clone(), templates.router),
            executor: ExecutorAgent::new(client.clone(), templates.executor),
            memory_shards: MemoryShardsAgent::new(client, templates.memory_shards),
            mcp_pool,
            memory_root: config.memory_root.clone(),
            sessions: SessionStore::new(config.conversations_root.clone()),
        }
    }

    /// Run one full turn for conversation `cid`, emitting [`StreamEvent`]s
    /// onto `dispatcher` as each stage completes, and returning the turn's
    /// final reply text.
    pub async fn run_turn(
        &self,
        cid: &str,
        user_message: &str,
        dispatcher: &StreamDispatcher,
    ) -> Result<String, OrchestratorError> {
        let memory_store = MemoryStore::new(self.memory_root.clone(), cid);

        // Stage 1: Memory Manager selects relevant Outline Index categories.
        dispatcher
            .emit(stage_event(
                cid,
                CallbackType::Thinking,
                "主脑AI及监督AI",
                "scanning memory outline",
            ))
            .await;
        let outlines = memory_store
            .scan_outlines()
            .await
            .map_err(OrchestratorError::Memory)?;
        let categories = self
            .memory_manager
            .select_categories(user_message, &outlines, "主脑AI及监督AI")
            .await
            .map_err(OrchestratorError::Agent)?;
        let mut category_memories = HashMap::new();
        for category in &categories {
            let shards = memory_store.load_category(category).await;
            category_memories.insert(category.clone(), shards);
        }

        // Stage 2: Memory Router, called once per downstream consumer —
        // the planner always gets its own markdown; the supervisor's is
        // computed lazily, only if Stage 3 turns out to need it.
        let planner_shard_paths = self
            .memory_router
            .select_shard_paths(user_message, &category_memories, "主脑AI")
            .await
            .map_err(OrchestratorError::Agent)?;
        let planner_memory_md = render_memory_context(&category_memories, &planner_shard_paths);

        // Stage 3: Planner produces the turn's Action Spec.
        let plugins_summary = self.mcp_pool.summarise_plugins();
        let mut action_spec = self
            .planner
            .plan(user_message, &planner_memory_md, &plugins_summary)
            .await
            .map_err(OrchestratorError::Agent)?;

        // Stage 4: Supervision (conditional) — only runs if the plan has a
        // task action. On REJECT the Supervisor's verdict is fed back to
        // the Planner and the plan is reparsed, up to MAX_SUPERVISOR_RETRIES
        // times; after that many rejections the turn proceeds with the
        // latest plan anyway rather than aborting.
        if action_spec.actions.iter().any(|a| a.action_type == ActionType::Task) {
            dispatcher
                .emit(stage_event(
                    cid,
                    CallbackType::Thinking,
                    "主脑AI及监督AI",
                    "reviewing plan",
                ))
                .await;
            let supervisor_shard_paths = self
                .memory_router
                .select_shard_paths(user_message, &category_memories, "监督AI")
                .await
                .map_err(OrchestratorError::Agent)?;
            let supervisor_memory_md =
                render_memory_context(&category_memories, &supervisor_shard_paths);

            for attempt in 1..=MAX_SUPERVISOR_RETRIES {
                let still_has_task = action_spec
                    .actions
                    .iter()
                    .any(|a| a.action_type == ActionType::Task);
                if !still_has_task {
                    break;
                }
                let action_spec_json = serde_json::to_string(&action_spec).unwrap_or_default();
                let verdict = self
                    .supervisor
                    .review(user_message, &action_spec_json, &supervisor_memory_md)
                    .await;
                if verdict.decision != Decision::Reject {
                    break;
                }
                if attempt == MAX_SUPERVISOR_RETRIES {
                    log::warn!(
                        "cid {}: supervisor rejected the plan {} times, proceeding with latest plan anyway",
                        cid,
                        attempt
                    );
                    break;
                }
                let decision_json = serde_json::to_string(&verdict).unwrap_or_default();
                let feedback = format!(
                    "[监督反馈 - 第{}次] {}\n\n请根据上述反馈，重新优化你的输出。",
                    attempt, decision_json
                );
                action_spec = self
                    .planner
                    .plan(&feedback, &planner_memory_md, &plugins_summary)
                    .await
                    .map_err(OrchestratorError::Agent)?;
            }
        }

        // Stage 5: dispatch actions; tasks may trigger a bounded number of
        // re-plans against the most recent tool-result feedback only.
        dispatcher
            .emit(stage_event(
                cid,
                CallbackType::Thinking,
                "执行AI",
                "dispatching actions",
            ))
            .await;
        let mut reply_text = String::new();
        let mut last_mcp_summary: Option<String> = None;
        let mut iteration = 0;
        loop {
            iteration += 1;
            if iteration > MAX_OUTER_ITERATIONS {
                log::warn!(
                    "orchestrator: outer action loop hit MAX_OUTER_ITERATIONS for cid {}",
                    cid
                );
                break;
            }

            let executor_memory_md = if action_spec
                .actions
                .iter()
                .any(|a| a.action_type == ActionType::Task)
            {
                self.executor_memory_markdown(user_message, &action_spec, &outlines, &memory_store)
                    .await?
            } else {
                String::new()
            };

            let mut had_task = false;
            for action in &action_spec.actions {
                match action.action_type {
                    ActionType::Reply => {
                        reply_text.push_str(&action.payload);
                        dispatcher
                            .emit(stage_event(
                                cid,
                                CallbackType::Reply,
                                "planner",
                                &action.payload,
                            ))
                            .await;
                        dispatcher
                            .emit(StreamEvent::AgentStream {
                                cid: cid.to_string(),
                                agent: "planner".to_string(),
                                delta: action.payload.clone(),
                            })
                            .await;
                    }
                    ActionType::Task => {
                        had_task = true;
                        let summary = self
                            .run_task(
                                cid,
                                &action.payload,
                                &plugins_summary,
                                &executor_memory_md,
                                dispatcher,
                            )
                            .await?;
                        last_mcp_summary = Some(summary);
                    }
                }
            }

            if !had_task {
                break;
            }
            let Some(feedback) = last_mcp_summary.clone() else {
                break;
            };
            let replanned = self
                .planner
                .replan_with_feedback(&planner_memory_md, &plugins_summary, &feedback)
                .await
                .map_err(OrchestratorError::Agent)?;
            if replanned.actions.is_empty() {
                break;
            }
            action_spec = replanned;
        }

        // Stage 6: persist the turn.
        self.sessions
            .append_turn(cid, "planner", user_message.to_string(), reply_text.clone())
            .await
            .map_err(OrchestratorError::Session)?;

        // Stage 7: unconditional memory-change application (not a Planner
        // action type — every turn is offered to the Memory Shards agent).
        let excerpt = format!("user: {}\nassistant: {}", user_message, reply_text);
        match self.memory_shards.propose_changes(&excerpt).await {
            Ok(ops) => {
                if let Err(e) = memory_store.apply_changes(ops).await {
                    log::warn!("memory change application failed for cid {}: {}", cid, e);
                }
            }
            Err(e) => log::warn!("memory shards proposal failed for cid {}: {}", cid, e),
        }

        dispatcher
            .emit(StreamEvent::Response {
                cid: cid.to_string(),
                content: reply_text.clone(),
            })
            .await;
        Ok(reply_text)
    }

    /// Stage 5's executor-facing memory: a second Memory Manager call under
    /// the "执行AI" label against the combined user input and current plan,
    /// routed through the Memory Router the same way the planner's and
    /// supervisor's memory were in Stage 2/4.
    async fn executor_memory_markdown(
        &self,
        user_message: &str,
        action_spec: &ActionSpec,
        outlines: &HashMap<String, usize>,
        memory_store: &MemoryStore,
    ) -> Result<String, OrchestratorError> {
        let actions_json = serde_json::to_string(action_spec).unwrap_or_default();
        let combined = format!(
            "{}\n(以上为用户描述)\n{}\n(以上为MCP任务需求)",
            user_message, actions_json
        );
        let executor_categories = self
            .memory_manager
            .select_categories(&combined, outlines, "执行AI")
            .await
            .map_err(OrchestratorError::Agent)?;
        let mut executor_category_memories = HashMap::new();
        for category in &executor_categories {
            let shards = memory_store.load_category(category).await;
            executor_category_memories.insert(category.clone(), shards);
        }
        let executor_shard_paths = self
            .memory_router
            .select_shard_paths(&combined, &executor_category_memories, "执行AI")
            .await
            .map_err(OrchestratorError::Agent)?;
        Ok(render_memory_context(
            &executor_category_memories,
            &executor_shard_paths,
        ))
    }

    /// The Tool-Execution Sub-loop (§4.6) for one `task`-type action:
    /// Router clears plugins all-or-nothing, then Executor alternates
    /// CALLING/FEEDBACK stages until it returns `finish` or the stage
    /// bound is hit.
    async fn run_task(
        &self,
        cid: &str,
        task_description: &str,
        plugins_summary: &str,
        memory_md: &str,
        dispatcher: &StreamDispatcher,
    ) -> Result<String, OrchestratorError> {
        dispatcher
            .emit(stage_event(
                cid,
                CallbackType::Thinking,
                "执行AI",
                &format!("routing task: {}", task_description),
            ))
            .await;

        let requested = self
            .router
            .find_plugins(task_description, plugins_summary)
            .await
            .map_err(OrchestratorError::Agent)?;
        let known: Vec<String> = self
            .mcp_pool
            .list_tools()
            .into_iter()
            .map(|t| t.name)
            .collect();
        let Some(validated) = validate_all_or_nothing(&requested, &known) else {
            return Ok(format!(
                "no matching tools found for task: {}",
                task_description
            ));
        };
        let available = validated.join(", ");

        let mut decision = self
            .executor
            .start_execute_plugins(task_description, &available, memory_md)
            .await
            .map_err(OrchestratorError::Agent)?;

        let mut stage = 0;
        let mut aggregate_results: Vec<ToolResult> = Vec::new();
        loop {
            match decision.action {
                ExecutorAction::Finish => break,
                ExecutorAction::Call => {
                    stage += 1;
                    if stage > MAX_TOOL_STAGES {
                        log::warn!(
                            "tool-execution sub-loop hit MAX_TOOL_STAGES for cid {}",
                            cid
                        );
                        break;
                    }

                    // A failure in one call does not short-circuit the
                    // remaining calls in the same batch.
                    let mut stage_results = Vec::with_capacity(decision.calls.len());
                    for call in &decision.calls {
                        let result = self.mcp_pool.invoke(&call.name, call.arguments.clone()).await;
                        stage_results.push((call.name.clone(), result));
                    }
                    let feedback = format_feedback(&stage_results);
                    aggregate_results.extend(stage_results.into_iter().map(|(_, r)| r));

                    decision = self
                        .executor
                        .continue_execute_plugins(task_description, &available, memory_md, &feedback)
                        .await
                        .map_err(OrchestratorError::Agent)?;
                }
            }
        }

        let success_count = aggregate_results.iter().filter(|r| r.success).count();
        let failed_count = aggregate_results.len() - success_count;
        Ok(decision.summary.clone().unwrap_or_else(|| {
            format!(
                "task '{}': {} tool call(s) succeeded, {} failed",
                task_description, success_count, failed_count
            )
        }))
    }
}

fn stage_event(cid: &str, callback_type: CallbackType, stage: &str, message: &str) -> StreamEvent {
    StreamEvent::ChatCallback {
        cid: cid.to_string(),
        callback_type,
        stage: stage.to_string(),
        message: message.to_string(),
    }
}

fn render_memory_context(
    category_memories: &HashMap<String, Vec<MemoryShard>>,
    paths: &[String],
) -> String {
    let mut lines = Vec::new();
    for path in paths {
        if let Some((category, key)) = path.split_once('.') {
            if let Some(shard) = category_memories
                .get(category)
                .and_then(|shards| shards.iter().find(|s| s.key == key))
            {
                lines.push(format!("{}: {}", path, shard.payload));
            }
        }
    }
    lines.join("\n")
}

fn format_feedback(results: &[(String, ToolResult)]) -> String {
    results
        .iter()
        .map(|(name, result)| {
            if result.success {
                format!(
                    "{}: 成功 -> {}",
                    name,
                    result
                        .content
                        .clone()
                        .unwrap_or(serde_json::Value::Null)
                )
            } else {
                format!(
                    "{}: 失败 -> {}",
                    name,
                    result.error.clone().unwrap_or_default()
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::{Message, Role, TokenUsage, ToolDefinition};
    use crate::mcp_pool::McpConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Returns scripted replies in order, one per `send_message` call,
    /// regardless of what was asked — enough to drive a full turn through
    /// the pipeline deterministically.
    struct ScriptedClient {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl ClientWrapper for ScriptedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            let reply = self
                .replies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| "{}".to_string());
            Ok(Message {
                role: Role::Assistant,
                content: reply.into(),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
            None
        }
    }

    fn template(required: &[&str]) -> PromptTemplate {
        let text = required
            .iter()
            .map(|p| format!("{{{}}}", p))
            .collect::<Vec<_>>()
            .join(" ");
        PromptTemplate::new(text, required).unwrap()
    }

    fn templates() -> AgentTemplates {
        AgentTemplates {
            memory_manager: template(&["OUTLINE_INDEX", "LABEL"]),
            memory_router: template(&["CATEGORY_MEMORIES", "LABEL"]),
            planner: template(&["MEMORY_CONTEXT", "MCP_PLUGINS"]),
            supervisor: template(&["ACTION_SPEC", "USER_MEMORY"]),
            router: template(&["MCP_PLUGINS"]),
            executor: template(&["MCP_PLUGINS", "USER_MEMORY"]),
            memory_shards: PromptTemplate::new("propose changes", &[]).unwrap(),
        }
    }

    #[tokio::test]
    async fn reply_only_turn_runs_all_seven_stages_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConclaveConfig {
            memory_root: dir.path().join("memory"),
            conversations_root: dir.path().join("conversations"),
            thought_chain_dir: dir.path().join("thought_chains"),
        };

        // Call order: memory_manager (stage 1), memory_router for the
        // planner (stage 2), planner (stage 3). The reply-only plan has no
        // task action, so Stage 4 (supervision) and the executor-memory
        // lookup are both skipped entirely, and memory_shards (stage 7) is
        // the last call.
        let client = Arc::new(ScriptedClient::new(vec![
            "[]",
            "[]",
            r#"{"actions":[{"type":"reply","payload":"Hello there!"}]}"#,
            "[]",
        ]));

        let mcp_pool = McpClientPool::from_config(McpConfig {
            mcp_servers: HashMap::new(),
        });

        let orchestrator = Orchestrator::new(client, templates(), mcp_pool, &config);
        let (dispatcher, mut rx) = crate::event::StreamDispatcher::new(16);

        let reply = orchestrator
            .run_turn("conv-1", "hi", &dispatcher)
            .await
            .unwrap();
        assert_eq!(reply, "Hello there!");

        let mut saw_response = false;
        let mut saw_reply_callback = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::Response { content, .. } => {
                    assert_eq!(content, "Hello there!");
                    saw_response = true;
                }
                StreamEvent::ChatCallback {
                    callback_type: CallbackType::Reply,
                    message,
                    ..
                } => {
                    assert_eq!(message, "Hello there!");
                    saw_reply_callback = true;
                }
                _ => {}
            }
        }
        assert!(saw_response);
        assert!(saw_reply_callback);

        let sessions = SessionStore::new(config.conversations_root);
        let history = sessions.load_session("conv-1", "planner").await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn rejected_then_approved_plan_retries_planner_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConclaveConfig {
            memory_root: dir.path().join("memory"),
            conversations_root: dir.path().join("conversations"),
            thought_chain_dir: dir.path().join("thought_chains"),
        };

        // Call order: memory_manager (stage 1), memory_router/planner
        // (stage 2), planner (stage 3, returns a task), memory_router/
        // supervisor (stage 4), supervisor (REJECT), planner re-prompted
        // with the rejection feedback (returns a reply, no more tasks —
        // the retry loop exits without calling the supervisor again),
        // memory_shards (stage 7). The router and executor are never
        // invoked since the final plan has no task action.
        let client = Arc::new(ScriptedClient::new(vec![
            "[]",
            "[]",
            r#"{"actions":[{"type":"task","payload":"delete everything"}]}"#,
            "[]",
            r#"{"decision":"REJECT","reason":"destructive"}"#,
            r#"{"actions":[{"type":"reply","payload":"I won't do that"}]}"#,
            "[]",
        ]));

        let mcp_pool = McpClientPool::from_config(McpConfig {
            mcp_servers: HashMap::new(),
        });

        let orchestrator = Orchestrator::new(client, templates(), mcp_pool, &config);
        let (dispatcher, _rx) = crate::event::StreamDispatcher::new(16);

        let reply = orchestrator
            .run_turn("conv-2", "please help", &dispatcher)
            .await
            .unwrap();
        assert_eq!(reply, "I won't do that");
    }

    #[test]
    fn render_memory_context_only_includes_selected_paths() {
        let mut shards = HashMap::new();
        shards.insert(
            "prefs".to_string(),
            vec![MemoryShard {
                key: "theme".to_string(),
                category: "prefs".to_string(),
                payload: serde_json::json!("dark"),
                importance: 1,
                source: "user".to_string(),
                tags: vec![],
                trigger_count: 1,
                created_at: "t".to_string(),
                updated_at: "t".to_string(),
                last_triggered: "t".to_string(),
            }],
        );
        let context = render_memory_context(&shards, &["prefs.theme".to_string()]);
        assert!(context.contains("dark"));
    }
}
