//! The seven named agent roles (§2 Supplement): thin, stateless wrappers
//! around a [`ClientWrapper`] plus a role-specific [`PromptTemplate`] and a
//! typed parse of that role's lenient-JSON reply.
//!
//! Each role is a single request/response round trip — the orchestrator
//! (not these wrappers) owns multi-turn history via [`crate::session_store`]
//! and rebuilds each role's full context from a template at every call, the
//! same way the original `*_agent.py` modules construct their prompt input
//! fresh per call rather than keeping a running chat session.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client_wrapper::{ClientWrapper, Message, Role};
use crate::json_lenient::{extract_array, extract_object};
use crate::memory_store::{ChangeOp, MemoryShard};
use crate::prompt_template::PromptTemplate;

#[derive(Debug)]
pub enum AgentError {
    Provider(Box<dyn Error + Send + Sync>),
    Unparseable { agent: &'static str, raw: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Provider(e) => write!(f, "provider error: {}", e),
            AgentError::Unparseable { agent, raw } => {
                write!(f, "{} returned unparseable output: {}", agent, raw)
            }
        }
    }
}

impl Error for AgentError {}

/// Send `system` + `user` as a one-shot (no persisted history) call.
async fn one_shot<T: ClientWrapper>(
    client: &T,
    system: String,
    user: String,
) -> Result<Message, AgentError> {
    let messages = [
        Message {
            role: Role::System,
            content: system.into(),
            tool_calls: Vec::new(),
        },
        Message {
            role: Role::User,
            content: user.into(),
            tool_calls: Vec::new(),
        },
    ];
    client
        .send_message(&messages, None)
        .await
        .map_err(AgentError::Provider)
}

fn render(template: &PromptTemplate, replacements: &[(&str, String)]) -> String {
    let map: HashMap<&str, String> = replacements.iter().cloned().collect();
    template.render(&map)
}

// ---------------------------------------------------------------------
// Memory Manager — picks which Outline Index categories are relevant.
// ---------------------------------------------------------------------

pub struct MemoryManagerAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> MemoryManagerAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    /// `outlines` is a category -> shard-count map, per
    /// [`crate::memory_store::MemoryStore::scan_outlines`] — this role never
    /// sees shard payloads, only counts.
    pub async fn select_categories(
        &self,
        user_message: &str,
        outlines: &HashMap<String, usize>,
        label: &str,
    ) -> Result<Vec<String>, AgentError> {
        let outline_text = outlines
            .iter()
            .map(|(category, count)| format!("{}: {} 条", category, count))
            .collect::<Vec<_>>()
            .join("\n");
        let system = render(
            &self.template,
            &[
                ("OUTLINE_INDEX", outline_text),
                ("LABEL", label.to_string()),
            ],
        );
        let reply = one_shot(&*self.client, system, user_message.to_string()).await?;
        let value = extract_array(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "MemoryManagerAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "MemoryManagerAgent",
            raw: reply.content.to_string(),
        })
    }
}

// ---------------------------------------------------------------------
// Memory Router — picks specific shard paths ("category.key") out of the
// categories the Memory Manager already loaded.
// ---------------------------------------------------------------------

pub struct MemoryRouterAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> MemoryRouterAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    /// `target_agent_label` names the downstream consumer this selection is
    /// for (e.g. "主脑AI", "监督AI", "执行AI") — the same category pool can
    /// route to a different shard list per consumer.
    pub async fn select_shard_paths(
        &self,
        user_message: &str,
        category_memories: &HashMap<String, Vec<MemoryShard>>,
        target_agent_label: &str,
    ) -> Result<Vec<String>, AgentError> {
        let memories_text = serde_json::to_string_pretty(category_memories)
            .unwrap_or_else(|_| "{}".to_string());
        let system = render(
            &self.template,
            &[
                ("CATEGORY_MEMORIES", memories_text),
                ("LABEL", target_agent_label.to_string()),
            ],
        );
        let reply = one_shot(&*self.client, system, user_message.to_string()).await?;
        let value = extract_array(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "MemoryRouterAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "MemoryRouterAgent",
            raw: reply.content.to_string(),
        })
    }
}

// ---------------------------------------------------------------------
// Planner ("主脑" / main brain) — produces the turn's Action Spec.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Reply,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionSpec {
    #[serde(default)]
    pub actions: Vec<Action>,
}

pub struct PlannerAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> PlannerAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    pub async fn plan(
        &self,
        user_message: &str,
        memory_context: &str,
        mcp_plugins_summary: &str,
    ) -> Result<ActionSpec, AgentError> {
        let system = render(
            &self.template,
            &[
                ("MEMORY_CONTEXT", memory_context.to_string()),
                ("MCP_PLUGINS", mcp_plugins_summary.to_string()),
            ],
        );
        let reply = one_shot(&*self.client, system, user_message.to_string()).await?;
        let value = extract_object(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "PlannerAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "PlannerAgent",
            raw: reply.content.to_string(),
        })
    }

    /// Re-plan after tool feedback, folding in only the most recent MCP
    /// result — never an accumulating history of every task's result
    /// (grounded on `core_logic.py`'s `process_single_mcp_action`, which
    /// replaces `last_mcp_result` rather than appending to it).
    pub async fn replan_with_feedback(
        &self,
        memory_context: &str,
        mcp_plugins_summary: &str,
        last_mcp_result_summary: &str,
    ) -> Result<ActionSpec, AgentError> {
        let feedback = format!(
            "上一次工具调用的结果：{}\n请根据以上结果继续。",
            last_mcp_result_summary
        );
        self.plan(&feedback, memory_context, mcp_plugins_summary)
            .await
    }
}

// ---------------------------------------------------------------------
// Supervisor — approves or rejects the Planner's Action Spec. Fails open:
// any provider or parse error yields an unconditional APPROVE.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorVerdict {
    pub decision: Decision,
    pub reason: String,
}

impl SupervisorVerdict {
    fn default_approve() -> Self {
        Self {
            decision: Decision::Approve,
            reason: "supervisor unavailable, default to approve".to_string(),
        }
    }
}

pub struct SupervisorAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> SupervisorAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    /// Never returns `Err`: a provider failure or an unparseable reply both
    /// degrade to [`SupervisorVerdict::default_approve`]. `user_memory_md`
    /// is this call's Memory Router output, rendered into the system prompt
    /// the same way `update_system_prompt({USER_MEMORY: ...})` would.
    pub async fn review(
        &self,
        user_message: &str,
        action_spec_json: &str,
        user_memory_md: &str,
    ) -> SupervisorVerdict {
        let system = render(
            &self.template,
            &[
                ("ACTION_SPEC", action_spec_json.to_string()),
                ("USER_MEMORY", user_memory_md.to_string()),
            ],
        );
        let user = format!(
            "用户输入：{}\n当前计划：{}",
            user_message, action_spec_json
        );
        let reply = match one_shot(&*self.client, system, user).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("supervisor call failed, defaulting to approve: {}", e);
                return SupervisorVerdict::default_approve();
            }
        };
        match extract_object(&reply.content).and_then(|v| serde_json::from_value(v).ok()) {
            Some(verdict) => verdict,
            None => {
                log::warn!(
                    "supervisor reply unparseable, defaulting to approve: {}",
                    reply.content
                );
                SupervisorVerdict::default_approve()
            }
        }
    }
}

// ---------------------------------------------------------------------
// Router — matches a task description against the MCP plugin catalogue.
// Stateless per call: a fresh one-shot request every time, no session
// carried between invocations (grounded on `router_agent.py`'s
// `clear_history()` idiom).
// ---------------------------------------------------------------------

pub struct RouterAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> RouterAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    pub async fn find_plugins(
        &self,
        task_description: &str,
        plugins_summary: &str,
    ) -> Result<Vec<String>, AgentError> {
        let system = render(&self.template, &[("MCP_PLUGINS", plugins_summary.to_string())]);
        let reply = one_shot(&*self.client, system, task_description.to_string()).await?;
        let value = extract_array(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "RouterAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "RouterAgent",
            raw: reply.content.to_string(),
        })
    }
}

/// Normalize a plugin/tool name for matching: lowercase, hyphens and
/// underscores collapsed to one separator.
pub fn normalize_plugin_name(name: &str) -> String {
    name.to_lowercase().replace('_', "-")
}

/// All-or-nothing validation: every name in `requested` must match a known
/// plugin (case-insensitive, hyphen/underscore-normalized); if any is
/// missing, the whole batch is rejected rather than partially honored.
pub fn validate_all_or_nothing(requested: &[String], known: &[String]) -> Option<Vec<String>> {
    let normalized_known: Vec<String> = known.iter().map(|n| normalize_plugin_name(n)).collect();
    for name in requested {
        if !normalized_known.contains(&normalize_plugin_name(name)) {
            return None;
        }
    }
    Some(requested.to_vec())
}

// ---------------------------------------------------------------------
// Executor — drives the Tool-Execution Sub-loop's per-stage decision.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorAction {
    Call,
    Finish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorDecision {
    pub action: ExecutorAction,
    #[serde(default)]
    pub calls: Vec<ToolCall>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub extracted_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub ai_response: Option<String>,
}

pub struct ExecutorAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> ExecutorAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    /// Initial decision for a task: given its description and the plugins
    /// the Router cleared, decide the first stage's `calls`.
    pub async fn start_execute_plugins(
        &self,
        task_description: &str,
        available_plugins: &str,
        memory_md: &str,
    ) -> Result<ExecutorDecision, AgentError> {
        let system = render(
            &self.template,
            &[
                ("MCP_PLUGINS", available_plugins.to_string()),
                ("USER_MEMORY", memory_md.to_string()),
            ],
        );
        self.decide(system, task_description.to_string()).await
    }

    /// Continue after a stage's tool results (`feedback_results`) come back.
    pub async fn continue_execute_plugins(
        &self,
        task_description: &str,
        available_plugins: &str,
        memory_md: &str,
        feedback_results: &str,
    ) -> Result<ExecutorDecision, AgentError> {
        let system = render(
            &self.template,
            &[
                ("MCP_PLUGINS", available_plugins.to_string()),
                ("USER_MEMORY", memory_md.to_string()),
            ],
        );
        let user = format!(
            "任务：{}\n上一阶段的工具执行结果：{}",
            task_description, feedback_results
        );
        self.decide(system, user).await
    }

    async fn decide(&self, system: String, user: String) -> Result<ExecutorDecision, AgentError> {
        let reply = one_shot(&*self.client, system, user).await?;
        let value = extract_object(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "ExecutorAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "ExecutorAgent",
            raw: reply.content.to_string(),
        })
    }
}

// ---------------------------------------------------------------------
// Memory Shards — proposes Change Operations against the Memory Store.
// ---------------------------------------------------------------------

pub struct MemoryShardsAgent<T: ClientWrapper> {
    client: Arc<T>,
    template: PromptTemplate,
}

impl<T: ClientWrapper> MemoryShardsAgent<T> {
    pub fn new(client: Arc<T>, template: PromptTemplate) -> Self {
        Self { client, template }
    }

    pub async fn propose_changes(
        &self,
        conversation_excerpt: &str,
    ) -> Result<Vec<ChangeOp>, AgentError> {
        let system = render(&self.template, &[]);
        let reply = one_shot(&*self.client, system, conversation_excerpt.to_string()).await?;
        let value = extract_array(&reply.content).ok_or_else(|| AgentError::Unparseable {
            agent: "MemoryShardsAgent",
            raw: reply.content.to_string(),
        })?;
        serde_json::from_value(value).map_err(|_| AgentError::Unparseable {
            agent: "MemoryShardsAgent",
            raw: reply.content.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::client_wrapper::{ToolDefinition, TokenUsage};
    use tokio::sync::Mutex as TokioMutex;

    struct FixedClient {
        reply: String,
    }

    #[async_trait]
    impl ClientWrapper for FixedClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: self.reply.clone().into(),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn usage_slot(&self) -> Option<&TokioMutex<Option<TokenUsage>>> {
            None
        }
    }

    #[tokio::test]
    async fn planner_parses_action_spec() {
        let client = Arc::new(FixedClient {
            reply: r#"{"actions":[{"type":"reply","payload":"hi"}]}"#.to_string(),
        });
        let template = PromptTemplate::new(
            "memory: {MEMORY_CONTEXT} plugins: {MCP_PLUGINS}",
            &["MEMORY_CONTEXT", "MCP_PLUGINS"],
        )
        .unwrap();
        let planner = PlannerAgent::new(client, template);
        let spec = planner.plan("hello", "none", "none").await.unwrap();
        assert_eq!(spec.actions.len(), 1);
        assert_eq!(spec.actions[0].action_type, ActionType::Reply);
    }

    #[tokio::test]
    async fn supervisor_defaults_to_approve_on_garbage_reply() {
        let client = Arc::new(FixedClient {
            reply: "not json at all".to_string(),
        });
        let template = PromptTemplate::new(
            "review: {ACTION_SPEC} memory: {USER_MEMORY}",
            &["ACTION_SPEC", "USER_MEMORY"],
        )
        .unwrap();
        let supervisor = SupervisorAgent::new(client, template);
        let verdict = supervisor.review("hi", "{}", "none").await;
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[test]
    fn plugin_validation_is_all_or_nothing() {
        let known = vec!["Web-Search".to_string(), "calculator".to_string()];
        assert!(validate_all_or_nothing(&["web_search".to_string()], &known).is_some());
        assert!(validate_all_or_nothing(
            &["web_search".to_string(), "missing".to_string()],
            &known
        )
        .is_none());
    }
}
