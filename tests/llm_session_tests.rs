use async_trait::async_trait;
use conclave::client_wrapper::{ClientWrapper, Message, Role, TokenUsage, ToolDefinition};
use conclave::LLMSession;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Mock client that echoes a fixed response and records how many messages
/// it was actually sent, so tests can observe history trimming.
struct MockClient {
    response_content: String,
    last_message_count: Mutex<usize>,
    usage: Mutex<Option<TokenUsage>>,
}

impl MockClient {
    fn new(response_content: impl Into<String>) -> Self {
        Self {
            response_content: response_content.into(),
            last_message_count: Mutex::new(0),
            usage: Mutex::new(None),
        }
    }

    async fn get_last_message_count(&self) -> usize {
        *self.last_message_count.lock().await
    }
}

#[async_trait]
impl ClientWrapper for MockClient {
    async fn send_message(
        &self,
        messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn std::error::Error>> {
        *self.last_message_count.lock().await = messages.len();
        Ok(Message {
            role: Role::Assistant,
            content: self.response_content.clone().into(),
            tool_calls: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

#[tokio::test]
async fn send_message_includes_system_prompt_and_history() {
    let client = Arc::new(MockClient::new("hi there"));
    let mut session = LLMSession::new(client.clone(), "System prompt".to_string(), 10_000);

    let reply = session
        .send_message(Role::User, "hello".to_string())
        .await
        .unwrap();

    assert_eq!(reply.content.as_ref(), "hi there");
    // system prompt + user message = 2 sent to the client
    assert_eq!(client.get_last_message_count().await, 2);

    session
        .send_message(Role::User, "again".to_string())
        .await
        .unwrap();
    // system + first user + first assistant + second user = 4
    assert_eq!(client.get_last_message_count().await, 4);
}

#[tokio::test]
async fn history_is_trimmed_to_stay_under_max_tokens() {
    let client = Arc::new(MockClient::new("short"));
    // Tiny budget forces older turns out of the window quickly.
    let mut session = LLMSession::new(client.clone(), "sys".to_string(), 12);

    for i in 0..5 {
        session
            .send_message(Role::User, format!("message number {}", i))
            .await
            .unwrap();
    }

    let count = client.get_last_message_count().await;
    assert!(
        count < 11,
        "expected trimming to keep the sent window well under the full 10-turn history, got {}",
        count
    );
}

#[tokio::test]
async fn set_system_prompt_replaces_prior_prompt() {
    let client = Arc::new(MockClient::new("ok"));
    let mut session = LLMSession::new(client.clone(), "old prompt".to_string(), 10_000);
    session.set_system_prompt("new prompt".to_string());

    session
        .send_message(Role::User, "hi".to_string())
        .await
        .unwrap();
    assert_eq!(client.get_last_message_count().await, 2);
}
