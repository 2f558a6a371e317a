//! A single `ClientWrapper` for any OpenAI-compatible Chat Completions
//! endpoint, selected at runtime by base URL and model name.
//!
//! Conclave only ever talks to providers that speak the OpenAI wire format
//! (OpenAI itself, and OpenAI-compatible proxies such as DeepSeek); rather
//! than one hand-rolled struct per vendor, a single client is parameterised
//! by `base_url` and constructed from the environment (see
//! [`provider_from_env`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use conclave::clients::openai_compatible::OpenAiCompatibleClient;
//! use conclave::client_wrapper::{ClientWrapper, Message, Role};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret_key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
//!     let client = OpenAiCompatibleClient::new_with_model_string(&secret_key, "gpt-4.1-nano");
//!     let resp = client
//!         .send_message(
//!             &[Message {
//!                 role: Role::User,
//!                 content: "Hello!".into(),
//!                 tool_calls: Vec::new(),
//!             }],
//!             None,
//!         )
//!         .await
//!         .unwrap();
//!     println!("Assistant: {}", resp.content);
//! }
//! ```

use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use openai_rust2 as openai_rust;
use openai_rust2::chat;
use tokio::sync::Mutex;

use crate::client_wrapper::{ClientWrapper, Message, Role, ToolDefinition, TokenUsage};
use crate::clients::common::{get_shared_http_client, send_and_track, send_with_native_tools};

/// A provider configured entirely from environment variables, per the
/// `<PROVIDER>_API_KEY`/`_BASE_URL`/`_MODEL` convention.
pub struct OpenAiCompatibleClient {
    client: openai_rust::Client,
    model: String,
    api_key: String,
    base_url: String,
    token_usage: Mutex<Option<TokenUsage>>,
}

impl OpenAiCompatibleClient {
    /// Construct a client against the official OpenAI API.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, "https://api.openai.com/v1")
    }

    /// Construct a client against an arbitrary OpenAI-compatible base URL.
    /// `base_url` should not carry a trailing slash, e.g.
    /// `https://api.deepseek.com/v1`.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let base_url_normalized = base_url.trim_end_matches('/').to_string();
        Self {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_shared_http_client().clone(),
                &format!("{}/", base_url_normalized),
            ),
            model: model_name.to_string(),
            api_key: secret_key.to_string(),
            base_url: base_url_normalized,
            token_usage: Mutex::new(None),
        }
    }
}

#[derive(Debug)]
pub struct ProviderEnvError {
    pub provider: String,
    pub missing_var: String,
}

impl fmt::Display for ProviderEnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "provider '{}' is missing required env var {}",
            self.provider, self.missing_var
        )
    }
}

impl Error for ProviderEnvError {}

fn env_is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

/// Build a client for `provider` (e.g. `"openai"`, `"deepseek"`) from the
/// `<PROVIDER>_API_KEY`/`_BASE_URL`/`_MODEL`/`_USE_PROXY`/`_PROXY_URL`
/// env-var convention. When `_USE_PROXY` is truthy, `_PROXY_URL` is used as
/// the base URL instead of `_BASE_URL`. `_BASE_URL` is optional for
/// `openai` (defaults to the official API); required for every other
/// provider name unless a proxy is configured.
pub fn provider_from_env(provider: &str) -> Result<OpenAiCompatibleClient, ProviderEnvError> {
    let prefix = provider.to_uppercase();
    let api_key = std::env::var(format!("{}_API_KEY", prefix)).map_err(|_| ProviderEnvError {
        provider: provider.to_string(),
        missing_var: format!("{}_API_KEY", prefix),
    })?;
    let model = std::env::var(format!("{}_MODEL", prefix)).map_err(|_| ProviderEnvError {
        provider: provider.to_string(),
        missing_var: format!("{}_MODEL", prefix),
    })?;

    let use_proxy = std::env::var(format!("{}_USE_PROXY", prefix))
        .map(|v| env_is_truthy(&v))
        .unwrap_or(false);
    if use_proxy {
        let proxy_url =
            std::env::var(format!("{}_PROXY_URL", prefix)).map_err(|_| ProviderEnvError {
                provider: provider.to_string(),
                missing_var: format!("{}_PROXY_URL", prefix),
            })?;
        return Ok(OpenAiCompatibleClient::new_with_base_url(
            &api_key, &model, &proxy_url,
        ));
    }

    let base_url = std::env::var(format!("{}_BASE_URL", prefix)).ok();
    Ok(match base_url {
        Some(url) => OpenAiCompatibleClient::new_with_base_url(&api_key, &model, &url),
        None if provider.eq_ignore_ascii_case("openai") => {
            OpenAiCompatibleClient::new_with_model_string(&api_key, &model)
        }
        None => {
            return Err(ProviderEnvError {
                provider: provider.to_string(),
                missing_var: format!("{}_BASE_URL", prefix),
            })
        }
    })
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool { .. } => "tool",
    }
}

#[async_trait]
impl ClientWrapper for OpenAiCompatibleClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        match tools {
            Some(tools) => {
                send_with_native_tools(
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                    messages,
                    &tools,
                    get_shared_http_client(),
                    &self.token_usage,
                )
                .await
            }
            None => {
                let formatted = messages
                    .iter()
                    .map(|msg| chat::Message {
                        role: role_str(&msg.role).to_string(),
                        content: msg.content.to_string(),
                    })
                    .collect();

                let content = send_and_track(
                    &self.client,
                    &self.model,
                    formatted,
                    Some("/chat/completions".to_string()),
                    &self.token_usage,
                    None,
                )
                .await?;

                Ok(Message {
                    role: Role::Assistant,
                    content: content.into(),
                    tool_calls: Vec::new(),
                })
            }
        }
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_reported_by_name() {
        std::env::remove_var("TESTPROV_API_KEY");
        let err = provider_from_env("testprov").unwrap_err();
        assert_eq!(err.missing_var, "TESTPROV_API_KEY");
    }

    #[test]
    fn non_openai_provider_requires_base_url() {
        std::env::set_var("TESTPROV2_API_KEY", "k");
        std::env::set_var("TESTPROV2_MODEL", "m");
        std::env::remove_var("TESTPROV2_BASE_URL");
        let err = provider_from_env("testprov2").unwrap_err();
        assert_eq!(err.missing_var, "TESTPROV2_BASE_URL");
        std::env::remove_var("TESTPROV2_API_KEY");
        std::env::remove_var("TESTPROV2_MODEL");
    }

    #[test]
    fn role_str_maps_tool_variant() {
        assert_eq!(role_str(&Role::Tool { call_id: "x".into() }), "tool");
    }

    #[test]
    fn use_proxy_requires_proxy_url_and_skips_base_url() {
        std::env::set_var("TESTPROV3_API_KEY", "k");
        std::env::set_var("TESTPROV3_MODEL", "m");
        std::env::set_var("TESTPROV3_USE_PROXY", "true");
        std::env::remove_var("TESTPROV3_PROXY_URL");
        let err = provider_from_env("testprov3").unwrap_err();
        assert_eq!(err.missing_var, "TESTPROV3_PROXY_URL");

        std::env::set_var("TESTPROV3_PROXY_URL", "https://proxy.internal/v1");
        let client = provider_from_env("testprov3").unwrap();
        assert_eq!(client.base_url, "https://proxy.internal/v1");

        std::env::remove_var("TESTPROV3_API_KEY");
        std::env::remove_var("TESTPROV3_MODEL");
        std::env::remove_var("TESTPROV3_USE_PROXY");
        std::env::remove_var("TESTPROV3_PROXY_URL");
    }
}
