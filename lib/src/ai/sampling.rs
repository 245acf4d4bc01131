//! HTTP model-completion client (OpenAI-compatible chat completions).
//!
//! Deliberately minimal: one request per completion, no streaming, no
//! retries. Transport-level retry policy is out of scope for this crate.

use super::{ModelRequest, ModelResponse, SamplingClient, ToolCall};
use crate::config::Sampling;
use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub struct HttpSamplingClient {
    client: Client,
    endpoint: Option<String>,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl HttpSamplingClient {
    pub fn new(config: Option<&Sampling>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()?;
        Ok(HttpSamplingClient {
            client,
            endpoint: config.map(|c| c.endpoint.clone()),
            api_key: config.and_then(|c| c.api_key.clone()),
            model: config.map(|c| c.model.clone()).unwrap_or_default(),
            max_tokens: config.map(|c| c.max_tokens).unwrap_or(4096),
        })
    }
}

impl SamplingClient for HttpSamplingClient {
    fn supports_sampling(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn complete(&self, request: &ModelRequest) -> anyhow::Result<ModelResponse> {
        let endpoint = self
            .endpoint
            .as_deref()
            .context("no sampling endpoint configured")?;

        let body = ChatCompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| ChatMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            tools: request
                .tools
                .iter()
                .map(|t| ToolSpec {
                    kind: "function",
                    function: FunctionSpec {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        };

        let mut http = self.client.post(endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let response = http
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("sampling request failed")?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("while parsing sampling response")?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .context("sampling response has no choices")?;

        Ok(ModelResponse {
            text: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
        })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ToolSpec<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    function: FunctionSpec<'a>,
}

#[derive(Serialize)]
struct FunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_availability_follows_endpoint() {
        let without = HttpSamplingClient::new(None).unwrap();
        assert!(!without.supports_sampling());

        let config = Sampling {
            endpoint: "https://models.internal/v1/chat/completions".into(),
            api_key: None,
            model: "investigator-1".into(),
            max_tokens: 1024,
        };
        let with = HttpSamplingClient::new(Some(&config)).unwrap();
        assert!(with.supports_sampling());
    }
}
