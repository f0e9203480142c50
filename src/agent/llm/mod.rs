// Completion models
// Provider-neutral chat types and an OpenAI-compatible client over blocking HTTP


use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{LlmConfig, ProviderConfig};
use crate::http::{build_agent, describe_error, post_json, post_json_streaming};
use crate::{KbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments exactly as the model produced them
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    #[inline]
    pub fn system(content: &str) -> Self {
        Self::text(MessageRole::System, content)
    }

    #[inline]
    pub fn user(content: &str) -> Self {
        Self::text(MessageRole::User, content)
    }

    #[inline]
    pub fn assistant(content: &str) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    /// Assistant turn that carries a single tool invocation
    #[inline]
    pub fn assistant_tool_call(call: ToolCall) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: vec![call],
            tool_call_id: None,
        }
    }

    #[inline]
    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.to_string()),
        }
    }

    fn text(role: MessageRole, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn to_wire(&self) -> Value {
        let mut wire = json!({
            "role": self.role.as_str(),
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            wire["tool_calls"] = Value::Array(
                self.tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect(),
            );
        }
        if let Some(id) = &self.tool_call_id {
            wire["tool_call_id"] = json!(id);
        }
        wire
    }
}

/// Tool description advertised to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One model step: a final answer, tool invocations, or both
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        params: &GenerateParams,
    ) -> Result<ModelReply>;

    /// Like `complete`, relaying content deltas through `sender` as they arrive.
    ///
    /// Models without native streaming send the whole answer as one delta.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        params: &GenerateParams,
        sender: &mpsc::Sender<String>,
    ) -> Result<ModelReply> {
        let reply = self.complete(messages, tools, params).await?;
        if let Some(content) = reply.content.as_ref().filter(|c| !c.is_empty()) {
            sender
                .send(content.clone())
                .await
                .map_err(|_| stream_receiver_gone())?;
        }
        Ok(reply)
    }
}

/// The streaming caller hung up; the turn is abandoned
#[inline]
pub fn stream_receiver_gone() -> KbError {
    KbError::AgentExecution("Stream receiver closed before the reply finished".to_string())
}

/// Chat completions against any OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleModel {
    name: String,
    endpoint: Url,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Reassembles a streamed reply from server-sent event lines
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<u64, ToolCall>,
    done: bool,
}

impl StreamAccumulator {
    /// Fold one SSE line in, returning the content delta it carried
    fn push_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Ok(None);
        };
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let event: Value = serde_json::from_str(data).map_err(|e| {
            KbError::RemoteService(format!("Malformed completion stream event: {}", e))
        })?;
        let delta = &event["choices"][0]["delta"];

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or_default();
                let entry = self.tool_calls.entry(index).or_insert_with(|| ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = call["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(arguments);
                }
            }
        }

        match delta["content"].as_str() {
            Some(content) if !content.is_empty() => {
                self.content.push_str(content);
                Ok(Some(content.to_string()))
            }
            _ => Ok(None),
        }
    }

    fn into_reply(self) -> ModelReply {
        ModelReply {
            content: (!self.content.is_empty()).then_some(self.content),
            tool_calls: self
                .tool_calls
                .into_values()
                .filter(|call| !call.name.is_empty())
                .collect(),
        }
    }
}

impl OpenAiCompatibleModel {
    #[inline]
    pub fn new(name: &str, provider: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let endpoint = provider
            .endpoint_url()?
            .join("chat/completions")
            .map_err(|e| KbError::Config(format!("Failed to build completion URL: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            endpoint,
            api_key: provider.resolved_api_key(),
            agent: build_agent(timeout),
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_body(
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        params: &GenerateParams,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": params.model,
            "messages": messages.iter().map(ChatMessage::to_wire).collect::<Vec<_>>(),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn parse_reply(response_text: &str) -> Result<ModelReply> {
        let response: CompletionResponse = serde_json::from_str(response_text).map_err(|e| {
            KbError::RemoteService(format!("Failed to parse completion response: {}", e))
        })?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| KbError::RemoteService("No choices in completion response".to_string()))?;

        Ok(ModelReply {
            content: choice.message.content,
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

    fn complete_blocking(&self, body: &str) -> Result<ModelReply> {
        let response_text = post_json(
            &self.agent,
            self.endpoint.as_str(),
            self.api_key.as_deref(),
            body,
        )
        .map_err(|e| KbError::RemoteService(describe_error(&self.service_label(), &e)))?;
        Self::parse_reply(&response_text)
    }

    fn stream_blocking(&self, body: &str, sender: &mpsc::Sender<String>) -> Result<ModelReply> {
        let reader = post_json_streaming(
            &self.agent,
            self.endpoint.as_str(),
            self.api_key.as_deref(),
            body,
        )
        .map_err(|e| KbError::RemoteService(describe_error(&self.service_label(), &e)))?;

        let mut accumulator = StreamAccumulator::default();
        for line in reader.lines() {
            if sender.is_closed() {
                return Err(stream_receiver_gone());
            }
            let line = line.map_err(|e| {
                KbError::RemoteService(format!("Completion stream interrupted: {}", e))
            })?;
            if let Some(delta) = accumulator.push_line(&line)? {
                sender
                    .blocking_send(delta)
                    .map_err(|_| stream_receiver_gone())?;
            }
            if accumulator.done {
                break;
            }
        }
        Ok(accumulator.into_reply())
    }

    fn service_label(&self) -> String {
        format!("Completion provider '{}'", self.name)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        params: &GenerateParams,
    ) -> Result<ModelReply> {
        let body = Self::request_body(messages, tools, params, false).to_string();
        debug!(
            "Requesting completion from {} ({} messages, {} tools)",
            self.name,
            messages.len(),
            tools.len()
        );

        let model = self.clone();
        tokio::task::spawn_blocking(move || model.complete_blocking(&body))
            .await
            .map_err(|e| KbError::RemoteService(format!("Completion task failed: {}", e)))?
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        params: &GenerateParams,
        sender: &mpsc::Sender<String>,
    ) -> Result<ModelReply> {
        let body = Self::request_body(messages, tools, params, true).to_string();
        debug!("Streaming completion from {}", self.name);

        let model = self.clone();
        let sender = sender.clone();
        tokio::task::spawn_blocking(move || model.stream_blocking(&body, &sender))
            .await
            .map_err(|e| KbError::RemoteService(format!("Completion task failed: {}", e)))?
    }
}

/// Completion models keyed by provider name
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn ChatModel>>,
}

impl ModelRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// One OpenAI-compatible client per configured provider
    #[inline]
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new();
        for (name, provider) in &config.providers {
            let model = OpenAiCompatibleModel::new(name, provider, config.timeout())?;
            if model.api_key.is_none() {
                warn!("No API key configured for completion provider '{}'", name);
            }
            registry.insert(name, Arc::new(model));
        }
        info!("Configured {} completion provider(s)", registry.models.len());
        Ok(registry)
    }

    #[inline]
    pub fn insert(&mut self, provider: &str, model: Arc<dyn ChatModel>) {
        self.models.insert(provider.to_string(), model);
    }

    #[inline]
    pub fn get(&self, provider: &str) -> Result<Arc<dyn ChatModel>> {
        self.models
            .get(provider)
            .cloned()
            .ok_or_else(|| KbError::Config(format!("Unknown AI provider '{}'", provider)))
    }

    #[inline]
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.keys().cloned().collect();
        names.sort();
        names
    }
}
