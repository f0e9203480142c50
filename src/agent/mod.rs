// Conversational agent
// Bounded model/tool loop that grounds answers in the workspace knowledge base

pub mod llm;
pub mod tools;


use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::database::sqlite::models::{ChatRole, ChatTurn, Workspace, WorkspaceSettings};
use crate::{KbError, Result};

pub use llm::{
    ChatMessage, ChatModel, GenerateParams, MessageRole, ModelRegistry, ModelReply,
    OpenAiCompatibleModel, ToolCall, ToolDefinition, stream_receiver_gone,
};
pub use tools::{AgentTool, ToolRegistry};

/// Reply stored when the agent could not produce an answer
pub const APOLOGY: &str =
    "I'm sorry, I couldn't answer that right now. Please try again in a moment.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant for a school workspace. \
Answer questions using the workspace knowledge base. Call search_knowledge_base before \
answering factual questions, base your answer only on the passages the tools return, and \
cite sources by their bracketed number and title. If the knowledge base does not contain \
the answer, say so plainly.";

/// Workspace a chat turn runs in
#[derive(Debug, Clone, PartialEq)]
pub struct AgentContext {
    pub workspace_id: String,
    pub workspace_name: String,
    pub knowledge_base_id: String,
    pub settings: WorkspaceSettings,
}

impl AgentContext {
    #[inline]
    pub fn for_workspace(workspace: &Workspace) -> Self {
        Self {
            workspace_id: workspace.id.clone(),
            workspace_name: workspace.name.clone(),
            knowledge_base_id: workspace.knowledge_base_id.clone(),
            settings: workspace.effective_settings(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentResponse {
    pub response: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    fn answered(response: String) -> Self {
        Self {
            response,
            success: true,
            error: None,
        }
    }

    fn failed(error: &KbError) -> Self {
        Self {
            response: APOLOGY.to_string(),
            success: false,
            error: Some(error.to_string()),
        }
    }
}

pub struct ConversationalAgent {
    models: Arc<ModelRegistry>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
    timeout: Duration,
}

impl ConversationalAgent {
    #[inline]
    pub fn new(models: Arc<ModelRegistry>, tools: Arc<ToolRegistry>, config: AgentConfig) -> Self {
        Self {
            models,
            tools,
            max_iterations: config.max_iterations.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Answer a question; failures come back as an apology with `success: false`
    #[inline]
    pub async fn chat(
        &self,
        ctx: &AgentContext,
        question: &str,
        history: &[ChatTurn],
    ) -> AgentResponse {
        self.run_bounded(ctx, question, history, None).await
    }

    /// Like `chat`, relaying answer text through `sender` as the model produces it
    #[inline]
    pub async fn chat_streaming(
        &self,
        ctx: &AgentContext,
        question: &str,
        history: &[ChatTurn],
        sender: &mpsc::Sender<String>,
    ) -> AgentResponse {
        self.run_bounded(ctx, question, history, Some(sender)).await
    }

    async fn run_bounded(
        &self,
        ctx: &AgentContext,
        question: &str,
        history: &[ChatTurn],
        sender: Option<&mpsc::Sender<String>>,
    ) -> AgentResponse {
        let outcome = tokio::time::timeout(
            self.timeout,
            self.run_loop(ctx, question, history, sender),
        )
        .await
        .unwrap_or_else(|_| {
            Err(KbError::AgentExecution(format!(
                "No answer within {} seconds",
                self.timeout.as_secs_f32()
            )))
        });

        match outcome {
            Ok(answer) => AgentResponse::answered(answer),
            Err(e) => {
                warn!(
                    workspace_id = %ctx.workspace_id,
                    "Agent failed to answer: {}",
                    e
                );
                AgentResponse::failed(&e)
            }
        }
    }

    async fn run_loop(
        &self,
        ctx: &AgentContext,
        question: &str,
        history: &[ChatTurn],
        sender: Option<&mpsc::Sender<String>>,
    ) -> Result<String> {
        let model = self.models.get(&ctx.settings.ai_provider)?;
        let params = GenerateParams {
            model: ctx.settings.ai_model.clone(),
            temperature: ctx.settings.temperature,
            max_tokens: ctx.settings.max_tokens,
        };
        let definitions = self.tools.definitions();

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&format!(
            "{}\nWorkspace: {}",
            SYSTEM_PROMPT, ctx.workspace_name
        )));
        messages.extend(history.iter().map(|turn| match turn.role {
            ChatRole::User => ChatMessage::user(&turn.content),
            ChatRole::Assistant => ChatMessage::assistant(&turn.content),
        }));
        messages.push(ChatMessage::user(question));

        for iteration in 1..=self.max_iterations {
            if sender.is_some_and(mpsc::Sender::is_closed) {
                return Err(stream_receiver_gone());
            }
            let reply = match sender {
                Some(sender) => {
                    model
                        .complete_streaming(&messages, &definitions, &params, sender)
                        .await?
                }
                None => model.complete(&messages, &definitions, &params).await?,
            };

            let mut calls = reply.tool_calls.into_iter();
            let Some(call) = calls.next() else {
                let answer = reply.content.unwrap_or_default();
                if answer.trim().is_empty() {
                    return Err(KbError::AgentExecution(
                        "Model returned an empty answer".to_string(),
                    ));
                }
                info!(
                    "Agent answered in {} step(s) for workspace {}",
                    iteration, ctx.workspace_id
                );
                return Ok(answer);
            };

            let ignored = calls.count();
            if ignored > 0 {
                warn!(
                    "Model requested {} extra tool calls in one step; only {} runs",
                    ignored, call.name
                );
            }

            debug!(
                "Step {}/{}: calling tool {}",
                iteration, self.max_iterations, call.name
            );
            let output = self.tools.invoke(ctx, &call.name, &call.arguments).await?;
            let call_id = call.id.clone();
            messages.push(ChatMessage::assistant_tool_call(call));
            messages.push(ChatMessage::tool_result(&call_id, &output));
        }

        Err(KbError::AgentExecution(format!(
            "No final answer after {} steps",
            self.max_iterations
        )))
    }
}
