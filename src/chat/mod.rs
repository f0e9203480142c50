// Workspace chat
// Message-limit check, agent call and atomic persistence of each user/assistant exchange


use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{AgentContext, ConversationalAgent, stream_receiver_gone};
use crate::config::ChatConfig;
use crate::database::sqlite::models::{ChatRole, ChatTurn, MessageCounter, Workspace};
use crate::database::{Database, ExchangeCommit};
use crate::{KbError, Result};

type CounterKey = (String, String);

/// Result of sending one chat message
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The exchange was stored and counted
    Replied {
        user_turn: ChatTurn,
        assistant_turn: ChatTurn,
        /// False when the stored reply is an apology
        success: bool,
        error: Option<String>,
        message_count: i64,
        message_limit: i64,
    },
    /// The user already sent `limit` messages in this workspace; nothing was stored
    RateLimited { count: i64, limit: i64 },
}

impl SendOutcome {
    /// Turn a rate-limit outcome into `KbError::RateLimitExceeded`
    #[inline]
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::RateLimited { count, limit } => Err(KbError::RateLimitExceeded { count, limit }),
            replied @ Self::Replied { .. } => Ok(replied),
        }
    }
}

pub struct WorkspaceChatSession {
    database: Database,
    agent: Arc<ConversationalAgent>,
    history_limit: usize,
    locks: Mutex<HashMap<CounterKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceChatSession {
    #[inline]
    pub fn new(database: Database, agent: Arc<ConversationalAgent>, config: ChatConfig) -> Self {
        Self {
            database,
            agent,
            history_limit: config.history_limit,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Send a message and wait for the whole reply
    #[inline]
    pub async fn send_message(
        &self,
        workspace_id: &str,
        user_id: &str,
        content: &str,
    ) -> Result<SendOutcome> {
        self.send(workspace_id, user_id, content, None).await
    }

    /// Send a message, relaying reply text through `sender` while the model writes it.
    ///
    /// If the receiver is dropped before the reply completes the turn is abandoned: nothing is
    /// stored and the message does not count.
    #[inline]
    pub async fn send_message_streaming(
        &self,
        workspace_id: &str,
        user_id: &str,
        content: &str,
        sender: &mpsc::Sender<String>,
    ) -> Result<SendOutcome> {
        self.send(workspace_id, user_id, content, Some(sender)).await
    }

    /// Delete every turn for the user in the workspace; the message counter is kept
    #[inline]
    pub async fn clear_chat(&self, workspace_id: &str, user_id: &str) -> Result<u64> {
        self.workspace(workspace_id).await?;
        let lock = self.counter_lock(workspace_id, user_id);
        let guard = lock.lock().await;

        let cleared = self.database.clear_turns(workspace_id, user_id).await;
        drop(guard);
        drop(lock);
        self.release_counter_lock(workspace_id, user_id);

        let removed = cleared.map_err(KbError::database)?;
        info!(
            "Cleared {} turns for user {} in workspace {}",
            removed, user_id, workspace_id
        );
        Ok(removed)
    }

    /// The most recent `limit` turns, oldest first
    #[inline]
    pub async fn history(
        &self,
        workspace_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatTurn>> {
        self.database
            .recent_turns(workspace_id, user_id, limit)
            .await
            .map_err(KbError::database)
    }

    #[inline]
    pub async fn message_count(&self, workspace_id: &str, user_id: &str) -> Result<i64> {
        self.database
            .message_count(workspace_id, user_id)
            .await
            .map_err(KbError::database)
    }

    #[inline]
    pub async fn message_counter(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<MessageCounter>> {
        self.database
            .message_counter(workspace_id, user_id)
            .await
            .map_err(KbError::database)
    }

    async fn send(
        &self,
        workspace_id: &str,
        user_id: &str,
        content: &str,
        sender: Option<&mpsc::Sender<String>>,
    ) -> Result<SendOutcome> {
        if user_id.trim().is_empty() {
            return Err(KbError::Validation("User id cannot be empty".to_string()));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(KbError::Validation("Message cannot be empty".to_string()));
        }

        let workspace = self.workspace(workspace_id).await?;
        let ctx = AgentContext::for_workspace(&workspace);
        let limit = ctx.settings.message_limit;

        let lock = self.counter_lock(workspace_id, user_id);
        let guard = lock.lock().await;
        let outcome = self.exchange(&ctx, user_id, content, limit, sender).await;
        drop(guard);
        drop(lock);
        self.release_counter_lock(workspace_id, user_id);
        outcome
    }

    async fn exchange(
        &self,
        ctx: &AgentContext,
        user_id: &str,
        content: &str,
        limit: i64,
        sender: Option<&mpsc::Sender<String>>,
    ) -> Result<SendOutcome> {
        let workspace_id = ctx.workspace_id.as_str();

        let count = self.message_count(workspace_id, user_id).await?;
        if count >= limit {
            info!(
                "User {} reached the message limit in workspace {} ({}/{})",
                user_id, workspace_id, count, limit
            );
            return Ok(SendOutcome::RateLimited { count, limit });
        }

        let history = self.history(workspace_id, user_id, self.history_limit).await?;
        debug!(
            "Answering user {} in workspace {} with {} turns of history",
            user_id,
            workspace_id,
            history.len()
        );

        let user_turn = ChatTurn::new(workspace_id, user_id, ChatRole::User, content);
        let response = match sender {
            Some(sender) => {
                self.agent
                    .chat_streaming(ctx, content, &history, sender)
                    .await
            }
            None => self.agent.chat(ctx, content, &history).await,
        };
        if sender.is_some_and(mpsc::Sender::is_closed) {
            info!(
                "Stream for user {} in workspace {} closed before the reply finished; nothing stored",
                user_id, workspace_id
            );
            return Err(stream_receiver_gone());
        }
        if let Some(error) = &response.error {
            warn!(
                "Storing apology for user {} in workspace {}: {}",
                user_id, workspace_id, error
            );
        }
        let assistant_turn =
            ChatTurn::new(workspace_id, user_id, ChatRole::Assistant, &response.response);

        let commit = self
            .database
            .commit_exchange(&user_turn, &assistant_turn, limit)
            .await
            .map_err(KbError::database)?;

        match commit {
            ExchangeCommit::Committed => {
                let message_count = self.message_count(workspace_id, user_id).await?;
                Ok(SendOutcome::Replied {
                    user_turn,
                    assistant_turn,
                    success: response.success,
                    error: response.error,
                    message_count,
                    message_limit: limit,
                })
            }
            ExchangeCommit::LimitReached => {
                let count = self.message_count(workspace_id, user_id).await?;
                info!(
                    "Message limit reached for user {} in workspace {} while answering ({}/{})",
                    user_id, workspace_id, count, limit
                );
                Ok(SendOutcome::RateLimited { count, limit })
            }
        }
    }

    async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.database
            .get_workspace(workspace_id)
            .await
            .map_err(KbError::database)?
            .ok_or_else(|| KbError::NotFound(format!("Workspace {}", workspace_id)))
    }

    #[cfg(test)]
    pub(crate) fn tracked_counter_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn counter_lock(&self, workspace_id: &str, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            locks
                .entry((workspace_id.to_string(), user_id.to_string()))
                .or_default(),
        )
    }

    fn release_counter_lock(&self, workspace_id: &str, user_id: &str) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (workspace_id.to_string(), user_id.to_string());
        if locks
            .get(&key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&key);
        }
    }
}
