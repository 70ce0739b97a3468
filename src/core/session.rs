//! Session controller
//!
//! The controller drives one conversational session:
//! 1. Resolves the current conversation
//! 2. Persists the user's message
//! 3. Re-reads the conversation and sends it to the model with the system prompt
//! 4. Assembles the streamed reply, forwarding progress to a sink
//! 5. Persists the assistant message once the stream ends
//!
//! A failed model call leaves the user message in place and stores nothing
//! for the assistant.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::conversation::{Backup, Conversation, ConversationId, Message};
use crate::providers::{ModelClient, ModelRequest, ProviderError};

use super::assembler::{assemble, AssemblySink};
use super::service::{ConversationService, ConversationSummary};
use super::store::{RecordStore, StoreError};

/// Preference key of the system prompt
pub const SYSTEM_PROMPT_KEY: &str = "system_prompt";

/// Session-scoped state: which conversation the user is looking at
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    current: Option<ConversationId>,
}

impl Session {
    pub fn current(&self) -> Option<ConversationId> {
        self.current
    }

    pub fn select(&mut self, id: ConversationId) {
        self.current = Some(id);
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

/// Conversation list plus the selection it settled on
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListing {
    pub current: Option<ConversationId>,
    pub conversations: Vec<ConversationSummary>,
}

/// Errors from the session controller
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Model error: {0}")]
    Upstream(#[from] ProviderError),

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Invalid backup: {0}")]
    InvalidBackup(#[from] serde_json::Error),
}

pub struct SessionController {
    conversations: ConversationService,
    store: RecordStore,
    model: Arc<dyn ModelClient>,
    session: Mutex<Session>,
    turn: Mutex<()>,
}

impl SessionController {
    pub fn new(store: RecordStore, model: Arc<dyn ModelClient>, preview_chars: usize) -> Self {
        Self {
            conversations: ConversationService::new(store.clone(), preview_chars),
            store,
            model,
            session: Mutex::new(Session::default()),
            turn: Mutex::new(()),
        }
    }

    pub async fn current(&self) -> Option<ConversationId> {
        self.session.lock().await.current()
    }

    /// List conversations, pruning empty ones and settling the selection
    pub async fn list(&self) -> Result<ConversationListing, SessionError> {
        let mut session = self.session.lock().await;
        let conversations = self.conversations.list_for_display(&mut session).await?;
        Ok(ConversationListing {
            current: session.current(),
            conversations,
        })
    }

    /// Start a new empty conversation and switch to it
    pub async fn new_conversation(&self) -> Result<Conversation, SessionError> {
        let mut session = self.session.lock().await;
        Ok(self.conversations.create(&mut session).await?)
    }

    /// Switch to an existing conversation
    pub async fn select(&self, id: ConversationId) -> Result<Conversation, SessionError> {
        let conversation = self.conversations.get(id).await?;
        self.session.lock().await.select(id);
        Ok(conversation)
    }

    /// The conversation the user is looking at, establishing one if needed
    pub async fn current_conversation(&self) -> Result<Conversation, SessionError> {
        let id = self.resolve_current().await?;
        Ok(self.conversations.get(id).await?)
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        self.conversations.delete(&mut session, id).await?;
        Ok(())
    }

    /// Delete the message at `index` of the current conversation and all later ones
    pub async fn delete_message(&self, index: usize) -> Result<Conversation, SessionError> {
        let _turn = self.turn.lock().await;
        let id = self.resolve_current().await?;
        Ok(self.conversations.truncate_from(id, index).await?)
    }

    /// Overwrite the message sequence of a conversation
    pub async fn replace_messages(
        &self,
        id: ConversationId,
        messages: Vec<Message>,
    ) -> Result<Conversation, SessionError> {
        let _turn = self.turn.lock().await;
        Ok(self.conversations.replace_messages(id, messages).await?)
    }

    pub async fn system_prompt(&self) -> Result<String, SessionError> {
        Ok(self
            .store
            .get_setting(SYSTEM_PROMPT_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn set_system_prompt(&self, prompt: &str) -> Result<(), SessionError> {
        self.store.set_setting(SYSTEM_PROMPT_KEY, prompt).await?;
        Ok(())
    }

    /// Send a user message and stream the model's reply into `sink`.
    ///
    /// Turns are serialized, so two sends never mutate a conversation at once.
    /// Returns the conversation with both new messages appended.
    pub async fn send_message<K>(&self, text: &str, sink: &mut K) -> Result<Conversation, SessionError>
    where
        K: AssemblySink + Send + ?Sized,
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let _turn = self.turn.lock().await;
        let id = self.resolve_current().await?;

        let span = tracing::info_span!("turn", conversation = id, turn = %Uuid::new_v4());
        self.run_turn(id, text, sink).instrument(span).await
    }

    async fn run_turn<K>(&self, id: ConversationId, text: &str, sink: &mut K) -> Result<Conversation, SessionError>
    where
        K: AssemblySink + Send + ?Sized,
    {
        self.conversations.append_message(id, Message::user(text)).await?;

        let conversation = self.conversations.get(id).await?;
        let request = ModelRequest {
            messages: conversation.messages,
            system_prompt: self.system_prompt().await?,
        };

        let reply = match self.model.stream(request).await {
            Ok(fragments) => assemble(fragments, sink).await,
            Err(e) => Err(e),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "model call failed, reply not stored");
                return Err(e.into());
            }
        };

        let conversation = self
            .conversations
            .append_message(id, Message::assistant(reply))
            .await?;
        tracing::info!(messages = conversation.messages.len(), "turn complete");
        Ok(conversation)
    }

    /// Snapshot of every conversation plus the system prompt
    pub async fn export_backup(&self) -> Result<Backup, SessionError> {
        Ok(Backup {
            conversations: self.conversations.export_all().await?,
            system_prompt: Some(self.system_prompt().await?),
        })
    }

    /// Replace all conversations with a backup and reselect.
    ///
    /// The system prompt is only overwritten when the backup carries one.
    pub async fn restore_backup(&self, backup: Backup) -> Result<ConversationListing, SessionError> {
        let _turn = self.turn.lock().await;

        self.conversations.import_all(&backup.conversations).await?;
        if let Some(prompt) = &backup.system_prompt {
            self.set_system_prompt(prompt).await?;
        }

        self.session.lock().await.clear();
        tracing::info!(conversations = backup.conversations.len(), "backup restored");
        self.list().await
    }

    /// Restore from the JSON text of a backup file
    pub async fn restore_json(&self, json: &str) -> Result<ConversationListing, SessionError> {
        let backup = Backup::from_json(json)?;
        self.restore_backup(backup).await
    }

    async fn resolve_current(&self) -> Result<ConversationId, SessionError> {
        if let Some(id) = self.current().await {
            return Ok(id);
        }

        let mut session = self.session.lock().await;
        self.conversations.list_for_display(&mut session).await?;
        match session.current() {
            Some(id) => Ok(id),
            // Listing always settles on a conversation
            None => Ok(self.conversations.create(&mut session).await?.id),
        }
    }
}
