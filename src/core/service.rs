//! Conversation-level operations on top of the record store
//!
//! Every mutation is a read-modify-write of the whole record. Mutations of
//! one conversation are serialized through a per-id lock, and the store's
//! revision check turns any write that still slips past into a `Conflict`
//! instead of a lost update.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::conversation::{Conversation, ConversationId, Message};

use super::session::Session;
use super::store::{RecordStore, StoreError};

/// One entry of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub preview: String,
}

pub struct ConversationService {
    store: RecordStore,
    preview_chars: usize,
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationService {
    pub fn new(store: RecordStore, preview_chars: usize) -> Self {
        Self {
            store,
            preview_chars,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty conversation and make it current
    pub async fn create(&self, session: &mut Session) -> Result<Conversation, StoreError> {
        let id = self.store.create(None).await?;
        session.select(id);
        self.store.get(id).await
    }

    pub async fn get(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.store.get(id).await
    }

    /// Append one message and return the updated conversation
    pub async fn append_message(
        &self,
        id: ConversationId,
        message: Message,
    ) -> Result<Conversation, StoreError> {
        self.rewrite(id, |messages| messages.push(message)).await
    }

    /// Replace the whole message sequence
    pub async fn replace_messages(
        &self,
        id: ConversationId,
        messages: Vec<Message>,
    ) -> Result<Conversation, StoreError> {
        self.rewrite(id, |current| *current = messages).await
    }

    /// Drop the message at `cut_index` and everything after it
    pub async fn truncate_from(
        &self,
        id: ConversationId,
        cut_index: usize,
    ) -> Result<Conversation, StoreError> {
        self.rewrite(id, |messages| messages.truncate(cut_index)).await
    }

    /// Delete a conversation, deselecting it if it was current
    pub async fn delete(&self, session: &mut Session, id: ConversationId) -> Result<(), StoreError> {
        let guard = self.lock(id).await;
        self.store.delete(id).await?;
        drop(guard);

        self.forget_lock(id);
        if session.current() == Some(id) {
            session.clear();
        }
        Ok(())
    }

    /// List non-empty conversations newest first, pruning empty ones.
    ///
    /// The newest conversation survives while empty only if it is the
    /// current one, i.e. the user has just opened it. Afterwards the session
    /// always points at an existing conversation: the previous selection if
    /// it survived, else the newest non-empty one, else a fresh empty one.
    pub async fn list_for_display(
        &self,
        session: &mut Session,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        // Listing order; `None` marks a conversation that looked empty
        let mut entries: Vec<(ConversationId, Option<ConversationSummary>)> = Vec::new();

        {
            let mut rows = self.store.list_by_creation_desc();
            while let Some(conversation) = rows.try_next().await? {
                let summary = (!conversation.is_empty()).then(|| self.summarize(&conversation));
                entries.push((conversation.id, summary));
            }
        }

        let newest = entries.first().map(|(id, _)| *id);
        let spared = newest.filter(|id| {
            session.current() == Some(*id) && entries.first().is_some_and(|(_, s)| s.is_none())
        });

        let mut summaries = Vec::with_capacity(entries.len());
        for (id, summary) in entries {
            match summary {
                Some(summary) => summaries.push(summary),
                None if Some(id) == spared => {}
                None => {
                    if let Some(summary) = self.prune_if_empty(id).await? {
                        summaries.push(summary);
                    }
                }
            }
        }

        let current_survives = session
            .current()
            .is_some_and(|id| Some(id) == spared || summaries.iter().any(|s| s.id == id));
        if !current_survives {
            session.clear();
        }

        if summaries.is_empty() && spared.is_none() {
            let id = self.store.create(None).await?;
            session.select(id);
            tracing::info!(conversation = id, "no conversations left, started a new one");
        } else if session.current().is_none() {
            if let Some(first) = summaries.first() {
                session.select(first.id);
            }
        }

        Ok(summaries)
    }

    /// Every stored conversation, for backup
    pub async fn export_all(&self) -> Result<Vec<Conversation>, StoreError> {
        self.store.all().await
    }

    /// Replace the whole store with the given conversations.
    ///
    /// All or nothing: a rejected record leaves the existing ones in place.
    pub async fn import_all(&self, conversations: &[Conversation]) -> Result<(), StoreError> {
        self.store.replace_all(conversations).await?;
        self.locks_guard().clear();

        tracing::info!(count = conversations.len(), "conversations imported");
        Ok(())
    }

    /// Delete a conversation that was seen empty, unless a writer got to it
    /// first. Returns its summary when it is no longer empty.
    async fn prune_if_empty(&self, id: ConversationId) -> Result<Option<ConversationSummary>, StoreError> {
        let guard = self.lock(id).await;

        let conversation = match self.store.get(id).await {
            Ok(conversation) => conversation,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !conversation.is_empty() {
            return Ok(Some(self.summarize(&conversation)));
        }

        self.store.delete(id).await?;
        drop(guard);

        self.forget_lock(id);
        tracing::debug!(conversation = id, "pruned empty conversation");
        Ok(None)
    }

    fn summarize(&self, conversation: &Conversation) -> ConversationSummary {
        ConversationSummary {
            id: conversation.id,
            preview: conversation.preview(self.preview_chars),
        }
    }

    async fn rewrite<F>(&self, id: ConversationId, edit: F) -> Result<Conversation, StoreError>
    where
        F: FnOnce(&mut Vec<Message>),
    {
        let _guard = self.lock(id).await;

        let mut conversation = self.store.get(id).await?;
        edit(&mut conversation.messages);
        self.store.put(&mut conversation).await?;
        Ok(conversation)
    }

    async fn lock(&self, id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = self.locks_guard().entry(id).or_default().clone();
        lock.lock_owned().await
    }

    fn forget_lock(&self, id: ConversationId) {
        self.locks_guard().remove(&id);
    }

    fn locks_guard(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>> {
        // The map is only touched in short critical sections that cannot
        // panic, so a poisoned lock still holds a consistent map.
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
