//! Conversations bound to one provider model for their whole life.
//!
//! Every send runs under the conversation's own lock:
//!
//! ```text
//!  resolve target ──▶ credential ──▶ QuotaTracker.check ──▶ AdapterLayer.send ──▶ commit
//!   (binding check)                   (denied: nothing      (failure: user +       (user +
//!                                       recorded)             error message)        assistant)
//! ```
//!
//! Either a whole exchange is committed or nothing is. A send dropped by a
//! caller timeout, or interrupted by [`ConversationManager::close`], leaves
//! the transcript as it was.

mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use state::{Conversation, ConversationState, Message, MessageRole};

use crate::adapter::AdapterLayer;
use crate::auth::CredentialStore;
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::registry::{ProviderRegistry, ProviderRemovalHook};
use crate::store;
use crate::types::ModelTarget;
use crate::{Error, Result};

struct Slot {
    conversation: Mutex<Conversation>,
    cancel: CancellationToken,
}

impl Slot {
    fn new(conversation: Conversation) -> Arc<Self> {
        Arc::new(Self {
            conversation: Mutex::new(conversation),
            cancel: CancellationToken::new(),
        })
    }
}

/// Creates conversations and routes their messages.
pub struct ConversationManager {
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    quota: Arc<QuotaTracker>,
    adapter: Arc<AdapterLayer>,
    conversations: RwLock<HashMap<String, Arc<Slot>>>,
    store_dir: Option<PathBuf>,
}

impl ConversationManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
        quota: Arc<QuotaTracker>,
        adapter: Arc<AdapterLayer>,
    ) -> Self {
        Self {
            registry,
            credentials,
            quota,
            adapter,
            conversations: RwLock::new(HashMap::new()),
            store_dir: None,
        }
    }

    /// Persist each conversation as `<dir>/<id>.json`.
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Load persisted conversations. Returns how many were read.
    pub async fn load(&self) -> Result<usize> {
        let Some(dir) = &self.store_dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match store::read_json::<Conversation>(&path).await {
                Ok(Some(conversation)) => loaded.push(conversation),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable conversation"),
            }
        }

        let count = self.restore(loaded).await;
        debug!(count, "loaded conversations");
        Ok(count)
    }

    /// Insert conversations that are not already known. Returns how many were added.
    pub async fn restore(&self, conversations: Vec<Conversation>) -> usize {
        let mut map = self.conversations.write().await;
        let before = map.len();
        for conversation in conversations {
            map.entry(conversation.id.clone())
                .or_insert_with(|| Slot::new(conversation));
        }
        map.len() - before
    }

    /// Start a conversation, optionally with the model it is meant for.
    ///
    /// The conversation stays unbound until its first exchange commits.
    pub async fn create(&self, target: Option<ModelTarget>) -> Result<Conversation> {
        if let Some(target) = &target {
            self.registry.get(&target.provider_id)?;
        }
        let conversation = Conversation::new(Uuid::new_v4().to_string(), target);
        self.persist(&conversation).await;

        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), Slot::new(conversation.clone()));
        info!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    /// Send one user message and commit the exchange.
    ///
    /// `target` may be omitted once the conversation is bound or was created
    /// with one. Returns the committed assistant message, which names the
    /// fallback model if a substitution happened.
    ///
    /// # Errors
    ///
    /// - `ConversationClosed` / `ConversationBindingViolation` before anything is sent
    /// - `QuotaExceeded` with nothing recorded
    /// - any adapter error, after recording the user message and an error entry
    /// - `Cancelled` if the conversation was closed mid-send
    pub async fn send_message(
        &self,
        conversation_id: &str,
        target: Option<ModelTarget>,
        content: &str,
    ) -> Result<Message> {
        let slot = self.slot(conversation_id).await?;
        let mut conversation = tokio::select! {
            guard = slot.conversation.lock() => guard,
            _ = slot.cancel.cancelled() => {
                return Err(Error::ConversationClosed(conversation_id.to_string()));
            }
        };

        let target = conversation.resolve_target(target.as_ref())?;
        let provider = self.registry.get(&target.provider_id)?;
        let key = self.credentials.get(&target.provider_id).await?;

        let tier = provider.config.tier_for(&target.model_id);
        let (model_id, substituted_from) =
            match self.quota.check(&target.provider_id, tier, &target.model_id) {
                QuotaDecision::Allowed {
                    model_id,
                    substituted_from,
                } => (model_id, substituted_from),
                QuotaDecision::Denied(e) => return Err(e),
            };

        let history = conversation.history_with(content);
        let user = Message::user(content);
        debug!(
            conversation_id,
            provider_id = %target.provider_id,
            model = %model_id,
            turns = history.len(),
            "sending message"
        );

        let result = tokio::select! {
            result = self.adapter.send(&provider.config, &model_id, &history, &key) => result,
            _ = slot.cancel.cancelled() => {
                info!(conversation_id, "send cancelled by close");
                return Err(Error::Cancelled);
            }
        };

        match result {
            Ok(completion) => {
                let mut reply = Message::assistant(completion.content, &model_id);
                reply.substituted_from = substituted_from;
                reply.usage = Some(completion.usage);
                conversation.commit(&target, user, reply.clone());
                self.persist(&conversation).await;
                Ok(reply)
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "send failed");
                conversation.commit(&target, user, Message::error(e.to_string()));
                self.persist(&conversation).await;
                Err(e)
            }
        }
    }

    /// [`send_message`](Self::send_message) bounded by a caller timeout.
    ///
    /// On timeout nothing is committed and `Error::Cancelled` is returned.
    pub async fn send_message_with_timeout(
        &self,
        conversation_id: &str,
        target: Option<ModelTarget>,
        content: &str,
        timeout: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout(timeout, self.send_message(conversation_id, target, content))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                info!(conversation_id, timeout_ms = timeout.as_millis() as u64, "send timed out");
                Err(Error::Cancelled)
            }
        }
    }

    /// Close a conversation, cancelling any in-flight send first.
    pub async fn close(&self, conversation_id: &str) -> Result<Conversation> {
        let slot = self.slot(conversation_id).await?;
        slot.cancel.cancel();

        let mut conversation = slot.conversation.lock().await;
        if !conversation.is_closed() {
            conversation.close();
            self.persist(&conversation).await;
            info!(conversation_id, "conversation closed");
        }
        Ok(conversation.clone())
    }

    /// Close every conversation bound to or started for a provider.
    pub async fn close_for_provider(&self, provider_id: &str) -> Vec<String> {
        let slots: Vec<_> = self.conversations.read().await.values().cloned().collect();
        let mut closed = Vec::new();
        for slot in slots {
            let id = {
                let conversation = slot.conversation.lock().await;
                if conversation.is_closed() || !conversation.involves_provider(provider_id) {
                    continue;
                }
                conversation.id.clone()
            };
            if self.close(&id).await.is_ok() {
                closed.push(id);
            }
        }
        closed
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Conversation> {
        let slot = self.slot(conversation_id).await?;
        let conversation = slot.conversation.lock().await;
        Ok(conversation.clone())
    }

    /// All conversations, oldest first.
    pub async fn list(&self) -> Vec<Conversation> {
        let slots: Vec<_> = self.conversations.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(slots.len());
        for slot in slots {
            all.push(slot.conversation.lock().await.clone());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    async fn slot(&self, conversation_id: &str) -> Result<Arc<Slot>> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_string()))
    }

    async fn persist(&self, conversation: &Conversation) {
        let Some(dir) = &self.store_dir else {
            return;
        };
        let path = dir.join(format!("{}.json", conversation.id));
        if let Err(e) = store::write_json(&path, conversation).await {
            warn!(conversation_id = %conversation.id, error = %e, "failed to persist conversation");
        }
    }
}

#[async_trait]
impl ProviderRemovalHook for ConversationManager {
    fn name(&self) -> &str {
        "conversations"
    }

    async fn on_provider_removed(&self, provider_id: &str) -> Result<()> {
        let closed = self.close_for_provider(provider_id).await;
        debug!(provider_id, closed = closed.len(), "closed conversations for removed provider");
        Ok(())
    }
}
