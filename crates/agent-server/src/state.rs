//! Application State

use std::collections::HashMap;
use std::sync::Arc;

use agent_core::{ConversationEngine, ConversationState};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Why a conversation could not be continued
#[derive(Debug, PartialEq, Eq)]
pub enum CheckoutError {
    /// No conversation with that id
    NotFound(String),
    /// Another exchange is running on it
    Busy(Uuid),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Engine shared by every exchange
    pub engine: Arc<ConversationEngine>,

    /// Conversations kept in memory between requests; `None` while an
    /// exchange holds the conversation
    conversations: Arc<RwLock<HashMap<Uuid, Option<ConversationState>>>>,
}

impl AppState {
    pub fn new(engine: Arc<ConversationEngine>) -> Self {
        Self {
            engine,
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Take a stored conversation out, or start a new one when `id` is `None`.
    ///
    /// The caller puts it back with [`AppState::store`] once the exchange is
    /// over, so two requests never extend the same history at once.
    pub async fn checkout(&self, id: Option<&str>) -> Result<ConversationState, CheckoutError> {
        let Some(raw) = id else {
            let conversation = self.engine.new_conversation();
            self.conversations.write().await.insert(conversation.id, None);
            return Ok(conversation);
        };

        let id = Uuid::parse_str(raw).map_err(|_| CheckoutError::NotFound(raw.to_string()))?;
        let mut conversations = self.conversations.write().await;
        match conversations.get_mut(&id) {
            None => Err(CheckoutError::NotFound(raw.to_string())),
            Some(slot) => slot.take().ok_or(CheckoutError::Busy(id)),
        }
    }

    pub async fn store(&self, conversation: ConversationState) {
        self.conversations
            .write()
            .await
            .insert(conversation.id, Some(conversation));
    }

    /// Drop a conversation whose state could not be recovered.
    pub async fn forget(&self, id: &str) {
        if let Ok(id) = Uuid::parse_str(id) {
            self.conversations.write().await.remove(&id);
        }
    }
}
