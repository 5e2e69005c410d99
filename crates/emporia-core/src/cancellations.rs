use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One live cancellation token per conversation. Registering a new turn for
/// a conversation cancels whatever turn was still running for it.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conversation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().await;
        if let Some(previous) = tokens.insert(conversation_id.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel the running turn for a conversation. Returns whether one was
    /// actually live.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let mut tokens = self.tokens.lock().await;
        match tokens.remove(conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished turn's token. A cancelled token means a newer turn
    /// may already own the slot, so it is left alone.
    pub async fn finish(&self, conversation_id: &str, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        self.tokens.lock().await.remove(conversation_id);
    }
}
