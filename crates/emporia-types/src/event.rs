use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input to the chat boundary: one user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Event on the global firehose bus. Loosely shaped on purpose: consumers
/// filter by `event` and dig into `properties`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event: impl Into<String>, properties: Value) -> Self {
        Self {
            event: event.into(),
            properties,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered per-turn stream delivered to the chat caller. `Done` is the
/// explicit end-of-turn marker and always terminates the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Token { content: String },
    ToolStart { tool: String },
    Products { data: Value },
    ProductDetail { data: Value },
    Cart { data: Value },
    Done,
}
