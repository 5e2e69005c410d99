use serde_json::json;
use tokio::sync::broadcast;

use emporia_types::EngineEvent;

// Slow `/events` subscribers fall behind and drop frames; turns never
// block on them. A turn emits a handful of events, so this buffers well
// over a hundred concurrent turns.
const FIREHOSE_CAPACITY: usize = 256;

/// Broadcast firehose of engine lifecycle events, consumed by the
/// `/events` SSE endpoint. Turn and tool milestones go through the typed
/// publishers so every subscriber sees the same property shapes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_turn_started(&self, conversation_id: &str, turn_id: &str) {
        self.publish(EngineEvent::new(
            "turn.started",
            json!({"conversation_id": conversation_id, "turn_id": turn_id}),
        ));
    }

    pub fn publish_tool_executed(
        &self,
        conversation_id: &str,
        turn_id: &str,
        tool: &str,
        status: &str,
    ) {
        self.publish(EngineEvent::new(
            "tool.executed",
            json!({
                "conversation_id": conversation_id,
                "turn_id": turn_id,
                "tool": tool,
                "status": status,
            }),
        ));
    }

    pub fn publish_turn_completed(&self, conversation_id: &str, turn_id: &str, cancelled: bool) {
        self.publish(EngineEvent::new(
            "turn.completed",
            json!({
                "conversation_id": conversation_id,
                "turn_id": turn_id,
                "cancelled": cancelled,
            }),
        ));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
