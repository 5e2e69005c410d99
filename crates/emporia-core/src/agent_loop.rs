use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use emporia_observability::{emit_event, ObservabilityEvent, ProcessKind};
use emporia_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use emporia_store::Store;
use emporia_tools::{ToolRegistry, TurnContext};
use emporia_types::{ChatRequest, TurnEvent};

use crate::cancellations::CancellationRegistry;
use crate::event_bus::EventBus;
use crate::prompt::SYSTEM_PROMPT;

/// Upper bound on model/tool alternations within one turn.
const MAX_HOPS: usize = 8;
/// How much persisted history each turn sees.
const HISTORY_MESSAGES: usize = 10;
/// Cap on a single tool output fed back to the model.
const TOOL_OUTPUT_CHARS: usize = 2_000;

const APOLOGY: &str =
    "I'm sorry, I ran into a problem while answering. Please try again in a moment.";

#[derive(Default)]
struct StreamedToolCall {
    name: String,
    args: String,
}

/// Drives one conversation turn: stream the model, run the tools it asks
/// for, feed the results back, repeat until it answers in plain text.
pub struct AgentLoop {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    store: Arc<Store>,
    event_bus: EventBus,
    cancellations: CancellationRegistry,
    provider_id: Option<String>,
    model_id: Option<String>,
}

impl AgentLoop {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        store: Arc<Store>,
        event_bus: EventBus,
        cancellations: CancellationRegistry,
        provider_id: Option<String>,
        model_id: Option<String>,
    ) -> Self {
        Self {
            providers,
            tools,
            store,
            event_bus,
            cancellations,
            provider_id,
            model_id,
        }
    }

    /// Run one turn, streaming `TurnEvent`s into `events`. Always terminates
    /// the stream with `Done`, and always leaves the exchange persisted, even
    /// when the provider fails.
    pub async fn run_turn(
        &self,
        request: ChatRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> anyhow::Result<String> {
        let conversation_id = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let turn_id = uuid::Uuid::new_v4().to_string();

        let ctx = TurnContext::new(conversation_id.clone(), request.user_id.clone());
        let cancel = self.cancellations.register(&conversation_id).await;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.started",
                component: "core.loop",
                conversation_id: Some(&conversation_id),
                turn_id: Some(&turn_id),
                tool: None,
                provider_id: self.provider_id.as_deref(),
                model_id: self.model_id.as_deref(),
                status: Some("running"),
                error_code: None,
                detail: None,
            },
        );
        self.event_bus.publish_turn_started(&conversation_id, &turn_id);

        let mut messages = vec![ChatMessage::new("system", SYSTEM_PROMPT)];
        let history = self
            .store
            .recent_messages(&conversation_id, HISTORY_MESSAGES)
            .await;
        let history = match history {
            Ok(history) => history,
            Err(err) => {
                return self
                    .abort_turn(&conversation_id, &turn_id, &events, &cancel, err.into())
                    .await;
            }
        };
        for stored in history {
            messages.push(ChatMessage::new(stored.role, stored.content));
        }
        messages.push(ChatMessage::new("user", request.message.clone()));

        let tool_schemas = self.tools.list();
        let mut completion = String::new();
        let mut announced_tools: HashSet<String> = HashSet::new();
        let mut last_tool_outputs: Vec<String> = Vec::new();
        let mut hops_left = MAX_HOPS;
        let mut provider_failed = false;

        while hops_left > 0 && !cancel.is_cancelled() {
            hops_left -= 1;

            let stream = self
                .providers
                .stream_for_provider(
                    self.provider_id.as_deref(),
                    self.model_id.as_deref(),
                    messages.clone(),
                    Some(tool_schemas.clone()),
                    cancel.clone(),
                )
                .await;
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    self.report_provider_error(&conversation_id, &turn_id, &err);
                    provider_failed = true;
                    break;
                }
            };
            tokio::pin!(stream);

            completion.clear();
            let mut streamed_calls: BTreeMap<usize, StreamedToolCall> = BTreeMap::new();

            let mut stream_failed = false;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        self.report_provider_error(&conversation_id, &turn_id, &err);
                        stream_failed = true;
                        break;
                    }
                };
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        completion.push_str(&delta);
                        let _ = events
                            .send(TurnEvent::Token { content: delta })
                            .await;
                    }
                    StreamChunk::ToolCallStart { index, name, .. } => {
                        let entry = streamed_calls.entry(index).or_default();
                        if entry.name.is_empty() {
                            entry.name = name;
                        }
                    }
                    StreamChunk::ToolCallDelta { index, args_delta } => {
                        streamed_calls
                            .entry(index)
                            .or_default()
                            .args
                            .push_str(&args_delta);
                    }
                    StreamChunk::Done { .. } => break,
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            if stream_failed {
                provider_failed = true;
                break;
            }

            // BTreeMap keeps the model's request order.
            let tool_calls = streamed_calls
                .into_values()
                .filter(|call| !call.name.trim().is_empty())
                .map(|call| {
                    let args = serde_json::from_str::<Value>(&call.args)
                        .unwrap_or_else(|_| json!({}));
                    (call.name, args)
                })
                .collect::<Vec<_>>();

            if tool_calls.is_empty() {
                break;
            }

            let mut outputs = Vec::new();
            for (tool, args) in tool_calls {
                if cancel.is_cancelled() {
                    break;
                }
                if announced_tools.insert(tool.clone()) {
                    let _ = events
                        .send(TurnEvent::ToolStart { tool: tool.clone() })
                        .await;
                }

                let result = self.tools.execute(&tool, args, &ctx).await;
                let status = if result.get("error").is_some() {
                    "failed"
                } else {
                    "ok"
                };
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "tool.executed",
                        component: "core.loop",
                        conversation_id: Some(&conversation_id),
                        turn_id: Some(&turn_id),
                        tool: Some(&tool),
                        provider_id: None,
                        model_id: None,
                        status: Some(status),
                        error_code: None,
                        detail: None,
                    },
                );
                self.event_bus
                    .publish_tool_executed(&conversation_id, &turn_id, &tool, status);

                if let Some(event) = payload_event(&tool, &result) {
                    let _ = events.send(event).await;
                }

                outputs.push(format!(
                    "Tool {tool} returned: {}",
                    truncate_text(&result.to_string(), TOOL_OUTPUT_CHARS)
                ));
            }

            if outputs.is_empty() {
                break;
            }
            last_tool_outputs = outputs.clone();
            messages.push(ChatMessage::new(
                "user",
                format!(
                    "{}\n\nAnswer the customer using these results. Do not repeat \
                     identical tool calls.",
                    outputs.join("\n")
                ),
            ));
        }

        if provider_failed && completion.trim().is_empty() {
            completion = APOLOGY.to_string();
            let _ = events
                .send(TurnEvent::Token {
                    content: completion.clone(),
                })
                .await;
        }

        // The model sometimes stops after a tool hop without narrating. One
        // plain completion pass recovers a closing answer, replayed in word
        // chunks so the client still sees a stream.
        if completion.trim().is_empty() && !last_tool_outputs.is_empty() && !cancel.is_cancelled() {
            let narrative = match self.complete_without_tools(messages.clone()).await {
                Ok(text) => text,
                Err(err) => {
                    self.report_provider_error(&conversation_id, &turn_id, &err);
                    String::new()
                }
            };
            completion = if narrative.trim().is_empty() {
                fallback_summary(&last_tool_outputs)
            } else {
                narrative
            };
            for word in completion.split_inclusive(' ') {
                let _ = events
                    .send(TurnEvent::Token {
                        content: word.to_string(),
                    })
                    .await;
            }
        }

        let recorded = self
            .store
            .record_exchange(&conversation_id, &request.message, &completion)
            .await;
        if let Err(err) = recorded {
            return self
                .abort_turn(&conversation_id, &turn_id, &events, &cancel, err.into())
                .await;
        }

        let _ = events.send(TurnEvent::Done).await;
        self.event_bus
            .publish_turn_completed(&conversation_id, &turn_id, cancel.is_cancelled());
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.completed",
                component: "core.loop",
                conversation_id: Some(&conversation_id),
                turn_id: Some(&turn_id),
                tool: None,
                provider_id: self.provider_id.as_deref(),
                model_id: self.model_id.as_deref(),
                status: Some(if cancel.is_cancelled() {
                    "cancelled"
                } else {
                    "completed"
                }),
                error_code: None,
                detail: None,
            },
        );
        self.cancellations.finish(&conversation_id, &cancel).await;

        Ok(completion)
    }

    /// Store failures still end the stream with `Done` and release the
    /// cancellation slot before the error propagates.
    async fn abort_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        err: anyhow::Error,
    ) -> anyhow::Result<String> {
        let detail = truncate_text(&format!("{err:#}"), 500);
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "turn.failed",
                component: "core.loop",
                conversation_id: Some(conversation_id),
                turn_id: Some(turn_id),
                tool: None,
                provider_id: self.provider_id.as_deref(),
                model_id: self.model_id.as_deref(),
                status: Some("failed"),
                error_code: None,
                detail: Some(&detail),
            },
        );
        let _ = events.send(TurnEvent::Done).await;
        self.event_bus
            .publish_turn_completed(conversation_id, turn_id, cancel.is_cancelled());
        self.cancellations.finish(conversation_id, cancel).await;
        Err(err)
    }

    async fn complete_without_tools(
        &self,
        mut messages: Vec<ChatMessage>,
    ) -> anyhow::Result<String> {
        messages.push(ChatMessage::new(
            "user",
            "Write your final answer to the customer now, using the tool results above. \
             Do not call any tools.",
        ));
        self.providers
            .complete_for_provider(self.provider_id.as_deref(), self.model_id.as_deref(), messages)
            .await
    }

    fn report_provider_error(&self, conversation_id: &str, turn_id: &str, err: &anyhow::Error) {
        let detail = truncate_text(&format!("{err:#}"), 500);
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.error",
                component: "core.loop",
                conversation_id: Some(conversation_id),
                turn_id: Some(turn_id),
                tool: None,
                provider_id: self.provider_id.as_deref(),
                model_id: self.model_id.as_deref(),
                status: Some("failed"),
                error_code: None,
                detail: Some(&detail),
            },
        );
    }
}

/// Map a successful tool result onto the structured event the frontend
/// renders. Error payloads never produce one; the model narrates those.
fn payload_event(tool: &str, result: &Value) -> Option<TurnEvent> {
    if result.get("error").is_some() {
        return None;
    }
    match tool {
        "search_products" => result.get("products").map(|products| TurnEvent::Products {
            data: products.clone(),
        }),
        "get_product_details" => result.get("id").map(|_| TurnEvent::ProductDetail {
            data: result.clone(),
        }),
        "add_to_cart" | "get_cart" | "remove_from_cart" => Some(TurnEvent::Cart {
            data: result.clone(),
        }),
        _ => None,
    }
}

fn fallback_summary(outputs: &[String]) -> String {
    let preview = outputs
        .iter()
        .take(3)
        .map(|o| truncate_text(o, 240))
        .collect::<Vec<_>>()
        .join("\n");
    format!("I looked that up for you. Here is what I found:\n{preview}")
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated = input.chars().take(max_chars).collect::<String>();
    format!("{truncated}...")
}
