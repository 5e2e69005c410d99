mod event;
mod product;
mod tool;

pub use event::{ChatRequest, EngineEvent, TurnEvent};
pub use product::{Product, ProductCard, Rating};
pub use tool::{ToolSchema, EXACT_CATEGORIES};
