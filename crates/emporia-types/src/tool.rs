use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Catalog categories as the upstream store spells them. Exposed so the
/// system prompt and tool descriptions agree on the exact strings.
pub const EXACT_CATEGORIES: [&str; 4] = [
    "electronics",
    "jewelery",
    "men's clothing",
    "women's clothing",
];

/// JSON-schema description of a callable tool, as handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}
