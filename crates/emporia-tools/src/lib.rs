use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use emporia_catalog::{CatalogClient, CatalogError};
use emporia_index::{SearchService, DEFAULT_MIN_SCORE};
use emporia_store::{CartOwner, Store};
use emporia_types::{Product, ProductCard, ToolSchema, EXACT_CATEGORIES};

const MAX_RESULTS: usize = 10;

/// Per-turn scratch state shared by every tool invocation in one turn.
///
/// `last_search_ids` records which product ids the most recent search
/// surfaced, so detail lookups for ids the model invented can be flagged.
pub struct TurnContext {
    pub conversation_id: String,
    pub user_id: Option<String>,
    last_search_ids: Mutex<HashSet<i64>>,
}

impl TurnContext {
    pub fn new(conversation_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id,
            last_search_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn owner(&self) -> CartOwner {
        CartOwner::resolve(self.user_id.as_deref(), &self.conversation_id)
    }

    pub async fn note_search_results(&self, products: &[Product]) {
        let mut ids = self.last_search_ids.lock().await;
        ids.clear();
        ids.extend(products.iter().map(|p| p.id));
    }

    pub async fn clear_search_results(&self) {
        self.last_search_ids.lock().await.clear();
    }

    pub async fn saw_product(&self, product_id: i64) -> bool {
        self.last_search_ids.lock().await.contains(&product_id)
    }
}

/// One capability the model can invoke. Implementations convert their own
/// failures into `{"error": ...}` payloads; an `Err` here means an internal
/// fault, and the registry turns it into an error payload as well so nothing
/// ever propagates past the tool layer.
#[async_trait]
pub trait ShoppingTool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value, ctx: &TurnContext) -> anyhow::Result<Value>;
}

/// Services the tools operate on, injected once at startup.
pub struct ToolServices {
    pub search: Arc<SearchService>,
    pub store: Arc<Store>,
    pub catalog: Arc<CatalogClient>,
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn ShoppingTool>>>,
}

impl ToolRegistry {
    pub fn new(services: Arc<ToolServices>) -> Self {
        let mut map: HashMap<String, Arc<dyn ShoppingTool>> = HashMap::new();
        let entries: Vec<Arc<dyn ShoppingTool>> = vec![
            Arc::new(SearchProductsTool {
                services: services.clone(),
            }),
            Arc::new(GetCategoriesTool {
                services: services.clone(),
            }),
            Arc::new(GetProductDetailsTool {
                services: services.clone(),
            }),
            Arc::new(AddToCartTool {
                services: services.clone(),
            }),
            Arc::new(GetCartTool {
                services: services.clone(),
            }),
            Arc::new(RemoveFromCartTool { services }),
        ];
        for tool in entries {
            map.insert(tool.schema().name, tool);
        }
        Self {
            tools: Arc::new(map),
        }
    }

    pub fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Run a tool by name. Never fails: unknown tools and tool faults both
    /// come back as `{"error": ...}` payloads the model can read and recover
    /// from.
    pub async fn execute(&self, name: &str, args: Value, ctx: &TurnContext) -> Value {
        let Some(tool) = self.tools.get(name) else {
            return json!({ "error": format!("Unknown tool: {name}") });
        };
        match tool.execute(args, ctx).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    target: "emporia.tools",
                    tool = name,
                    "tool execution failed: {err:#}"
                );
                json!({ "error": format!("{err:#}") })
            }
        }
    }
}

fn cards(products: &[Product]) -> Vec<Value> {
    products
        .iter()
        .map(|p| serde_json::to_value(ProductCard::from(p)).unwrap_or_default())
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn opt_f64(args: &Value, key: &str) -> Option<f64> {
    args.get(key).and_then(|v| v.as_f64())
}

fn require_product_id(args: &Value) -> Result<i64, Value> {
    args.get("product_id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| json!({ "error": "product_id must be an integer." }))
}

/// Index first, live catalog second. The index holds the whole catalog when
/// it is ready, so the fallback only matters in degraded mode. `Ok(None)`
/// means the product genuinely does not exist; an unreachable catalog comes
/// back as `Err` so tools can report the outage instead of a missing product.
async fn resolve_product(
    services: &ToolServices,
    product_id: i64,
) -> Result<Option<Product>, CatalogError> {
    if let Some(product) = services.search.product_by_id(product_id).await {
        return Ok(Some(product));
    }
    match services.catalog.get_product(product_id).await {
        Ok(product) => Ok(Some(product)),
        Err(CatalogError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn catalog_unreachable(err: &CatalogError) -> Value {
    tracing::warn!(target: "emporia.tools", "catalog lookup failed: {err:#}");
    json!({
        "error": "The product catalog is unreachable right now. Please try again in a moment."
    })
}

struct SearchProductsTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for SearchProductsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_products".to_string(),
            description: "Search the product catalog by meaning. Use a descriptive \
                query for what the customer wants; omit the query to browse. \
                Optionally narrow by category or a maximum price."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "What the customer is looking for, in natural language."
                    },
                    "category": {
                        "type": "string",
                        "enum": EXACT_CATEGORIES,
                        "description": "Restrict results to one catalog category."
                    },
                    "max_price": {
                        "type": "number",
                        "description": "Only include products at or below this price."
                    }
                }
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> anyhow::Result<Value> {
        let query = opt_str(&args, "query");
        let category = opt_str(&args, "category");
        let max_price = opt_f64(&args, "max_price");

        let products = match (&query, self.services.search.is_ready().await) {
            (Some(query), true) => {
                self.services
                    .search
                    .semantic_search(
                        query,
                        MAX_RESULTS,
                        category.as_deref(),
                        max_price,
                        DEFAULT_MIN_SCORE,
                    )
                    .await?
            }
            (None, true) => {
                let mut products = self
                    .services
                    .search
                    .browse(category.as_deref(), max_price)
                    .await?;
                products.truncate(MAX_RESULTS);
                products
            }
            // Degraded mode: the index never came up, substring matching
            // against the live catalog keeps the tool answering.
            (_, false) => {
                let mut products = self
                    .services
                    .catalog
                    .keyword_search(query.as_deref(), category.as_deref(), max_price)
                    .await?;
                products.truncate(MAX_RESULTS);
                products
            }
        };

        if products.is_empty() {
            ctx.clear_search_results().await;
            return Ok(json!({
                "message": "No products found matching your search.",
                "suggestion": "Try different keywords, or drop the category or price filter."
            }));
        }

        ctx.note_search_results(&products).await;
        Ok(json!({
            "count": products.len(),
            "products": cards(&products),
        }))
    }
}

struct GetCategoriesTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for GetCategoriesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_categories".to_string(),
            description: "List every product category in the catalog.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _args: Value, _ctx: &TurnContext) -> anyhow::Result<Value> {
        let categories = match self.services.search.categories().await {
            Ok(categories) => categories,
            Err(_) => self.services.catalog.list_categories().await?,
        };
        Ok(json!({ "categories": categories }))
    }
}

struct GetProductDetailsTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for GetProductDetailsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_product_details".to_string(),
            description: "Fetch the full record for one product, including its \
                description and rating. Use a product_id returned by search_products."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": {
                        "type": "integer",
                        "description": "Id of the product to look up."
                    }
                },
                "required": ["product_id"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> anyhow::Result<Value> {
        let product_id = match require_product_id(&args) {
            Ok(id) => id,
            Err(payload) => return Ok(payload),
        };

        // Soft provenance check: an id the last search never surfaced is
        // usually a hallucination, but a valid id still deserves an answer.
        if !ctx.saw_product(product_id).await {
            tracing::warn!(
                target: "emporia.tools",
                product_id,
                "detail lookup for an id outside the last search results"
            );
        }

        let product = match resolve_product(&self.services, product_id).await {
            Ok(Some(product)) => product,
            Ok(None) => {
                return Ok(json!({
                    "error": format!("Product {product_id} was not found in the catalog.")
                }));
            }
            Err(err) => return Ok(catalog_unreachable(&err)),
        };

        Ok(json!({
            "id": product.id,
            "title": product.title,
            "price": product.price,
            "description": product.description,
            "category": product.category,
            "image": product.image,
            "rating": {
                "rate": product.rating.rate,
                "count": product.rating.count,
            }
        }))
    }
}

struct AddToCartTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for AddToCartTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "add_to_cart".to_string(),
            description: "Add a product to the customer's cart. Adding a product \
                that is already in the cart increases its quantity."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": {
                        "type": "integer",
                        "description": "Id of the product to add."
                    },
                    "quantity": {
                        "type": "integer",
                        "description": "How many to add. Defaults to 1."
                    }
                },
                "required": ["product_id"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> anyhow::Result<Value> {
        let product_id = match require_product_id(&args) {
            Ok(id) => id,
            Err(payload) => return Ok(payload),
        };
        let quantity = args.get("quantity").and_then(|v| v.as_i64()).unwrap_or(1);
        if quantity < 1 {
            return Ok(json!({ "error": "Quantity must be at least 1." }));
        }

        let product = match resolve_product(&self.services, product_id).await {
            Ok(Some(product)) => product,
            Ok(None) => {
                return Ok(json!({
                    "error": format!("Product {product_id} was not found in the catalog.")
                }));
            }
            Err(err) => return Ok(catalog_unreachable(&err)),
        };

        let (line_quantity, total_items) = self
            .services
            .store
            .add_cart_item(&ctx.owner(), product_id, quantity)
            .await?;

        Ok(json!({
            "message": format!("Added {quantity} x {} to your cart.", product.title),
            "product_id": product.id,
            "product_title": product.title,
            "quantity_in_cart": line_quantity,
            "total_items": total_items,
        }))
    }
}

struct GetCartTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for GetCartTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_cart".to_string(),
            description: "Show the current contents of the customer's cart with \
                per-line subtotals and the overall total."
                .to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _args: Value, ctx: &TurnContext) -> anyhow::Result<Value> {
        let rows = self.services.store.cart_items(&ctx.owner()).await?;
        if rows.is_empty() {
            return Ok(json!({
                "message": "Your cart is empty.",
                "items": [],
                "total": 0.0,
            }));
        }

        let mut items = Vec::new();
        let mut total = 0.0;
        let mut item_count = 0;
        for row in rows {
            // A product that vanished from the catalog since it was added
            // cannot be priced; leave it out rather than fail the whole cart.
            let product = match resolve_product(&self.services, row.product_id).await {
                Ok(Some(product)) => product,
                Ok(None) => {
                    tracing::warn!(
                        target: "emporia.tools",
                        product_id = row.product_id,
                        "cart line references a product the catalog no longer has"
                    );
                    continue;
                }
                Err(err) => return Ok(catalog_unreachable(&err)),
            };
            let subtotal = round2(product.price * row.quantity as f64);
            total += subtotal;
            item_count += row.quantity;
            items.push(json!({
                "product_id": product.id,
                "title": product.title,
                "price": product.price,
                "quantity": row.quantity,
                "subtotal": subtotal,
            }));
        }

        Ok(json!({
            "items": items,
            "total": round2(total),
            "item_count": item_count,
        }))
    }
}

struct RemoveFromCartTool {
    services: Arc<ToolServices>,
}

#[async_trait]
impl ShoppingTool for RemoveFromCartTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "remove_from_cart".to_string(),
            description: "Remove a product line from the customer's cart entirely."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": {
                        "type": "integer",
                        "description": "Id of the product to remove."
                    }
                },
                "required": ["product_id"]
            }),
        }
    }

    async fn execute(&self, args: Value, ctx: &TurnContext) -> anyhow::Result<Value> {
        let product_id = match require_product_id(&args) {
            Ok(id) => id,
            Err(payload) => return Ok(payload),
        };

        let owner = ctx.owner();
        let removed = self
            .services
            .store
            .remove_cart_item(&owner, product_id)
            .await?;
        if !removed {
            return Ok(json!({
                "error": format!("Product {product_id} is not in your cart.")
            }));
        }

        // The line is already gone; the title is best-effort flavor.
        let title = match resolve_product(&self.services, product_id).await {
            Ok(Some(product)) => product.title,
            _ => format!("product {product_id}"),
        };
        let remaining = self.services.store.cart_items(&owner).await?;
        if remaining.is_empty() {
            Ok(json!({
                "message": format!("Removed {title}. Cart is now empty.")
            }))
        } else {
            Ok(json!({
                "message": format!("Removed {title} from your cart."),
                "remaining_items": remaining.len(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use emporia_index::{Embedder, IndexResult, VectorIndex};
    use emporia_types::Rating;

    struct StubEmbedder;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        v
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed_one(&self, text: &str) -> IndexResult<Vec<f32>> {
            let lowered = text.to_lowercase();
            if lowered.contains("backpack") {
                Ok(axis(0))
            } else if lowered.contains("ring") {
                Ok(axis(1))
            } else {
                Ok(axis(3))
            }
        }

        async fn embed_batch(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed_one(text).await?);
            }
            Ok(out)
        }
    }

    fn product(id: i64, title: &str, category: &str, price: f64) -> Product {
        Product {
            id,
            title: title.to_string(),
            price,
            description: String::new(),
            category: category.to_string(),
            image: String::new(),
            rating: Rating {
                rate: 4.5,
                count: 10,
            },
        }
    }

    async fn fixture(dir: &std::path::Path) -> (ToolRegistry, TurnContext) {
        let embedder = StubEmbedder;
        let products = vec![
            product(1, "Fjallraven Backpack", "men's clothing", 109.95),
            product(2, "Gold Ring", "jewelery", 168.0),
            product(3, "SSD Drive", "electronics", 64.0),
        ];
        let texts = products
            .iter()
            .map(Product::document_text)
            .collect::<Vec<_>>();
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        let index = VectorIndex::build(4, vectors, products).unwrap();

        let search = SearchService::new(Arc::new(StubEmbedder), dir.to_path_buf());
        search.install(index).await;

        // The upstream answers unknown ids with a `null` body; the stub
        // mirrors that so unknown-id lookups resolve to "not found" rather
        // than an outage (covered separately via `degraded_fixture`).
        let base = spawn_catalog_stub("null".to_string()).await;
        let services = Arc::new(ToolServices {
            search: Arc::new(search),
            store: Arc::new(Store::in_memory().await.unwrap()),
            catalog: Arc::new(CatalogClient::new(&base)),
        });
        let registry = ToolRegistry::new(services);
        let ctx = TurnContext::new("conv-1", None);
        (registry, ctx)
    }

    /// Minimal catalog stand-in: answers every request with the same JSON
    /// body, one connection at a time.
    async fn spawn_catalog_stub(body: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    /// Registry whose index never initialized, so every tool leans on the
    /// live catalog at `catalog_url`.
    async fn degraded_fixture(
        dir: &std::path::Path,
        catalog_url: &str,
    ) -> (ToolRegistry, TurnContext) {
        let search = SearchService::new(Arc::new(StubEmbedder), dir.to_path_buf());
        let services = Arc::new(ToolServices {
            search: Arc::new(search),
            store: Arc::new(Store::in_memory().await.unwrap()),
            catalog: Arc::new(CatalogClient::new(catalog_url)),
        });
        let registry = ToolRegistry::new(services);
        let ctx = TurnContext::new("conv-1", None);
        (registry, ctx)
    }

    #[tokio::test]
    async fn search_returns_cards_and_records_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let result = registry
            .execute("search_products", json!({"query": "a hiking backpack"}), &ctx)
            .await;
        assert_eq!(result["count"], 1);
        assert_eq!(result["products"][0]["id"], 1);
        assert_eq!(result["products"][0]["rating"], "4.5 (10 reviews)");
        assert!(ctx.saw_product(1).await);
        assert!(!ctx.saw_product(2).await);
    }

    #[tokio::test]
    async fn search_without_query_browses_in_catalog_order() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let result = registry
            .execute("search_products", json!({"max_price": 200.0}), &ctx)
            .await;
        assert_eq!(result["count"], 3);
        assert_eq!(result["products"][0]["id"], 1);
        assert_eq!(result["products"][2]["id"], 3);
    }

    #[tokio::test]
    async fn empty_search_clears_provenance_and_suggests() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        registry
            .execute("search_products", json!({"query": "backpack"}), &ctx)
            .await;
        assert!(ctx.saw_product(1).await);

        let result = registry
            .execute(
                "search_products",
                json!({"query": "backpack", "max_price": 1.0}),
                &ctx,
            )
            .await;
        assert_eq!(result["message"], "No products found matching your search.");
        assert!(result.get("suggestion").is_some());
        assert!(!ctx.saw_product(1).await);
    }

    #[tokio::test]
    async fn search_falls_back_to_keyword_matching_without_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = vec![
            product(1, "Fjallraven Backpack", "men's clothing", 109.95),
            product(2, "Gold Ring", "jewelery", 168.0),
        ];
        let base = spawn_catalog_stub(serde_json::to_string(&catalog).unwrap()).await;
        let (registry, ctx) = degraded_fixture(dir.path(), &base).await;

        let result = registry
            .execute("search_products", json!({"query": "backpack"}), &ctx)
            .await;
        assert_eq!(result["count"], 1);
        assert_eq!(result["products"][0]["id"], 1);
        assert!(ctx.saw_product(1).await);
    }

    #[tokio::test]
    async fn unreachable_catalog_reports_an_outage_not_a_missing_product() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = degraded_fixture(dir.path(), "http://127.0.0.1:9").await;

        let result = registry
            .execute("get_product_details", json!({"product_id": 1}), &ctx)
            .await;
        let error = result["error"].as_str().unwrap();
        assert!(error.contains("unreachable"));
        assert!(!error.contains("not found"));
    }

    #[tokio::test]
    async fn get_categories_lists_distinct_sorted_categories() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let result = registry.execute("get_categories", json!({}), &ctx).await;
        assert_eq!(
            result["categories"],
            json!(["electronics", "jewelery", "men's clothing"])
        );
    }

    #[tokio::test]
    async fn product_details_returns_full_record() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let result = registry
            .execute("get_product_details", json!({"product_id": 2}), &ctx)
            .await;
        assert_eq!(result["title"], "Gold Ring");
        assert_eq!(result["rating"]["rate"], 4.5);
        assert_eq!(result["rating"]["count"], 10);

        let missing = registry
            .execute("get_product_details", json!({"product_id": 999}), &ctx)
            .await;
        assert!(missing["error"]
            .as_str()
            .unwrap()
            .contains("was not found"));
    }

    #[tokio::test]
    async fn add_to_cart_accumulates_quantities() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let first = registry
            .execute("add_to_cart", json!({"product_id": 3, "quantity": 2}), &ctx)
            .await;
        assert_eq!(first["quantity_in_cart"], 2);
        assert_eq!(first["total_items"], 2);

        let second = registry
            .execute("add_to_cart", json!({"product_id": 3}), &ctx)
            .await;
        assert_eq!(second["quantity_in_cart"], 3);
        assert_eq!(second["total_items"], 3);
        assert_eq!(second["product_title"], "SSD Drive");
    }

    #[tokio::test]
    async fn add_to_cart_rejects_bad_quantity_and_unknown_product() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let zero = registry
            .execute("add_to_cart", json!({"product_id": 1, "quantity": 0}), &ctx)
            .await;
        assert_eq!(zero["error"], "Quantity must be at least 1.");

        let unknown = registry
            .execute("add_to_cart", json!({"product_id": 999}), &ctx)
            .await;
        assert!(unknown["error"]
            .as_str()
            .unwrap()
            .contains("was not found"));
    }

    #[tokio::test]
    async fn get_cart_totals_and_counts_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let empty = registry.execute("get_cart", json!({}), &ctx).await;
        assert_eq!(empty["message"], "Your cart is empty.");
        assert_eq!(empty["total"], 0.0);

        registry
            .execute("add_to_cart", json!({"product_id": 3, "quantity": 2}), &ctx)
            .await;
        registry
            .execute("add_to_cart", json!({"product_id": 2}), &ctx)
            .await;

        let cart = registry.execute("get_cart", json!({}), &ctx).await;
        assert_eq!(cart["item_count"], 3);
        assert_eq!(cart["items"][0]["subtotal"], 128.0);
        assert_eq!(cart["total"], 296.0);
    }

    #[tokio::test]
    async fn remove_from_cart_reports_remaining_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let missing = registry
            .execute("remove_from_cart", json!({"product_id": 3}), &ctx)
            .await;
        assert_eq!(missing["error"], "Product 3 is not in your cart.");

        registry
            .execute("add_to_cart", json!({"product_id": 3}), &ctx)
            .await;
        registry
            .execute("add_to_cart", json!({"product_id": 2}), &ctx)
            .await;

        let first = registry
            .execute("remove_from_cart", json!({"product_id": 3}), &ctx)
            .await;
        assert_eq!(first["message"], "Removed SSD Drive from your cart.");
        assert_eq!(first["remaining_items"], 1);

        let last = registry
            .execute("remove_from_cart", json!({"product_id": 2}), &ctx)
            .await;
        assert_eq!(last["message"], "Removed Gold Ring. Cart is now empty.");
    }

    #[tokio::test]
    async fn unknown_tool_comes_back_as_error_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, ctx) = fixture(dir.path()).await;

        let result = registry.execute("checkout", json!({}), &ctx).await;
        assert_eq!(result["error"], "Unknown tool: checkout");
    }

    #[test]
    fn schemas_are_sorted_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (registry, _ctx) = rt.block_on(fixture(dir.path()));

        let names = registry
            .list()
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "add_to_cart",
                "get_cart",
                "get_categories",
                "get_product_details",
                "remove_from_cart",
                "search_products",
            ]
        );
    }
}
