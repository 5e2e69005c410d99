use std::time::Duration;

use emporia_types::Product;
use thiserror::Error;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product #{0} not found upstream")]
    NotFound(i64),
    #[error("catalog unavailable after {attempts} attempts: {detail}")]
    Unavailable { attempts: u32, detail: String },
}

/// HTTP client for the upstream Fake-Store-style catalog API.
///
/// Transient failures (network errors, 5xx) are retried with exponential
/// backoff; a 404 is surfaced immediately as `NotFound`.
#[derive(Clone)]
pub struct CatalogClient {
    base_url: String,
    client: reqwest::Client,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub async fn list_products(&self) -> CatalogResult<Vec<Product>> {
        let value = self.get_json("/products", None).await?;
        parse_products(value)
    }

    pub async fn get_product(&self, product_id: i64) -> CatalogResult<Product> {
        let value = self
            .get_json(&format!("/products/{product_id}"), Some(product_id))
            .await?;
        // The upstream API answers some unknown ids with an empty body
        // instead of a 404.
        if value.is_null() {
            return Err(CatalogError::NotFound(product_id));
        }
        serde_json::from_value(value).map_err(|e| CatalogError::Unavailable {
            attempts: 1,
            detail: format!("malformed product payload: {e}"),
        })
    }

    pub async fn list_categories(&self) -> CatalogResult<Vec<String>> {
        let value = self.get_json("/products/categories", None).await?;
        serde_json::from_value(value).map_err(|e| CatalogError::Unavailable {
            attempts: 1,
            detail: format!("malformed categories payload: {e}"),
        })
    }

    /// Keyword search fallback: fetches the full catalog and filters client
    /// side. No relevance ranking; results stay in catalog order.
    pub async fn keyword_search(
        &self,
        query: Option<&str>,
        category: Option<&str>,
        max_price: Option<f64>,
    ) -> CatalogResult<Vec<Product>> {
        let products = self.list_products().await?;
        Ok(keyword_filter(products, query, category, max_price))
    }

    async fn get_json(
        &self,
        endpoint: &str,
        not_found_id: Option<i64>,
    ) -> CatalogResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut last_detail = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::NOT_FOUND {
                        if let Some(id) = not_found_id {
                            return Err(CatalogError::NotFound(id));
                        }
                        return Err(CatalogError::Unavailable {
                            attempts: attempt,
                            detail: format!("unexpected 404 for {endpoint}"),
                        });
                    }
                    if status.is_success() {
                        return resp.json().await.map_err(|e| CatalogError::Unavailable {
                            attempts: attempt,
                            detail: format!("invalid response body: {e}"),
                        });
                    }
                    last_detail = format!("status {status}");
                    if !status.is_server_error() {
                        // 4xx other than 404 will not get better with retries.
                        return Err(CatalogError::Unavailable {
                            attempts: attempt,
                            detail: last_detail,
                        });
                    }
                }
                Err(err) => {
                    last_detail = err.to_string();
                }
            }
            if attempt < MAX_ATTEMPTS {
                let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(
                    target: "emporia.catalog",
                    "catalog request to {endpoint} failed ({last_detail}), retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(CatalogError::Unavailable {
            attempts: MAX_ATTEMPTS,
            detail: last_detail,
        })
    }
}

fn parse_products(value: serde_json::Value) -> CatalogResult<Vec<Product>> {
    serde_json::from_value(value).map_err(|e| CatalogError::Unavailable {
        attempts: 1,
        detail: format!("malformed catalog payload: {e}"),
    })
}

/// Client-side filter shared by the degraded-mode search path. Query words
/// shorter than 3 characters are ignored; a product matches when any
/// remaining word appears case-insensitively in its title or description.
pub fn keyword_filter(
    mut products: Vec<Product>,
    query: Option<&str>,
    category: Option<&str>,
    max_price: Option<f64>,
) -> Vec<Product> {
    if let Some(category) = category {
        products.retain(|p| p.category.eq_ignore_ascii_case(category));
    }

    if let Some(query) = query {
        let words = query
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !words.is_empty() {
            products.retain(|p| {
                let title = p.title.to_lowercase();
                let description = p.description.to_lowercase();
                words
                    .iter()
                    .any(|w| title.contains(w) || description.contains(w))
            });
        }
    }

    if let Some(max_price) = max_price {
        products.retain(|p| p.price <= max_price);
    }

    products
}
