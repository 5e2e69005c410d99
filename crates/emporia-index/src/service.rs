use std::path::PathBuf;
use std::sync::Arc;

use emporia_catalog::CatalogClient;
use emporia_types::Product;
use tokio::sync::RwLock;

use crate::persist::{load_artifacts, save_artifacts};
use crate::vector::VectorIndex;
use crate::{Embedder, IndexError, IndexResult};

pub const DEFAULT_MIN_SCORE: f32 = 0.10;

/// Semantic retrieval over the product catalog.
///
/// The index is built (or loaded) once and then shared read-only across
/// concurrent turns; `initialize` swaps a fresh `Arc` in atomically, so no
/// reader ever observes a partial build.
pub struct SearchService {
    embedder: Arc<dyn Embedder>,
    data_dir: PathBuf,
    index: RwLock<Option<Arc<VectorIndex>>>,
}

impl SearchService {
    pub fn new(embedder: Arc<dyn Embedder>, data_dir: PathBuf) -> Self {
        Self {
            embedder,
            data_dir,
            index: RwLock::new(None),
        }
    }

    /// Swap a prebuilt index in wholesale.
    pub async fn install(&self, index: VectorIndex) {
        *self.index.write().await = Some(Arc::new(index));
    }

    pub async fn is_ready(&self) -> bool {
        self.index
            .read()
            .await
            .as_ref()
            .is_some_and(|index| index.is_ready())
    }

    /// Load artifacts from disk if possible, otherwise fetch the catalog,
    /// embed every product and persist the result for the next start.
    pub async fn initialize(&self, catalog: &CatalogClient) -> IndexResult<()> {
        match load_artifacts(&self.data_dir) {
            Ok(index) => {
                self.install(index).await;
                return Ok(());
            }
            Err(err) => {
                tracing::info!(
                    target: "emporia.index",
                    "no usable index artifacts ({err}), building from catalog"
                );
            }
        }
        self.rebuild(catalog).await
    }

    /// Fetch, embed and replace the index wholesale.
    pub async fn rebuild(&self, catalog: &CatalogClient) -> IndexResult<()> {
        let products = catalog.list_products().await?;
        let texts = products
            .iter()
            .map(Product::document_text)
            .collect::<Vec<_>>();

        let vectors = self.embedder.embed_batch(&texts).await?;
        let index = VectorIndex::build(self.embedder.dimension(), vectors, products)?;

        if let Err(err) = save_artifacts(&self.data_dir, &index) {
            tracing::warn!(
                target: "emporia.index",
                "failed to persist index artifacts: {err}"
            );
        }

        tracing::info!(
            target: "emporia.index",
            "vector index ready: {} products indexed",
            index.len()
        );
        self.install(index).await;
        Ok(())
    }

    /// Rank the whole catalog by similarity to `query`, then filter by
    /// minimum score, category and price before capping at `top_k`. Filtering
    /// first means a narrow category never starves the result list.
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        category: Option<&str>,
        max_price: Option<f64>,
        min_score: f32,
    ) -> IndexResult<Vec<Product>> {
        let Some(index) = self.index.read().await.clone() else {
            return Err(IndexError::NotInitialized);
        };
        if !index.is_ready() {
            return Err(IndexError::NotInitialized);
        }

        let query_vec = self.embedder.embed_one(query).await?;
        let ranked = index.search(&query_vec, index.len())?;

        if let Some((score, idx)) = ranked.first() {
            tracing::debug!(
                target: "emporia.index",
                "top hit for {query:?}: #{} score {score:.3}",
                index.products()[*idx].id
            );
        }

        let mut results = Vec::new();
        for (score, idx) in ranked {
            if score < min_score {
                // Ranked descending, nothing below will pass either.
                break;
            }
            let product = &index.products()[idx];
            if let Some(category) = category {
                if !product.category.eq_ignore_ascii_case(category) {
                    continue;
                }
            }
            if let Some(max_price) = max_price {
                if product.price > max_price {
                    continue;
                }
            }
            results.push(product.clone());
            if results.len() >= top_k {
                break;
            }
        }
        Ok(results)
    }

    /// Cached catalog with the same category/price predicates, in original
    /// catalog order. No ranking involved.
    pub async fn browse(
        &self,
        category: Option<&str>,
        max_price: Option<f64>,
    ) -> IndexResult<Vec<Product>> {
        let Some(index) = self.index.read().await.clone() else {
            return Err(IndexError::NotInitialized);
        };
        let products = index
            .products()
            .iter()
            .filter(|p| {
                category.is_none_or(|c| p.category.eq_ignore_ascii_case(c))
                    && max_price.is_none_or(|m| p.price <= m)
            })
            .cloned()
            .collect();
        Ok(products)
    }

    pub async fn product_by_id(&self, product_id: i64) -> Option<Product> {
        let index = self.index.read().await.clone()?;
        index
            .products()
            .iter()
            .find(|p| p.id == product_id)
            .cloned()
    }

    /// Distinct categories, sorted.
    pub async fn categories(&self) -> IndexResult<Vec<String>> {
        let Some(index) = self.index.read().await.clone() else {
            return Err(IndexError::NotInitialized);
        };
        let mut categories = index
            .products()
            .iter()
            .map(|p| p.category.clone())
            .collect::<Vec<_>>();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use emporia_types::Rating;

    /// Deterministic embedder: maps known phrases onto fixed unit axes so
    /// similarity scores are exact.
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
            } else if lowered.contains("drive") {
                Ok(axis(2))
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
                rate: 4.0,
                count: 5,
            },
        }
    }

    async fn ready_service(dir: &std::path::Path) -> SearchService {
        let service = SearchService::new(Arc::new(StubEmbedder), dir.to_path_buf());
        let products = vec![
            product(1, "Fjallraven Backpack", "men's clothing", 109.95),
            product(2, "Gold Ring", "jewelery", 168.0),
            product(3, "SSD Drive", "electronics", 64.0),
        ];
        let embedder = StubEmbedder;
        let texts = products
            .iter()
            .map(Product::document_text)
            .collect::<Vec<_>>();
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        let index = VectorIndex::build(4, vectors, products).unwrap();
        *service.index.write().await = Some(Arc::new(index));
        service
    }

    #[tokio::test]
    async fn semantic_search_respects_min_score_and_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let service = ready_service(dir.path()).await;

        let hits = service
            .semantic_search("a sturdy backpack", 5, None, None, DEFAULT_MIN_SCORE)
            .await
            .unwrap();
        // Only the backpack clears the 0.10 threshold; orthogonal products score 0.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[tokio::test]
    async fn semantic_search_filters_before_capping() {
        let dir = tempfile::tempdir().unwrap();
        let service = ready_service(dir.path()).await;

        // Category filter drops the top hit; price filter must still be able
        // to return the survivor even with top_k = 1.
        let hits = service
            .semantic_search("backpack", 1, Some("jewelery"), None, -1.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[tokio::test]
    async fn browse_filters_by_category_case_insensitively_in_catalog_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = ready_service(dir.path()).await;

        let hits = service.browse(Some("Electronics"), None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);

        let all = service.browse(None, Some(200.0)).await.unwrap();
        assert_eq!(all.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn categories_are_sorted_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let service = ready_service(dir.path()).await;
        let categories = service.categories().await.unwrap();
        assert_eq!(categories, vec!["electronics", "jewelery", "men's clothing"]);
    }

    #[tokio::test]
    async fn queries_on_uninitialized_service_fail_with_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let service = SearchService::new(Arc::new(StubEmbedder), dir.path().to_path_buf());
        assert!(!service.is_ready().await);
        let err = service
            .semantic_search("anything", 5, None, None, DEFAULT_MIN_SCORE)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotInitialized));
    }
}
