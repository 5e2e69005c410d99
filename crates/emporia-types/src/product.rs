use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub rate: f64,
    pub count: u64,
}

/// Immutable catalog entry. Created on index build, replaced wholesale on
/// reindex, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub title: String,
    pub price: f64,
    pub description: String,
    pub category: String,
    pub image: String,
    pub rating: Rating,
}

impl Product {
    /// Text fed to the embedder for this product.
    pub fn document_text(&self) -> String {
        format!(
            "{}. {}. Category: {}",
            self.title, self.description, self.category
        )
    }
}

/// Abbreviated product shape returned by the search tool and rendered as a
/// product card by the frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCard {
    pub id: i64,
    pub title: String,
    pub price: f64,
    pub category: String,
    pub image: String,
    pub rating: String,
}

impl From<&Product> for ProductCard {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id,
            title: product.title.clone(),
            price: product.price,
            category: product.category.clone(),
            image: product.image.clone(),
            rating: format!(
                "{:.1} ({} reviews)",
                product.rating.rate, product.rating.count
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Product {
        Product {
            id: 1,
            title: "Fjallraven Backpack".to_string(),
            price: 109.95,
            description: "Fits 15 inch laptops".to_string(),
            category: "men's clothing".to_string(),
            image: "https://example.com/1.jpg".to_string(),
            rating: Rating {
                rate: 3.9,
                count: 120,
            },
        }
    }

    #[test]
    fn document_text_includes_title_description_and_category() {
        let text = sample().document_text();
        assert_eq!(
            text,
            "Fjallraven Backpack. Fits 15 inch laptops. Category: men's clothing"
        );
    }

    #[test]
    fn card_formats_rating_string() {
        let card = ProductCard::from(&sample());
        assert_eq!(card.rating, "3.9 (120 reviews)");
        assert_eq!(card.id, 1);
    }

    #[test]
    fn card_keeps_one_decimal_for_whole_number_rates() {
        let mut product = sample();
        product.rating.rate = 4.0;
        let card = ProductCard::from(&product);
        assert_eq!(card.rating, "4.0 (120 reviews)");
    }
}
