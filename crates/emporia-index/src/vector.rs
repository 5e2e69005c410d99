use emporia_types::Product;

use crate::{IndexError, IndexResult};

/// Exact inner-product index over L2-normalized product vectors.
///
/// Row `i` of the matrix always corresponds to `products[i]`; `build` either
/// produces a complete index or fails, so a half-built state is never
/// observable. The catalog is small (tens of items), so an exhaustive scan
/// beats any approximate structure here.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dim: usize,
    // Row-major [count * dim] matrix; flat storage keeps the scan cache-friendly.
    matrix: Vec<f32>,
    products: Vec<Product>,
}

impl VectorIndex {
    pub fn build(
        dim: usize,
        vectors: Vec<Vec<f32>>,
        products: Vec<Product>,
    ) -> IndexResult<Self> {
        if vectors.len() != products.len() {
            return Err(IndexError::CountMismatch {
                vectors: vectors.len(),
                products: products.len(),
            });
        }
        let mut matrix = Vec::with_capacity(vectors.len() * dim);
        for vector in &vectors {
            if vector.len() != dim {
                return Err(IndexError::DimensionMismatch {
                    expected: dim,
                    got: vector.len(),
                });
            }
            let mut row = vector.clone();
            l2_normalize(&mut row);
            matrix.extend_from_slice(&row);
        }
        Ok(Self {
            dim,
            matrix,
            products,
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.products.is_empty()
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub(crate) fn raw_matrix(&self) -> &[f32] {
        &self.matrix
    }

    /// Returns up to `k` entries as `(score, position)` in descending score
    /// order. Scores are cosine similarities since rows and the query are
    /// both normalized. Ties keep index order (stable).
    pub fn search(&self, query: &[f32], k: usize) -> IndexResult<Vec<(f32, usize)>> {
        if self.products.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }

        let mut normalized = query.to_vec();
        l2_normalize(&mut normalized);

        let mut scored = self
            .matrix
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(idx, row)| {
                let score = row
                    .iter()
                    .zip(normalized.iter())
                    .map(|(a, b)| a * b)
                    .sum::<f32>();
                (score, idx)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
