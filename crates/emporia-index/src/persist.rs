use std::path::Path;

use emporia_types::Product;

use crate::vector::VectorIndex;
use crate::{IndexError, IndexResult};

const INDEX_FILE: &str = "index.bin";
const PRODUCTS_FILE: &str = "products.json";

const MAGIC: &[u8; 4] = b"EMPX";
const VERSION: u32 = 1;

/// Write the index blob and the product metadata record side by side so a
/// restart can skip re-embedding. Layout of `index.bin`: magic, version,
/// dimension, row count, then `count * dim` little-endian f32s.
pub fn save_artifacts(dir: &Path, index: &VectorIndex) -> IndexResult<()> {
    std::fs::create_dir_all(dir)?;

    let mut blob = Vec::with_capacity(16 + index.raw_matrix().len() * 4);
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&VERSION.to_le_bytes());
    blob.extend_from_slice(&(index.dim() as u32).to_le_bytes());
    blob.extend_from_slice(&(index.len() as u32).to_le_bytes());
    for value in index.raw_matrix() {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    std::fs::write(dir.join(INDEX_FILE), blob)?;

    let products = serde_json::to_vec_pretty(index.products())
        .map_err(|e| IndexError::Artifact(e.to_string()))?;
    std::fs::write(dir.join(PRODUCTS_FILE), products)?;

    tracing::info!(
        target: "emporia.index",
        "saved index artifacts: {} products, dim {}",
        index.len(),
        index.dim()
    );
    Ok(())
}

/// Load both artifacts. Any missing or unreadable piece is an error; the
/// caller falls back to a full rebuild.
pub fn load_artifacts(dir: &Path) -> IndexResult<VectorIndex> {
    let blob = std::fs::read(dir.join(INDEX_FILE))?;
    let products: Vec<Product> =
        serde_json::from_slice(&std::fs::read(dir.join(PRODUCTS_FILE))?)
            .map_err(|e| IndexError::Artifact(format!("products.json: {e}")))?;

    if blob.len() < 16 || &blob[0..4] != MAGIC {
        return Err(IndexError::Artifact("bad index blob header".to_string()));
    }
    let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
    if version != VERSION {
        return Err(IndexError::Artifact(format!(
            "unsupported index blob version {version}"
        )));
    }
    let dim = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]) as usize;
    let count = u32::from_le_bytes([blob[12], blob[13], blob[14], blob[15]]) as usize;

    let payload = &blob[16..];
    if payload.len() != count * dim * 4 {
        return Err(IndexError::Artifact(format!(
            "index blob payload is {} bytes, expected {}",
            payload.len(),
            count * dim * 4
        )));
    }

    let mut vectors = Vec::with_capacity(count);
    for row in payload.chunks_exact(dim * 4) {
        let vector = row
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<f32>>();
        vectors.push(vector);
    }

    let index = VectorIndex::build(dim, vectors, products)?;
    tracing::info!(
        target: "emporia.index",
        "loaded index artifacts: {} products, dim {}",
        index.len(),
        index.dim()
    );
    Ok(index)
}
