use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use emporia_providers::{ProviderConfig, ProvidersConfig};

pub const DEFAULT_CATALOG_URL: &str = "https://fakestoreapi.com";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
        }
    }

    pub fn catalog_url(&self) -> &str {
        self.catalog
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_CATALOG_URL)
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: the config file on disk, then environment
/// variables, then CLI overrides, later layers winning key by key.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn load(
        path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path).await.unwrap_or_else(|_| empty_object());
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        serde_json::from_value(self.effective_value().await).unwrap_or_default()
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Persist the file layer back to disk. Env and CLI layers are never
    /// written, so secrets passed at launch stay out of the file.
    pub async fn save(&self) -> anyhow::Result<()> {
        let file = self.layers.read().await.file.clone();
        let rendered = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, rendered).await?;
        Ok(())
    }

    pub async fn set_file_value(&self, pointer: &str, value: Value) {
        let mut layers = self.layers.write().await;
        set_by_pointer(&mut layers.file, pointer, value);
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn env_layer() -> Value {
    let mut layer = empty_object();
    if let Ok(url) = std::env::var("EMPORIA_CATALOG_URL") {
        if !url.trim().is_empty() {
            set_by_pointer(&mut layer, "/catalog/base_url", json!(url));
        }
    }
    if let Ok(url) = std::env::var("EMPORIA_EMBEDDING_URL") {
        if !url.trim().is_empty() {
            set_by_pointer(&mut layer, "/embedding/url", json!(url));
        }
    }
    if let Ok(provider) = std::env::var("EMPORIA_DEFAULT_PROVIDER") {
        if !provider.trim().is_empty() {
            set_by_pointer(&mut layer, "/default_provider", json!(provider));
        }
    }
    layer
}

fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

fn set_by_pointer(target: &mut Value, pointer: &str, value: Value) {
    let mut current = target;
    let segments = pointer
        .trim_start_matches('/')
        .split('/')
        .collect::<Vec<_>>();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = empty_object();
        }
        let Value::Object(map) = current else {
            return;
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(empty_object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json"), None)
            .await
            .unwrap();
        let config = store.get().await;
        assert!(config.providers.is_empty());
        assert_eq!(config.catalog_url(), DEFAULT_CATALOG_URL);
    }

    #[tokio::test]
    async fn cli_layer_overrides_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{"default_provider":"openai","catalog":{"base_url":"http://file.example"}}"#,
        )
        .await
        .unwrap();

        let store = ConfigStore::load(&path, Some(json!({"default_provider":"groq"})))
            .await
            .unwrap();
        let config = store.get().await;
        assert_eq!(config.default_provider.as_deref(), Some("groq"));
        assert_eq!(config.catalog_url(), "http://file.example");
    }

    #[tokio::test]
    async fn deep_merge_preserves_sibling_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{"providers":{"openai":{"api_key":"sk-file","default_model":"gpt-4o-mini"}}}"#,
        )
        .await
        .unwrap();

        let overrides = json!({"providers":{"openai":{"api_key":"sk-cli"}}});
        let store = ConfigStore::load(&path, Some(overrides)).await.unwrap();
        let config = store.get().await;
        let openai = config.providers.get("openai").unwrap();
        assert_eq!(openai.api_key.as_deref(), Some("sk-cli"));
        assert_eq!(openai.default_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn save_writes_only_the_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path, Some(json!({"default_provider":"groq"})))
            .await
            .unwrap();
        store
            .set_file_value("/catalog/base_url", json!("http://saved.example"))
            .await;
        store.save().await.unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["catalog"]["base_url"], "http://saved.example");
        assert!(written.get("default_provider").is_none());
    }
}
