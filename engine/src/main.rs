use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use emporia_catalog::CatalogClient;
use emporia_core::{
    AgentLoop, AppConfig, CancellationRegistry, ConfigStore, EventBus, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use emporia_index::{
    OpenAiEmbedder, SearchService, DEFAULT_EMBEDDING_DIM, DEFAULT_EMBEDDING_MODEL,
};
use emporia_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use emporia_providers::ProviderRegistry;
use emporia_server::{serve, AppState};
use emporia_store::Store;
use emporia_tools::{ToolRegistry, ToolServices};
use emporia_types::{ChatRequest, TurnEvent};

const SUPPORTED_PROVIDER_IDS: [&str; 4] = ["openai", "openrouter", "groq", "ollama"];

const DEFAULT_EMBEDDING_URL: &str = "https://api.openai.com/v1";

#[derive(Parser, Debug)]
#[command(name = "emporia-engine")]
#[command(about = "Headless Emporia shopping assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service.
    Serve {
        #[arg(long, default_value = DEFAULT_ENGINE_HOST)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Rebuild the vector index from the live catalog and exit.
    Reindex {
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Answer a single prompt on stdout, no server.
    Ask {
        prompt: String,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            state_dir,
            api_key,
            provider,
            model,
            config,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            info!("engine logging initialized: {:?}", log_info);

            let state = build_runtime(
                ProcessKind::Engine,
                &state_dir,
                overrides,
                config.map(PathBuf::from),
            )
            .await?;
            serve(state, &host, port).await?;
        }
        Command::Reindex { state_dir, config } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _) = init_process_logging(ProcessKind::Indexer, &logs_dir, 14)?;

            let config = load_config(&state_dir, None, config.map(PathBuf::from)).await?;
            let catalog = CatalogClient::new(config.catalog_url());
            let search = build_search_service(&config, &state_dir);

            let started = Instant::now();
            startup_phase(ProcessKind::Indexer, "index.rebuild", "running", None);
            search.rebuild(&catalog).await?;
            let detail = format!("rebuilt in {}ms", started.elapsed().as_millis());
            startup_phase(ProcessKind::Indexer, "index.rebuild", "ok", Some(&detail));
            println!("index rebuilt under {}", state_dir.join("index").display());
        }
        Command::Ask {
            prompt,
            state_dir,
            api_key,
            provider,
            model,
            config,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;

            let state = build_runtime(
                ProcessKind::Engine,
                &state_dir,
                overrides,
                config.map(PathBuf::from),
            )
            .await?;

            let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
            let request = ChatRequest {
                message: prompt,
                conversation_id: None,
                user_id: None,
            };
            let agent = state.agent.clone();
            let turn = tokio::spawn(async move { agent.run_turn(request, tx).await });
            while let Some(event) = rx.recv().await {
                if let TurnEvent::Token { content } = event {
                    print!("{content}");
                }
            }
            println!();
            turn.await??;
        }
    }

    Ok(())
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();
    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // api_key/model overrides target the chosen provider, or openai when
    // none was named.
    let target_provider = provider.as_deref().unwrap_or("openai");
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("EMPORIA_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".emporia")
}

async fn load_config(
    state_dir: &std::path::Path,
    overrides: Option<serde_json::Value>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<AppConfig> {
    let path = config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let store = ConfigStore::load(path, overrides).await?;
    Ok(store.get().await)
}

fn build_search_service(config: &AppConfig, state_dir: &std::path::Path) -> SearchService {
    let embedding = &config.embedding;
    let api_key = embedding
        .api_key
        .clone()
        .or_else(|| {
            config
                .providers
                .get("openai")
                .and_then(|p| p.api_key.clone())
        })
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty());
    let embedder = OpenAiEmbedder::new(
        embedding
            .url
            .as_deref()
            .unwrap_or(DEFAULT_EMBEDDING_URL),
        api_key,
        embedding
            .model
            .as_deref()
            .unwrap_or(DEFAULT_EMBEDDING_MODEL),
        embedding.dimension.unwrap_or(DEFAULT_EMBEDDING_DIM),
    );
    SearchService::new(Arc::new(embedder), state_dir.join("index"))
}

async fn build_runtime(
    process: ProcessKind,
    state_dir: &std::path::Path,
    overrides: Option<serde_json::Value>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<AppState> {
    let init_started = Instant::now();

    startup_phase(process, "engine.startup.phase", "running", Some("config"));
    let config = load_config(state_dir, overrides, config_path).await?;

    startup_phase(process, "engine.startup.phase", "running", Some("store"));
    let store = Arc::new(Store::open(&state_dir.join("emporia.db")).await?);

    startup_phase(process, "engine.startup.phase", "running", Some("index"));
    let catalog = Arc::new(CatalogClient::new(config.catalog_url()));
    let search = Arc::new(build_search_service(&config, state_dir));
    if let Err(err) = search.initialize(&catalog).await {
        // Degraded mode: search_products falls back to keyword matching
        // against the live catalog until a reindex succeeds.
        let detail = format!("{err}");
        emit_event(
            tracing::Level::WARN,
            process,
            ObservabilityEvent {
                event: "index.build.failed",
                component: "engine.main",
                conversation_id: None,
                turn_id: None,
                tool: None,
                provider_id: None,
                model_id: None,
                status: Some("degraded"),
                error_code: Some("INDEX_UNAVAILABLE"),
                detail: Some(&detail),
            },
        );
        tracing::warn!("vector index unavailable, keyword fallback active: {err}");
    }

    startup_phase(process, "engine.startup.phase", "running", Some("providers"));
    let providers = ProviderRegistry::new(config.providers_config());
    info!("configured providers: {}", providers.list_ids().join(", "));

    let services = Arc::new(ToolServices {
        search: search.clone(),
        store: store.clone(),
        catalog,
    });
    let tools = ToolRegistry::new(services);
    let event_bus = EventBus::new();
    let cancellations = CancellationRegistry::new();
    let agent = Arc::new(AgentLoop::new(
        providers,
        tools,
        store.clone(),
        event_bus.clone(),
        cancellations.clone(),
        None,
        None,
    ));

    let detail = format!("ready in {}ms", init_started.elapsed().as_millis());
    startup_phase(process, "engine.startup.completed", "ok", Some(&detail));
    info!("runtime {detail}, state dir {}", state_dir.display());

    Ok(AppState {
        agent,
        store,
        search,
        event_bus,
        cancellations,
    })
}

fn startup_phase(process: ProcessKind, event: &str, status: &str, detail: Option<&str>) {
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event,
            component: "engine.main",
            conversation_id: None,
            turn_id: None,
            tool: None,
            provider_id: None,
            model_id: None,
            status: Some(status),
            error_code: None,
            detail,
        },
    );
}
