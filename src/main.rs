//! Chatpipe - Main Entry Point

use chatpipe::auth::{AuthClient, CachedAuthClient, HttpAuthClient};
use chatpipe::bus::{MemoryBus, MessageBus, MqttBus};
use chatpipe::cache::{Cache, MemoryCache};
use chatpipe::config::{BusKind, PipelineConfig};
use chatpipe::gateway::Gateway;
use chatpipe::llm::{CompletionProvider, OpenAiConfig, OpenAiProvider};
use chatpipe::observability::init_default_logging;
use chatpipe::pipeline::Pipeline;
use chatpipe::sessions::SessionRegistry;
use chatpipe::stages::{DeliveryStage, FormattingStage, IngestionService, UnderstandingStage};
use chatpipe::store::{MemoryStore, MessageStore};
use chatpipe::transport::{ChatTransport, TelegramTransport};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Staged chat-message pipeline
#[derive(Parser)]
#[command(name = "chatpipe")]
#[command(about = "Bus-connected chat message pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("Starting chatpipe v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_pipeline(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(PipelineConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["chatpipe.toml", "config/chatpipe.toml"];
            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(PipelineConfig::load_from_file(&path)?);
                }
            }
            Err("No configuration file found. Provide one with -c/--config or create chatpipe.toml".into())
        }
    }
}

async fn run_pipeline(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Pipeline starting with ID: {}", config.pipeline.id);

    let (bus, mqtt_bus): (Arc<dyn MessageBus>, Option<Arc<MqttBus>>) =
        match config.pipeline.bus {
            BusKind::Memory => (
                Arc::new(MemoryBus::new(config.pipeline.max_redeliveries)),
                None,
            ),
            BusKind::Mqtt => {
                let mqtt_config = config
                    .mqtt
                    .as_ref()
                    .ok_or("bus = \"mqtt\" requires an [mqtt] section")?;
                let mqtt = Arc::new(MqttBus::connect(&config.pipeline.id, mqtt_config).await?);
                (mqtt.clone(), Some(mqtt))
            }
        };

    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
    let sessions = Arc::new(SessionRegistry::new());

    let provider = create_provider(&config)?;
    let transport = create_transport(&config)?;
    let auth = create_auth_client(&config, cache.clone())?;

    let pipeline = Pipeline::new(bus.clone())
        .with_stage(Arc::new(UnderstandingStage::new(
            bus.clone(),
            cache,
            provider,
            Duration::from_secs(config.pipeline.nlu_cache_ttl_secs),
            Duration::from_secs(config.pipeline.completion_timeout_secs),
        )))
        .with_stage(Arc::new(FormattingStage::new(bus.clone(), store.clone())))
        .with_stage(Arc::new(DeliveryStage::new(sessions.clone(), transport)));
    pipeline.start().await?;

    let ingestion = Arc::new(IngestionService::new(bus, store, sessions));
    let gateway = Arc::new(Gateway::new(
        config.pipeline.id.clone(),
        config.http.port,
        ingestion,
        auth,
        config
            .auth
            .as_ref()
            .map(|a| a.send_permission.clone())
            .unwrap_or_else(|| "send_message".to_string()),
    ));
    tokio::spawn(gateway.run());

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Pipeline is running");
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    pipeline.shutdown().await;
    if let Some(mqtt) = mqtt_bus {
        mqtt.shutdown().await;
    }
    Ok(())
}

fn create_provider(
    config: &PipelineConfig,
) -> Result<Arc<dyn CompletionProvider>, Box<dyn std::error::Error>> {
    match config.llm.provider.as_str() {
        "openai" => {
            let api_key = config.llm_api_key()?;
            let mut openai_config = OpenAiConfig {
                api_key,
                model: config.llm.model.clone(),
                system_prompt: config.llm.system_prompt.clone(),
                ..Default::default()
            };
            if let Some(base_url) = &config.llm.base_url {
                openai_config.base_url = base_url.clone();
            }
            Ok(Arc::new(OpenAiProvider::new(openai_config)?))
        }
        provider => Err(format!("Unsupported completion provider: {provider}").into()),
    }
}

fn create_transport(
    config: &PipelineConfig,
) -> Result<Arc<dyn ChatTransport>, Box<dyn std::error::Error>> {
    let token = config
        .telegram_bot_token()?
        .ok_or("delivery requires a [telegram] section")?;
    Ok(Arc::new(TelegramTransport::new(
        token,
        Duration::from_secs(10),
    )?))
}

fn create_auth_client(
    config: &PipelineConfig,
    cache: Arc<dyn Cache>,
) -> Result<Option<Arc<dyn AuthClient>>, Box<dyn std::error::Error>> {
    let Some(auth) = &config.auth else {
        return Ok(None);
    };
    let http = Arc::new(HttpAuthClient::new(
        auth.base_url.clone(),
        Duration::from_secs(5),
    )?);
    Ok(Some(Arc::new(CachedAuthClient::new(
        http,
        cache,
        Duration::from_secs(config.pipeline.auth_cache_ttl_secs),
    ))))
}

fn handle_config_command(
    config: PipelineConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}
