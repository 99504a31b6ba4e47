use anyhow::Context;
use clap::{Parser, Subcommand};
use homeops_core::audit::AUDIT_TARGET;
use homeops_core::{
    AppConfig, ConversationStore, Deduper, Outbound, Router, RouterDeps, ServiceProvider,
    TemplateCardSender,
};
use homeops_server::{shutdown_signal, Gateway, GatewayConfig};
use homeops_wecom::{EnvelopeCodec, WeComClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "homeops")]
#[command(version = VERSION)]
#[command(about = "WeCom callback service for home operations")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml)
    #[arg(short, long, global = true, env = "HOMEOPS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the callback gateway (default)
    Serve,
    /// Publish the default application menu and exit
    SyncMenu,
}

/// Stdout gets everything except audit records. Audit records go to a
/// daily-rolled `audit.jsonl` when `log.audit_dir` is set.
fn init_logging(cfg: &AppConfig) -> Option<WorkerGuard> {
    let (audit_layer, guard) = match &cfg.log.audit_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "audit.jsonl"));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_level(false)
                .without_time() // timestamp is inside the record
                .with_filter(
                    tracing_subscriber::filter::Targets::new().with_target(AUDIT_TARGET, Level::INFO),
                );
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != AUDIT_TARGET
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(audit_layer)
        .init();

    guard
}

/// Everything the router needs, shared by both subcommands.
struct Runtime {
    store: Arc<ConversationStore>,
    router: Arc<Router>,
}

fn build_runtime(cfg: &AppConfig, providers: Vec<Arc<dyn ServiceProvider>>) -> anyhow::Result<Runtime> {
    let client = Arc::new(
        WeComClient::new(cfg.client_config()).context("failed to build WeCom HTTP client")?,
    );
    let store = Arc::new(ConversationStore::new(cfg.state_ttl()));
    let sender = Arc::new(TemplateCardSender::new(client.clone(), store.clone(), cfg.card_mode()));
    let outbound = Outbound::new(sender)
        .with_raw_sender(client.clone())
        .with_card_updater(client.clone())
        .with_menu_publisher(client);

    let router = Arc::new(Router::new(RouterDeps {
        outbound,
        store: store.clone(),
        allowed_user_ids: cfg.allowed_user_ids(),
        providers,
    }));

    Ok(Runtime { store, router })
}

async fn run_serve(cfg: &AppConfig, runtime: Runtime) -> anyhow::Result<()> {
    let codec = EnvelopeCodec::new(
        cfg.wecom.token.clone(),
        &cfg.wecom.encoding_aes_key,
        cfg.wecom.corp_id.clone(),
    )
    .context("invalid callback credentials")?;
    let deduper = Arc::new(Deduper::new(cfg.dedupe_ttl()));

    let gateway = Gateway::new(
        GatewayConfig {
            listen_addr: cfg.server.listen_addr.clone(),
            max_body_bytes: cfg.server.max_body_bytes,
        },
        codec,
        deduper.clone(),
        runtime.router.clone(),
    );

    let result = gateway.serve(shutdown_signal()).await;

    runtime.store.close();
    deduper.close();
    info!("Background sweeps stopped");
    result
}

async fn run_sync_menu(runtime: Runtime) -> anyhow::Result<()> {
    runtime
        .router
        .publish_menu()
        .await
        .context("failed to publish application menu")?;
    info!("Application menu published");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _audit_guard = init_logging(&cfg);
    info!("homeops {} starting: {}", VERSION, cfg.summary());

    // Backend integrations register here; the built-in commands work without any.
    let providers: Vec<Arc<dyn ServiceProvider>> = Vec::new();
    if providers.is_empty() {
        warn!("No service providers registered; only built-in commands are available");
    }
    let runtime = build_runtime(&cfg, providers)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(&cfg, runtime).await,
        Commands::SyncMenu => run_sync_menu(runtime).await,
    }
}
