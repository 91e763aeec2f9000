use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use typerace_execution::{Catalog, MemoryStore, Store};
use typerace_server::{Api, Server, ServerConfig, SqliteStore};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "typerace-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("typerace-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Path to the SQLite database (accounts are kept in memory when omitted).
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// YAML article catalog (built-in articles are used when omitted).
    #[arg(long)]
    articles_path: Option<PathBuf>,

    /// Directory profile images are written to and served from.
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Entry fee for high-stakes rooms (must be > 0).
    #[arg(long)]
    entry_fee: Option<i64>,

    /// Balance granted to newly registered accounts.
    #[arg(long)]
    starting_balance: Option<i64>,

    /// Countdown between all players readying up and the match starting (must be > 0).
    #[arg(long)]
    countdown_ms: Option<u64>,

    /// Number of recent results kept for the leaderboard (0 uses default).
    #[arg(long)]
    leaderboard_cache: Option<usize>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Max queued WebSocket outbound messages per connection (0 uses default).
    #[arg(long)]
    ws_outbound_buffer: Option<usize>,

    /// Max concurrent WebSocket connections (0 disables limit).
    #[arg(long)]
    ws_max_connections: Option<usize>,

    /// Max concurrent WebSocket connections per IP (0 disables limit).
    #[arg(long)]
    ws_max_connections_per_ip: Option<usize>,

    /// Max WebSocket message size in bytes (0 uses default).
    #[arg(long)]
    ws_max_message_bytes: Option<usize>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

/// Maps an optional arg value keeping default on 0: 0 => default, Some(v) => Some(v), None => default
fn map_optional_default_on_zero<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => default,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();
    if let Some(fee) = args.entry_fee {
        if fee <= 0 {
            anyhow::bail!("entry_fee must be > 0");
        }
    }
    if let Some(0) = args.countdown_ms {
        anyhow::bail!("countdown_ms must be > 0");
    }
    if let Some(balance) = args.starting_balance {
        if balance < 0 {
            anyhow::bail!("starting_balance must be >= 0");
        }
    }

    Ok(ServerConfig {
        database_path: args.database_path.clone(),
        articles_path: args.articles_path.clone(),
        upload_dir: args.upload_dir.clone().or(defaults.upload_dir),
        entry_fee: args.entry_fee.or(defaults.entry_fee),
        starting_balance: args.starting_balance.or(defaults.starting_balance),
        countdown_ms: args.countdown_ms.or(defaults.countdown_ms),
        leaderboard_cache: map_optional_default_on_zero(args.leaderboard_cache, defaults.leaderboard_cache),
        http_rate_limit_per_second: map_optional_limit(args.http_rate_limit_per_second, defaults.http_rate_limit_per_second),
        http_rate_limit_burst: map_optional_limit(args.http_rate_limit_burst, defaults.http_rate_limit_burst),
        http_body_limit_bytes: map_optional_limit(args.http_body_limit_bytes, defaults.http_body_limit_bytes),
        ws_outbound_buffer: map_optional_default_on_zero(args.ws_outbound_buffer, defaults.ws_outbound_buffer),
        ws_max_connections: map_optional_limit(args.ws_max_connections, defaults.ws_max_connections),
        ws_max_connections_per_ip: map_optional_limit(args.ws_max_connections_per_ip, defaults.ws_max_connections_per_ip),
        ws_max_message_bytes: map_optional_default_on_zero(args.ws_max_message_bytes, defaults.ws_max_message_bytes),
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("ALLOWED_WS_ORIGINS")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;
    require_positive_u64("RATE_LIMIT_WS_CONNECTIONS")?;
    require_positive_u64("RATE_LIMIT_WS_CONNECTIONS_PER_IP")?;

    Ok(())
}

fn open_store(config: &ServerConfig) -> Result<Arc<dyn Store>> {
    let catalog = match &config.articles_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::default(),
    };

    match &config.database_path {
        Some(path) => {
            let store = SqliteStore::open(path, config.starting_balance())?;
            let articles = store
                .sync_articles(&catalog, config.articles_path.is_some())
                .context("load article catalog")?;
            info!(path = %path.display(), articles, "SQLite store opened");
            Ok(Arc::new(store))
        }
        None => {
            info!(articles = catalog.len(), "no database configured; accounts are kept in memory");
            Ok(Arc::new(MemoryStore::new(catalog, config.starting_balance())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    ensure_production_env()?;

    let config = build_config(&args)?;
    let store = open_store(&config)?;
    tokio::fs::create_dir_all(config.upload_dir())
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir().display()))?;

    let server = Arc::new(Server::new(config, store));
    let api = Api::new(server);
    let app = api.router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
