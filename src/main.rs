use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod app_metrics;
mod config;
mod depth_output;
mod echo_reader;
mod reader;
mod settings;
mod telemetry;
mod web;

use config::Config;
use depth_output::signalk::AccessToken;
use depth_output::transport::NetworkConnector;
use depth_output::{OutputContext, OutputManager};
use echo_reader::EchoReader;
use reader::TransportReaderFactory;
use settings::SettingsStore;
use telemetry::EchoTelemetry;

const DEFAULT_CONFIG_PATH: &str = "config.json";
/// Telemetry records buffered per browser before it starts missing pings
const TELEMETRY_CAPACITY: usize = 16;

// ========== Logging Setup ==========

fn init_logging(log_config: &config::LogConfig) -> Result<(), Box<dyn Error>> {
    use tracing_appender::rolling;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    std::fs::create_dir_all(&log_config.directory)?;

    let file_appender = rolling::daily(&log_config.directory, &log_config.file_prefix);

    let timer = || {
        fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| {
            fmt::time::OffsetTime::new(time::UtcOffset::UTC, time::format_description::well_known::Rfc3339)
        })
    };

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(timer());

    let console_layer = fmt::layer().with_writer(std::io::stdout).with_timer(timer());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

fn print_help() {
    println!("Echo Router - sonar depth sounder bridge");
    println!();
    println!("USAGE:");
    println!("    echo_router [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>                      Configuration file (default: {})", DEFAULT_CONFIG_PATH);
    println!("    --validate-config, --validate, -v    Validate configuration and exit");
    println!("    --help, -h                           Show this help message");
}

fn config_path(args: &[String]) -> PathBuf {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn print_summary(config: &Config) {
    println!("  Web server: {} (port {})", if config.web.enabled { "enabled" } else { "disabled" }, config.web.port);
    match &config.echo {
        Some(echo) => {
            println!("  Connection: {:?}", echo.connection_type);
            println!("  Samples per ping: {}, byte order: {:?}", echo.num_samples, echo.byte_order);
            println!("  Outputs: {:?}", echo.output_methods());
        }
        None => println!("  No sonar settings yet, the reader will stay idle"),
    }
}

// ========== Main Application ==========

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        std::process::exit(0);
    }

    let validate_only = args
        .iter()
        .any(|a| a == "--validate-config" || a == "--validate" || a == "-v");
    let path = config_path(&args);

    let config = match Config::from_file(&path) {
        Ok(cfg) => {
            if validate_only {
                println!("✓ Configuration validation successful");
                print_summary(&cfg);
                std::process::exit(0);
            }
            cfg
        }
        Err(e) => {
            if validate_only {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            eprintln!("Warning: Could not load {}: {}", path.display(), e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    init_logging(&config.logging)?;
    info!("Echo Router starting...");
    info!("Loaded configuration from {}", path.display());

    let web_config = config.web.clone();
    let settings = Arc::new(SettingsStore::new(config, Some(path)));
    let (telemetry_tx, _) = broadcast::channel::<Arc<EchoTelemetry>>(TELEMETRY_CAPACITY);
    let (depth_tx, depth_rx) = watch::channel::<Option<f64>>(None);
    let cancel = CancellationToken::new();

    let reader = EchoReader::new(
        settings.subscribe(),
        Arc::new(TransportReaderFactory),
        Arc::new(telemetry_tx.clone()),
        Arc::new(depth_tx),
    );
    let reader_state = reader.subscribe_state();
    let reader_task = tokio::spawn(reader.run(cancel.clone()));

    let initial_token = settings.current().and_then(|c| c.signalk_token.clone());
    let token_store = Arc::clone(&settings);
    let outputs = OutputManager::new(OutputContext {
        connector: Arc::new(NetworkConnector::new()),
        token: Arc::new(AccessToken::new(initial_token, move |token| token_store.persist_token(token))),
    });
    let output_task = tokio::spawn(outputs.run(settings.subscribe(), depth_rx, cancel.clone()));

    let web_task = if web_config.enabled {
        let state = web::AppState {
            settings: Arc::clone(&settings),
            telemetry: telemetry_tx,
            reader_state,
        };
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_web_server(state, web_config.port, cancel).await {
                error!("Web server stopped: {}", e);
            }
        }))
    } else {
        info!("Web server disabled in configuration");
        None
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
    cancel.cancel();

    if let Err(e) = reader_task.await {
        warn!("Reader task ended abnormally: {}", e);
    }
    if let Err(e) = output_task.await {
        warn!("Output task ended abnormally: {}", e);
    }
    if let Some(task) = web_task
        && let Err(e) = task.await
    {
        warn!("Web task ended abnormally: {}", e);
    }

    info!("Echo Router stopped");
    Ok(())
}
