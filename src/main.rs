use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use conduit::{
    ContentEntry, Dispatcher, RequestDescriptor,
    adapters::{HttpConnector, HttpJsonProviderFactory},
    config::{GatewayConfigValidator, loader::load_config_unchecked},
    metrics, tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "conduit.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "conduit.yaml")]
        config: String,
    },
    /// Dispatch one request through the full pipeline and print the result
    Probe {
        /// Configuration file to use
        #[clap(short, long, default_value = "conduit.yaml")]
        config: String,
        /// Target model name, used for prefix routing
        #[clap(short, long)]
        model: String,
        /// Explicit provider id, bypassing prefix routing
        #[clap(short, long)]
        provider: Option<String>,
        /// Capability tag of the request
        #[clap(long, default_value = "chat")]
        capability: String,
        /// Prompt sent as a single user message
        #[clap(long, default_value = "ping")]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
        Commands::Probe {
            config,
            model,
            provider,
            capability,
            prompt,
        } => probe_command(&config, model, provider, capability, prompt).await,
    }
}

/// Validate a configuration file and print a short summary
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config_unchecked(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!(
                "   • Pool: {} per destination, {} total",
                config.pool.max_connections_per_destination, config.pool.max_total_connections
            );
            println!(
                "   • Retry: {} attempts, {}ms initial delay",
                config.retry.max_attempts, config.retry.initial_delay_ms
            );
            println!(
                "   • Circuit breaker: {} failures within {}ms",
                config.circuit_breaker.failure_threshold, config.circuit_breaker.failure_window_ms
            );
            println!("   • Providers: {}", config.providers.len());
            for (id, provider) in &config.providers {
                println!(
                    "     - {id}: {} (prefixes: {:?}, enabled: {})",
                    provider.destination, provider.model_prefixes, provider.enabled
                );
            }
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure provider destinations start with http:// or https://");
            println!("   • Keep max_connections_per_destination <= max_total_connections");
            println!("   • Keep jitter_factor between 0 and 1");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Conduit configuration

pool:
  max_connections_per_destination: 10
  max_total_connections: 100
  keep_alive_ms: 30000
  max_idle_ms: 60000
  compression: true
  connect_timeout_ms: 10000

retry:
  max_attempts: 3
  initial_delay_ms: 1000
  max_delay_ms: 30000
  backoff_multiplier: 2.0
  jitter_factor: 0.1
  retry_on_network_error: true
  retry_on_timeout: true
  retry_on_server_error: true
  retry_on_rate_limit: true

circuit_breaker:
  failure_threshold: 5
  recovery_timeout_ms: 60000
  half_open_request_percent: 50.0
  success_threshold: 3
  failure_window_ms: 60000

coordinator:
  in_flight_ttl_ms: 300000
  sweep_interval_ms: 120000
  metrics_history_limit: 1000

providers:
  local:
    destination: "http://localhost:8080"
    path: "/v1/dispatch"
    model_prefixes: ["local-"]
    capabilities: ["chat"]
    settings:
      timeout_ms: 30000
"#;

    tokio::fs::write(path, default_config)
        .await
        .wrap_err_with(|| format!("Failed to write config file {config_path}"))?;

    println!("✅ Created new configuration file: {config_path}");
    println!("💡 Edit the file to point providers at your dependencies");
    println!("🔍 Validate with: conduit validate --config {config_path}");
    Ok(())
}

/// Build a dispatcher from configuration and run one request through it
async fn probe_command(
    config_path: &str,
    model: String,
    provider: Option<String>,
    capability: String,
    prompt: String,
) -> Result<()> {
    tracing_setup::init_console_tracing()?;
    metrics::init_metrics()?;

    let config = conduit::config::load_config(config_path).await?;
    let dispatcher = Dispatcher::new(config.clone(), Arc::new(HttpConnector::new()));
    for id in config.providers.keys() {
        dispatcher
            .registry()
            .register_constructor(id, HttpJsonProviderFactory, Vec::<String>::new())
            .await;
    }

    let report = dispatcher.start().await;
    if !report.is_fully_healthy() {
        tracing::warn!(
            unhealthy = ?report.unhealthy,
            failed = ?report.failed,
            "Some providers did not initialize"
        );
    }

    let mut request =
        RequestDescriptor::new(model, capability).with_content(ContentEntry::text("user", prompt));
    if let Some(provider) = provider {
        request = request.with_dependency(provider);
    }

    let outcome = dispatcher.dispatch(request).await;
    let stats = dispatcher.stats().await;
    dispatcher.shutdown().await;

    let response = outcome.map_err(|e| eyre!("Dispatch failed: {e}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).wrap_err("Failed to encode response")?
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).wrap_err("Failed to encode stats")?
    );
    Ok(())
}
