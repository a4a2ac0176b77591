//! brokerlink - command line front end for broker-link
//!
//! Publish a message, listen on topic filters, diagnose a broker that
//! refuses connections, or check a configuration file.

use broker_link::config::ClientConfig;
use broker_link::monitor::{format_message, OutputFormat};
use broker_link::observability::init_default_logging;
use broker_link::transport::mqtt::{
    qos_from_level, ConnectionState, HandlerResult, HealthMonitor, InboundMessage, MqttClient, QoS,
};
use broker_link::{diagnose, publish_once};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["brokerlink.toml", "config/brokerlink.toml"];

/// Resilient MQTT client
#[derive(Parser)]
#[command(name = "brokerlink")]
#[command(about = "Publish, listen and diagnose against an MQTT v3.1.1 broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Broker URL, used when no configuration file is found
    #[arg(long, value_name = "URL", env = "BROKERLINK_URL", global = true)]
    broker: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single message and exit
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        /// QoS level (0, 1 or 2); defaults to the configured default_qos
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
        #[arg(long)]
        retain: bool,
    },
    /// Print messages matching the given filters until interrupted
    Listen {
        /// Topic filter, may be given several times; `+` and `#` allowed
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: Option<u8>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        format: OutputFormat,
    },
    /// Attempt one connection and explain the broker's answer
    Diagnose {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
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

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(cli.config.as_deref(), cli.broker.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(&config, &topic, message, qos, retain).await,
        Commands::Listen {
            topics,
            qos,
            format,
        } => run_listen(&config, &topics, qos, format).await,
        Commands::Diagnose { json } => run_diagnose(&config, json).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&Path>,
    broker_url: Option<&str>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(path)?);
        }
    }

    match broker_url {
        Some(url) => {
            let config = ClientConfig::for_broker(url);
            config.validate()?;
            Ok(config)
        }
        None => Err(
            "no configuration file found; pass --config, --broker or create brokerlink.toml".into(),
        ),
    }
}

fn pick_qos(config: &ClientConfig, level: Option<u8>) -> QoS {
    level
        .or(Some(config.broker.default_qos))
        .and_then(qos_from_level)
        .unwrap_or(QoS::AtLeastOnce)
}

async fn run_publish(
    config: &ClientConfig,
    topic: &str,
    message: String,
    qos: Option<u8>,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = pick_qos(config, qos);
    publish_once(config.resolve()?, topic, message, qos, retain).await?;
    info!(topic, ?qos, retain, "Message published");
    Ok(())
}

async fn run_listen(
    config: &ClientConfig,
    topics: &[String],
    qos: Option<u8>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = pick_qos(config, qos);
    let client = MqttClient::new(config.resolve()?)?;

    for topic in topics {
        client.subscribe(topic, qos, move |message: &InboundMessage| -> HandlerResult {
            println!("{}", format_message(message, format));
            Ok(())
        })?;
    }

    match client.connect().await {
        Ok(()) => info!(client_id = client.client_id(), "Listening on {} filter(s)", topics.len()),
        Err(e) if e.is_transient() => {
            warn!("Initial connect did not complete ({}), still retrying in the background", e);
        }
        Err(e) => return Err(e.into()),
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut state_rx = client.state_changes();

    let outcome: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            Ok(())
        }
        terminal = wait_for_terminal_state(&mut state_rx) => {
            Err(format!("connection gave up: {terminal}").into())
        }
    };

    let stats = client.stats();
    let quality = HealthMonitor::assess(&stats);
    client.disconnect().await;
    info!(
        messages = stats.message_count,
        reconnects = stats.reconnect_count,
        ?quality,
        "Listener stopped"
    );
    outcome
}

/// Resolves once the client settles in a state it will not leave on its own
async fn wait_for_terminal_state(
    state_rx: &mut tokio::sync::watch::Receiver<ConnectionState>,
) -> ConnectionState {
    loop {
        let state = *state_rx.borrow_and_update();
        if matches!(state, ConnectionState::Error(_) | ConnectionState::Disconnected) {
            return state;
        }
        if state_rx.changed().await.is_err() {
            return ConnectionState::Disconnected;
        }
    }
}

async fn run_diagnose(config: &ClientConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.resolve()?;
    println!("Broker:   {}", connection.broker_address());
    println!("Client:   {}", connection.client_id);
    println!("TLS:      {}", connection.tls.is_some());
    if let Some(credentials) = &connection.credentials {
        println!("Username: {}", credentials.username);
    }

    let diagnosis = diagnose(connection).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&diagnosis)?);
    } else {
        println!("{diagnosis}");
    }

    if diagnosis.is_success() {
        Ok(())
    } else {
        Err(diagnosis.summary().into())
    }
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let resolved = config.resolve()?;
    info!(
        broker = %resolved.broker_address(),
        tls = resolved.tls.is_some(),
        "Configuration is valid"
    );

    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
        println!("# reconnect policy: {:?}", resolved.reconnect);
        match resolved.reconnect.total_backoff() {
            Some(total) => println!("# longest retry streak waits {:?} in total", total),
            None => println!("# retries are unlimited"),
        }
    }
    Ok(())
}
