/*!
 * kvconnect CLI - Command Line Interface
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use clap::{Parser, Subcommand, ValueEnum};
use kvconnect::{
    config::{ConfigError, ConnectorConfig, LogLevel},
    error::{ConnectorError, EXIT_CONFIG, EXIT_FAILURE, EXIT_SUCCESS},
    logging, EndpointDescriptor, Operation,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "kvconnect")]
#[command(version, about = "Resilient connector for remote key-value stores", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the derived settings
    CheckConfig,

    /// Wait until the end-point answers a ping
    Probe {
        /// Give up after this many seconds
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,
    },

    /// Send one ping through the full execution engine
    Ping,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(connector) = err.downcast_ref::<ConnectorError>() {
        connector.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::from_file(path)?,
        None => ConnectorConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    config.validate()?;

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Probe { timeout } => probe(&config, timeout).await,
        Command::Ping => ping(&config).await,
    }
}

fn check_config(config: &ConnectorConfig) -> anyhow::Result<()> {
    let endpoint = EndpointDescriptor::from_config(config)?;
    let pool = config.pool_config();

    println!("End-point:        {}", endpoint);
    println!("Client name:      {}", endpoint.client_name);
    println!("Command timeout:  {:?}", endpoint.command_timeout);
    println!("Connect timeout:  {:?}", endpoint.connect_timeout);
    println!(
        "Pool:             max_total={} max_idle={} min_idle={} max_wait={:?}",
        pool.max_total, pool.max_idle, pool.min_idle, pool.max_wait
    );
    match config.circuit_breaker_config() {
        Some(breaker) => println!(
            "Circuit breaker:  failure {} success {} delay {:?}",
            breaker.failure_threshold, breaker.success_threshold, breaker.delay
        ),
        None => println!("Circuit breaker:  disabled"),
    }
    Ok(())
}

async fn probe(config: &ConnectorConfig, timeout: Option<u64>) -> anyhow::Result<()> {
    let started = Instant::now();
    let connecting = kvconnect::connect(config);
    let connector = match timeout {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), connecting)
            .await
            .map_err(|_| {
                ConnectorError::connect_failure(format!(
                    "{} (no answer within {}s)",
                    config.hosts, secs
                ))
            })??,
        None => connecting.await?,
    };

    println!(
        "{} is reachable ({:.2?})",
        connector.endpoint(),
        started.elapsed()
    );
    connector.shutdown();
    Ok(())
}

async fn ping(config: &ConnectorConfig) -> anyhow::Result<()> {
    let endpoint = EndpointDescriptor::from_config(config)?;
    let factory = kvconnect::RespFactory::new(endpoint.clone())?;
    let connector = kvconnect::Connector::new(endpoint, std::sync::Arc::new(factory), config)?;

    let started = Instant::now();
    let outcome = connector.execute(Operation::ping(), None).await;
    connector.shutdown();

    if outcome? {
        println!("PONG from {} ({:.2?})", connector.endpoint(), started.elapsed());
        Ok(())
    } else {
        Err(ConnectorError::new(
            kvconnect::ErrorKind::RemoteError,
            format!("{} did not answer PONG", connector.endpoint()),
        )
        .into())
    }
}
