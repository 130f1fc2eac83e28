use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tailship::agent::{test_configuration, Agent};
use tailship::api::{ApiClient, HttpTransport};
use tailship::config::{default_config_path, AgentConfig};
use tailship::status;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tailship")]
#[command(
    about = "Tails log files and ships them to an ingestion API, with host, container and endpoint telemetry"
)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./agent_config.json if present, then
    /// /etc/tailship/agent_config.json, then ~/.config/tailship/agent_config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Test configuration and API connectivity, then exit
    #[arg(long)]
    test_config: bool,
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            configured
        }
    }
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over flags and config
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let config = match AgentConfig::load_or_init(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.log_level("info"));
            if cli.test_config {
                println!("✗ Configuration test failed: {:#}", e);
            } else {
                error!("Failed to load configuration: {:#}", e);
            }
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.log_level(config.tracing_level()));

    if cli.test_config {
        return run_config_test(&config);
    }

    info!("Using configuration file {}", config_path.display());
    match run_agent(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_config_test(config: &AgentConfig) -> ExitCode {
    let transport = match HttpTransport::new() {
        Ok(transport) => transport,
        Err(e) => {
            println!("✗ Configuration test failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let client = ApiClient::new(&config.api_endpoint, &config.api_token, transport);

    let check = test_configuration(config, &client);
    for line in &check.lines {
        println!("{}", line);
    }
    if check.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run the agent until SIGINT/SIGTERM. The agent and its blocking HTTP
/// client live outside the tokio runtime, which only waits for signals and
/// serves the optional status endpoints.
fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    let status_port = config.status_port;
    let mut agent = Agent::from_config(config)?;
    agent.start()?;
    info!("Agent started successfully. Press Ctrl+C to stop.");

    let handle = agent.status_handle();
    let served = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tailship-rt")
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| {
            runtime.block_on(async move {
                let (stop_server, server_stopped) = oneshot::channel::<()>();
                let server = match status_port {
                    Some(port) => {
                        status::spawn(port, handle, async {
                            let _ = server_stopped.await;
                        })
                        .await
                    }
                    None => None,
                };

                shutdown_signal().await;

                let _ = stop_server.send(());
                if let Some(server) = server {
                    match server.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("{:#}", e),
                        Err(e) => error!("Status server task failed: {}", e),
                    }
                }
                Ok::<(), anyhow::Error>(())
            })
        });

    // Stop even when the runtime or status server failed, so the final
    // flush and checkpoint still happen
    let stopped = agent.stop();
    if let Err(e) = served {
        if let Err(stop_error) = stopped {
            error!("{:#}", stop_error);
        }
        return Err(e);
    }
    stopped
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
