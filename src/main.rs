use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use das_healthcheck::application::*;
use das_healthcheck::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "das-healthcheck")]
#[command(about = "MySQL health diagnosis - weighted scoring over configuration, telemetry and slow queries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose a MySQL server over a time window and wait for the result
    Check {
        /// Id of the server in t_meta_mysql_server_info
        #[arg(long, conflicts_with = "host", required_unless_present = "host")]
        mysql_server_id: Option<i64>,
        /// Server address, used with --port instead of --mysql-server-id
        #[arg(long, requires = "port")]
        host: Option<String>,
        #[arg(long, requires = "host")]
        port: Option<i32>,
        /// Window start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,
        /// Window end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,
        /// Sampling step in seconds
        #[arg(long, default_value = "60")]
        step: u64,
    },
    /// Print the result of an operation as JSON
    Result {
        #[arg(long)]
        operation_id: i64,
    },
    /// Record the manual accuracy review of an operation
    Review {
        #[arg(long)]
        operation_id: i64,
        #[arg(long)]
        review: i32,
    },
    /// Show the status of an operation
    Status {
        #[arg(long)]
        operation_id: i64,
    },
    /// Generate configuration diagnostic report
    Config,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.operational.log_level));

    if config.operational.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    init_tracing(&config);

    if let Commands::Config = cli.command {
        return ConfigCommandHandler::new(config).diagnose();
    }

    let app = Application::new(config).await?;
    let handler = HealthcheckCommandHandler::new(app.container.clone());

    let outcome = match cli.command {
        Commands::Check {
            mysql_server_id,
            host,
            port,
            start,
            end,
            step,
        } => {
            let target = match (mysql_server_id, host, port) {
                (Some(id), _, _) => CheckTarget::ServerId(id),
                (None, Some(host_ip), Some(port_num)) => CheckTarget::HostInfo { host_ip, port_num },
                _ => {
                    return Err(anyhow::anyhow!(
                        "either --mysql-server-id or --host and --port is required"
                    ))
                }
            };
            handler.check(target, start, end, step).await
        }
        Commands::Result { operation_id } => handler.result(operation_id).await,
        Commands::Review {
            operation_id,
            review,
        } => handler.review(operation_id, review).await,
        Commands::Status { operation_id } => handler.status(operation_id).await,
        Commands::Config => Ok(()),
    };

    app.shutdown().await;
    outcome
}
