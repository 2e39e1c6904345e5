use clap::{Args, Parser, Subcommand};
use epde_client::config::ClientConfig;
use epde_client::telemetry::{init_tracing, DEFAULT_LOG_LEVEL};
use epde_client::types::{LoginCredentials, TaskFilter, TaskStatus};
use epde_client::{ApiError, EpdeClient};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tracing::warn;

#[derive(Parser)]
#[command(name = "epde", about = "Command-line client for the EPDE maintenance platform")]
struct Cli {
    /// JSON config file; values missing from it use defaults.
    #[arg(long, global = true, env = "EPDE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Login(LoginArgs),
    Whoami,
    Logout,
    Tasks(TasksArgs),
    Complete(CompleteArgs),
    Stats,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    email: String,
    #[arg(long, env = "EPDE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args)]
struct TasksArgs {
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,
    #[arg(long)]
    property: Option<String>,
}

#[derive(Args)]
struct CompleteArgs {
    id: String,
}

fn parse_status(raw: &str) -> Result<TaskStatus, String> {
    TaskStatus::parse(raw)
        .ok_or_else(|| format!("unknown status '{raw}' (pending, in_progress, completed, overdue)"))
}

fn exit_code(err: &ApiError) -> i32 {
    if err.is_validation() {
        2
    } else {
        1
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig, ApiError> {
    let config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(url) = &cli.api_url {
        config.base_url = url.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ApiError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ApiError> {
    let config = load_config(&cli)?;
    let client = EpdeClient::with_keyring(config)?;
    client.restore_cache().await;

    let result = match cli.command {
        Command::Login(args) => {
            let credentials = LoginCredentials::new(args.email, args.password);
            let user = client.auth.login(&credentials).await?;
            print_json(&user)
        }
        Command::Whoami => {
            let session = client.auth.check_auth().await;
            print_json(&session)
        }
        Command::Logout => {
            client.auth.logout().await;
            print_json(&client.auth.session())
        }
        Command::Tasks(args) => {
            let filter = TaskFilter {
                status: args.status,
                property_id: args.property,
            };
            let tasks = client.tasks.tasks(&filter).await?;
            print_json(&tasks)
        }
        Command::Complete(args) => {
            let task = client.tasks.complete_task(&args.id).await?;
            print_json(&task)
        }
        Command::Stats => {
            let stats = client.tasks.dashboard_stats().await?;
            print_json(&stats)
        }
    };

    if let Err(e) = client.persist_cache().await {
        warn!(error = %e, "failed to persist query cache");
    }
    result
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(DEFAULT_LOG_LEVEL) {
        eprintln!("{e}");
    }

    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        process::exit(exit_code(&err));
    }
}
