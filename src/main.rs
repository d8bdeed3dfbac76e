use anyhow::Result;
use clap::{Parser, Subcommand};
use deployhook::{webhook, Config, WebhookSecret};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deployhook")]
#[command(about = "Queue deploy markers from signed GitHub push webhooks")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook listener (default)
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8000
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Directory that receives `<repository>/<unix-seconds>` markers
        #[arg(long)]
        job_root: Option<PathBuf>,
    },
    /// Print the effective configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let env = |key: &str| std::env::var(key).ok();
    let mut config = Config::load(cli.config.as_deref(), env)?;
    // Checked before anything else so a misconfigured deploy never starts listening.
    let secret = WebhookSecret::from_lookup(env)?;

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        job_root: None,
    }) {
        Commands::Serve { bind, job_root } => {
            config.apply_overrides(bind, job_root.as_deref())?;
            webhook::run(&config, secret).await
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
            println!("secret: {secret:?}");
            Ok(())
        }
    }
}
