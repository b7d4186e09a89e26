use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use relay_cli::config::Config;
use relay_cli::transport::{self, ReplSettings};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Version string with git info for dev builds
const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    env!("RELAY_VERSION_SUFFIX")
);

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version = VERSION, about = "Relay - chat with a local Ollama model that can call MCP server tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat with the agent (default)
    Chat(ChatArgs),

    /// Connect to the MCP servers and list their tools
    Tools {
        /// Override or add a server (repeatable)
        #[arg(long = "server", value_name = "NAME=URL", value_parser = parse_server)]
        servers: Vec<(String, String)>,
    },

    /// Show the effective configuration
    Config {
        /// Write it to the config file instead of printing it
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args, Default)]
struct ChatArgs {
    /// Ollama model to use (e.g., llama3.2, qwen2.5)
    #[arg(short, long)]
    model: Option<String>,

    /// Ollama base URL
    #[arg(long, value_name = "URL")]
    ollama_url: Option<String>,

    /// Model request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Override or add a server (repeatable)
    #[arg(long = "server", value_name = "NAME=URL", value_parser = parse_server)]
    servers: Vec<(String, String)>,

    /// Hide tool calls and results
    #[arg(short, long)]
    quiet: bool,
}

fn parse_server(value: &str) -> Result<(String, String), String> {
    let (name, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got `{}`", value))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        return Err(format!("expected NAME=URL, got `{}`", value));
    }
    url::Url::parse(url).map_err(|e| format!("invalid server url `{}`: {}", url, e))?;
    Ok((name.to_string(), url.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "relay_cli=debug"
    } else {
        "relay_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::load_from(cli.config.as_deref())?;
    config.apply_env_overrides();

    match cli.command.unwrap_or(Commands::Chat(ChatArgs::default())) {
        Commands::Chat(args) => {
            if let Some(model) = args.model {
                config.llm.model = model;
            }
            if let Some(url) = args.ollama_url {
                config.llm.base_url = url;
            }
            if let Some(timeout) = args.timeout {
                config.llm.request_timeout_secs = timeout;
            }
            for (name, url) in &args.servers {
                config.set_server_url(name, url);
            }
            if args.quiet {
                config.agent.verbose = false;
            }
            config.validate()?;

            tracing::info!(
                "Starting chat with {} at {}",
                config.llm.model,
                config.llm.base_url
            );
            let settings = ReplSettings::from(&config.agent);
            transport::run_chat(config, settings).await?;
        }
        Commands::Tools { servers } => {
            for (name, url) in &servers {
                config.set_server_url(name, url);
            }
            transport::run_tools(config).await?;
        }
        Commands::Config { write } => {
            transport::run_config(&config, cli.config.as_deref(), write)?;
        }
    }

    Ok(())
}
