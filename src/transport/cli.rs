//! CLI transport for direct terminal interaction
//!
//! `run_chat` wires the model backend and the MCP servers into a [`Session`]
//! and hands it to [`run_repl`], which owns the read/print loop. The loop is
//! generic over its input and output so it can be driven from tests.

use crate::agent::{truncate_preview, AgentEvent, LoopConfig, Session, StopReason};
use crate::config::{AgentConfig, Config};
use crate::llm::{self, LlmError, LlmProvider};
use crate::mcp::{ConnectionStatus, McpServerManager};
use anyhow::{Context, Result};
use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

const RULE_WIDTH: usize = 60;
const TRACE_RULE_WIDTH: usize = 50;

/// How the read/print loop presents agent progress
#[derive(Debug, Clone)]
pub struct ReplSettings {
    /// Print tool calls and results as they happen
    pub verbose: bool,
    /// Characters of tool output shown per result
    pub preview_chars: usize,
}

impl Default for ReplSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for ReplSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            verbose: config.verbose,
            preview_chars: config.result_preview_chars,
        }
    }
}

/// Run interactive chat mode
pub async fn run_chat(config: Config, settings: ReplSettings) -> Result<()> {
    ctrlc::set_handler(|| {
        println!("\n\n👋 Goodbye!");
        std::process::exit(0);
    })
    .context("Failed to install Ctrl+C handler")?;

    println!("🌟 Starting relay...");
    let provider = setup_llm(&config).await?;

    let manager = McpServerManager::new(&config.mcp);
    connect_servers(&config, &manager).await?;

    println!("\n📋 Getting available tools...");
    print_server_tools(&manager, false).await;

    let mut registry = match manager.merged_registry().await {
        Ok(registry) => registry,
        Err(e) => {
            manager.disconnect_all().await;
            return Err(e).context("MCP servers advertise conflicting tools");
        }
    };
    // Leave room for the MCP call timeout to report first
    registry.set_tool_timeout_secs(config.mcp.call_timeout_secs + 5);
    println!("\n✅ Total tools available: {}", registry.len());

    println!("\n🛠️ Creating multi-server agent...");
    let mut session = Session::new(
        provider,
        registry,
        &config.agent.system_prompt,
        LoopConfig::from(&config.agent),
    );
    println!(
        "✅ Multi-server agent created with {} tools!",
        session.tools().len()
    );

    let mut stdout = io::stdout();
    print_banner(&mut stdout)?;

    let stdin = io::stdin();
    let result = run_repl(&mut session, stdin.lock(), &mut stdout, &settings).await;

    session.close();
    manager.disconnect_all().await;
    let handled = result?;
    tracing::debug!("Chat ended after {} messages", handled);
    Ok(())
}

/// Create the model backend and probe it
///
/// An unreachable backend only warns: the servers may still be worth
/// connecting to, and the first message will report the failure.
async fn setup_llm(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    println!("🤖 Setting up Ollama LLM...");
    let provider: Arc<dyn LlmProvider> = Arc::from(llm::create_provider(&config.llm)?);

    match provider.health_check().await {
        Ok(()) => println!("✅ LLM configured successfully! ({})", provider.model()),
        Err(e) => {
            tracing::warn!("Model backend health check failed: {:#}", e);
            println!(
                "{} {:#}",
                "⚠️  Model backend not ready:".yellow(),
                e
            );
        }
    }

    Ok(provider)
}

/// Connect every enabled server; the first unreachable one aborts startup
async fn connect_servers(config: &Config, manager: &McpServerManager) -> Result<()> {
    println!("🔌 Connecting to MCP servers...");

    if let Err(e) = manager.connect_all().await {
        manager.disconnect_all().await;
        eprintln!("{} {}", "❌ Error starting client:".red(), e);
        print_server_hint(config, &mut io::stderr())?;
        return Err(anyhow::Error::new(e).context("Failed to connect to MCP servers"));
    }

    let connected = {
        let mut n = 0;
        for id in manager.server_ids().await {
            if manager.is_connected(&id).await {
                n += 1;
            }
        }
        n
    };
    println!("✅ Connected to {} MCP servers!", connected);
    Ok(())
}

/// List each server's tools; with `describe`, include descriptions
async fn print_server_tools(manager: &McpServerManager, describe: bool) {
    for (i, id) in manager.server_ids().await.into_iter().enumerate() {
        if i > 0 {
            println!();
        }

        if let Some(status) = manager.status(&id).await {
            if let ConnectionStatus::Failed(reason) = &status {
                println!(
                    "{} {} ({}): {}",
                    "⚠️ ".yellow(),
                    id.to_uppercase(),
                    status.display(),
                    reason
                );
                continue;
            }
        }

        let tools = manager.tools(&id).await;
        println!("=== {} TOOLS ({}) ===", id.to_uppercase(), tools.len());
        for tool in &tools {
            if describe && !tool.description.is_empty() {
                println!("  • {}: {}", tool.name.green(), tool.description.trim());
            } else {
                println!("  • {}", tool.name);
            }
        }
    }
}

/// Tell the user which servers must be up
fn print_server_hint<W: Write>(config: &Config, out: &mut W) -> io::Result<()> {
    writeln!(out, "\nMake sure these MCP servers are running:")?;
    for (name, server) in config.enabled_servers() {
        writeln!(out, "  • {}: {}", name, server.display_target())?;
    }
    Ok(())
}

fn print_banner<W: Write>(out: &mut W) -> io::Result<()> {
    let rule = "=".repeat(RULE_WIDTH);
    writeln!(out, "\n{}", rule)?;
    writeln!(out, "{}", "🚀 Multi-Server MCP Client Ready!".bold())?;
    writeln!(out, "{}", rule)?;
    writeln!(out, "You can now ask questions about:")?;
    writeln!(out, "  📊 Database: Add/query people data")?;
    writeln!(out, "  🌦️  Weather: Get alerts/forecasts for US locations")?;
    writeln!(out, "  🔄 Combined: Mix database and weather operations")?;
    writeln!(out, "\nType 'exit' to quit, 'help' for examples")?;
    writeln!(out, "{}", rule)?;
    Ok(())
}

fn print_help<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "\n📝 Example commands:")?;
    writeln!(out, "  Database:")?;
    writeln!(out, "    • Add John Doe, age 30, engineer to the database")?;
    writeln!(out, "    • Show me all people in the database")?;
    writeln!(out, "    • Find all people over 25 years old")?;
    writeln!(out, "  Weather:")?;
    writeln!(out, "    • Get weather alerts for California")?;
    writeln!(out, "    • Get forecast for NYC (40.7128, -74.0060)")?;
    writeln!(out, "    • Check alerts for Texas")?;
    writeln!(out, "  Combined:")?;
    writeln!(
        out,
        "    • Add a meteorologist to the database, then check weather in NY"
    )?;
    Ok(())
}

/// Read lines from `input` and forward them to `session` until `exit` or EOF
///
/// Returns the number of messages handed to the agent. Per-message failures
/// are printed and the loop carries on.
pub async fn run_repl<R, W>(
    session: &mut Session,
    mut input: R,
    out: &mut W,
    settings: &ReplSettings,
) -> Result<usize>
where
    R: BufRead,
    W: Write,
{
    let mut handled = 0;

    loop {
        write!(out, "\n💬 Your message: ")?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            writeln!(out, "\n👋 Goodbye!")?;
            break;
        }
        let message = line.trim();

        if message.eq_ignore_ascii_case("exit") {
            writeln!(out, "👋 Goodbye!")?;
            break;
        }
        if message.eq_ignore_ascii_case("help") {
            print_help(out)?;
            continue;
        }
        if message.is_empty() {
            writeln!(out, "Please enter a message or 'exit' to quit.")?;
            continue;
        }

        writeln!(out, "\n🤔 Processing: {}", message)?;
        writeln!(out, "{}", "-".repeat(TRACE_RULE_WIDTH))?;

        handled += 1;
        let result = session
            .handle_message(message, |event| {
                if let Err(e) = render_event(out, event, settings) {
                    tracing::warn!("Failed to write trace output: {}", e);
                }
            })
            .await;

        if let Err(e) = result {
            tracing::error!("Message failed: {:#}", e);
            writeln!(out, "{} {:#}", "❌ Error:".red(), e)?;
            if is_transient(&e) {
                writeln!(
                    out,
                    "The model backend may be busy or restarting; sending the message again may work."
                )?;
            }
            writeln!(out, "Please try again or type 'exit' to quit.")?;
        }
    }

    Ok(handled)
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<LlmError>())
        .any(LlmError::is_retryable)
}

/// Print one agent event
fn render_event<W: Write>(out: &mut W, event: &AgentEvent, settings: &ReplSettings) -> io::Result<()> {
    match event {
        AgentEvent::Invoked { tool, arguments } => {
            if settings.verbose {
                writeln!(out, "🔧 Calling tool {} with arguments {}", tool.cyan(), arguments)?;
            }
        }
        AgentEvent::Returned {
            tool,
            success,
            output,
        } => {
            if settings.verbose {
                let preview = truncate_preview(output, settings.preview_chars);
                if *success {
                    writeln!(out, "✅ Tool {} returned {}", tool.cyan(), preview)?;
                } else {
                    writeln!(out, "❌ Tool {} returned an error: {}", tool.cyan(), preview)?;
                }
            }
        }
        AgentEvent::FinalAnswer { text, stop } => {
            writeln!(out, "{}", "-".repeat(TRACE_RULE_WIDTH))?;
            match stop {
                StopReason::Answered => writeln!(out, "🤖 Agent: {}", text)?,
                StopReason::LoopLimitExceeded | StopReason::RepeatedToolFailure => {
                    writeln!(out, "{} {}", "⚠️  Agent:".yellow(), text)?
                }
            }
        }
    }
    Ok(())
}

/// Connect to the servers, list their tools with descriptions, disconnect
pub async fn run_tools(config: Config) -> Result<()> {
    let manager = McpServerManager::new(&config.mcp);
    connect_servers(&config, &manager).await?;

    println!();
    print_server_tools(&manager, true).await;

    let total = match manager.merged_registry().await {
        Ok(registry) => registry.len(),
        Err(e) => {
            manager.disconnect_all().await;
            return Err(e).context("MCP servers advertise conflicting tools");
        }
    };
    println!("\n✅ Total tools available: {}", total);

    manager.disconnect_all().await;
    Ok(())
}

/// Print the effective configuration, or write it to `path`
pub fn run_config(config: &Config, path: Option<&Path>, write: bool) -> Result<()> {
    if !write {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let target = match path {
        Some(p) => p.to_path_buf(),
        None => Config::config_path()?,
    };
    config.save_to(&target)?;
    println!("{} {}", "Wrote configuration to".green(), target.display());
    Ok(())
}
