mod cli;
mod terminal;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing::info;

use mcphub::{Aggregator, AggregatorOptions, ConfigFile, McpError};

use crate::cli::{CliArgs, Command};
use crate::terminal::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let terminal = Terminal::new();

    let options = AggregatorOptions {
        request_timeout: Duration::from_millis(args.timeout_ms),
        handshake: !args.no_handshake,
    };
    let hub = Aggregator::with_options(ConfigFile::new(&args.config), options);

    match hub.connect().await {
        Ok(()) => {}
        Err(McpError::ConnectFailed { failures }) => {
            for (server, err) in &failures {
                terminal.print_warning(&format!("{server}: {err}"))?;
            }
            let connected = hub.get_connected_servers().await;
            if connected.is_empty() {
                bail!("no MCP server could be reached");
            }
            terminal.print_info(&format!(
                "continuing with {} server(s): {}",
                connected.len(),
                connected.join(", ")
            ))?;
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to connect using {}", args.config.display())
            });
        }
    }

    let outcome = run(&hub, args.command, &terminal).await;
    hub.disconnect().await;
    if let Err(e) = outcome {
        terminal.print_error(&format!("{e:#}"))?;
        std::process::exit(1);
    }
    Ok(())
}

async fn run(hub: &Aggregator, command: Command, terminal: &Terminal) -> Result<()> {
    match command {
        Command::Servers => terminal.print_json(&hub.get_connected_servers().await),
        Command::Tools => terminal.print_json(&hub.list_tools().await),
        Command::Resources => terminal.print_json(&hub.list_resources().await),
        Command::Prompts => terminal.print_json(&hub.list_prompts().await),
        Command::Call { server, tool, args } => {
            let arguments = parse_object(&args).context("invalid --args")?;
            info!(server = %server, tool = %tool, "calling tool");
            let result = hub
                .call_tool(&server, &tool, arguments)
                .await
                .with_context(|| format!("failed to call '{tool}' on '{server}'"))?;
            terminal.print_json(&result)?;
            if result.is_error {
                terminal.print_warning(&format!("tool '{tool}' reported an error"))?;
            }
            Ok(())
        }
        Command::Read { server, uri } => {
            let result = hub
                .read_resource(&server, &uri)
                .await
                .with_context(|| format!("failed to read '{uri}' from '{server}'"))?;
            terminal.print_json(&result)
        }
        Command::Prompt { server, name, args } => {
            let arguments = args
                .as_deref()
                .map(parse_object)
                .transpose()
                .context("invalid --args")?;
            let result = hub
                .get_prompt(&server, &name, arguments)
                .await
                .with_context(|| format!("failed to get prompt '{name}' from '{server}'"))?;
            terminal.print_json(&result)
        }
    }
}

/// Parse a `--args` value, which must be a JSON object.
fn parse_object(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        bail!("expected a JSON object, got {value}");
    }
    Ok(value)
}
