use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Query every configured MCP server from one place.
///
/// Connects to all servers in the config file, runs one command against
/// them, prints the result as JSON and disconnects.
#[derive(Parser, Debug)]
#[command(name = "mcphub", version, about = "Multi-server MCP client")]
pub struct CliArgs {
    /// Server list (JSON with `mcpServers`, or TOML with `[servers.*]`)
    #[arg(long, short, env = "MCPHUB_CONFIG", default_value = "mcp_servers.json")]
    pub config: PathBuf,

    /// Request timeout in milliseconds for servers without their own
    #[arg(long, env = "MCPHUB_TIMEOUT_MS", default_value = "30000")]
    pub timeout_ms: u64,

    /// Skip the MCP `initialize` exchange after connecting
    #[arg(long)]
    pub no_handshake: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List connected servers
    Servers,
    /// List tools from every server
    Tools,
    /// List resources from every server
    Resources,
    /// List prompts from every server
    Prompts,
    /// Call a tool on one server
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Read a resource from one server
    Read { server: String, uri: String },
    /// Render a prompt from one server
    Prompt {
        server: String,
        name: String,
        /// Prompt arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
}
