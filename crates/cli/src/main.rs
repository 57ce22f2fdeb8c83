mod config_commands;
mod runtime;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    bundler_router::{McpServer, MessageChannel, Router, StdioChannel},
    clap::{Parser, Subcommand},
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "mcp-bundler",
    about = "mcp-bundler: many MCP servers behind one namespaced endpoint"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery in ./ and ~/.config/mcp-bundler/).
    #[arg(long, global = true, env = "MCP_BUNDLER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the bundled catalog over stdio (default when no subcommand is provided).
    Serve,
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Connect to every upstream and print the namespaced catalog.
    List {
        /// Print JSON instead of a plain listing.
        #[arg(long)]
        json: bool,
    },
}

/// Logs go to stderr; stdout carries the protocol.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "mcp-bundler starting");

    let config_path = cli.config.as_deref();
    match cli.command {
        None | Some(Commands::Serve) => serve(config_path).await,
        Some(Commands::Check { verbose }) => config_commands::check(config_path, verbose),
        Some(Commands::List { json }) => list(config_path, json).await,
    }
}

async fn serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let (config, path) = runtime::load(config_path)?;
    runtime::ensure_valid(&config)?;
    let router = runtime::start_router(&config, path.as_deref()).await?;

    let server = Arc::new(McpServer::from_config(Arc::clone(&router), &config.server));
    let channel: Arc<dyn MessageChannel> = Arc::new(StdioChannel::stdio());
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        })
    };

    let served = bundler_router::serve(server, channel, cancel).await;
    interrupt.abort();
    router.shutdown().await;
    info!("mcp-bundler stopped");
    served?;
    Ok(())
}

async fn list(config_path: Option<&Path>, as_json: bool) -> anyhow::Result<()> {
    let (config, path) = runtime::load(config_path)?;
    runtime::ensure_valid(&config)?;
    let router = runtime::start_router(&config, path.as_deref()).await?;
    let printed = print_catalog(&router, as_json).await;
    router.shutdown().await;
    printed
}

async fn print_catalog(router: &Router, as_json: bool) -> anyhow::Result<()> {
    let tools = router.list_tools(None).await;
    let prompts = router.list_prompts(None).await;
    let resources = router.list_resources(None).await;
    let statuses = router.statuses().await;

    if as_json {
        let body = json!({
            "project": router.project_slug(),
            "revision": router.revision(),
            "upstreams": statuses,
            "tools": tools,
            "prompts": prompts,
            "resources": resources,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Project {} (revision {})", router.project_slug(), router.revision());
    println!("\nUpstreams:");
    for status in &statuses {
        let error = status
            .upstream
            .last_error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default();
        println!(
            "  {:<20} {:<6} {:<14} {} tool(s){error}",
            status.upstream.alias,
            status.upstream.kind,
            status.upstream.state.to_string(),
            status.tools
        );
    }
    println!("\nTools:");
    for tool in &tools {
        match &tool.description {
            Some(description) => println!("  {}: {description}", tool.name),
            None => println!("  {}", tool.name),
        }
    }
    if !prompts.is_empty() {
        println!("\nPrompts:");
        for prompt in &prompts {
            println!("  {}", prompt.name);
        }
    }
    if !resources.is_empty() {
        println!("\nResources:");
        for resource in &resources {
            println!("  {} ({})", resource.uri, resource.name);
        }
    }
    Ok(())
}
