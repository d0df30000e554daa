#![deny(unsafe_code)]

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oxdav_plugins::Account;
use oxdav_server::{SeedFile, ServerConfig, WebDavServer};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "tokio-console")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// WebDAV server with Nextcloud-style plugins over an in-memory tree
#[derive(Parser)]
#[command(name = "oxdav")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Serve the demo tree on port 8080
    oxdav serve --port 8080

    # Serve below a Nextcloud-style prefix with a config file
    oxdav serve --config oxdav.toml --base-uri /remote.php/webdav
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebDAV server
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "OXDAV_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long, value_name = "ADDR")]
    bind: Option<IpAddr>,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, value_name = "N")]
    port: Option<u16>,

    /// URI prefix the tree is served under
    #[arg(long, value_name = "URI")]
    base_uri: Option<String>,

    /// Serve without authentication
    #[arg(long)]
    public: bool,
}

impl ServeArgs {
    /// File configuration with command-line overrides applied.
    fn resolve(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => demo_config(),
        };
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(base_uri) = &self.base_uri {
            config.base_uri.clone_from(base_uri);
        }
        if self.public {
            config.public = true;
        }
        Ok(config)
    }
}

/// Configuration used when no file is given: one demo account and a few
/// files to browse.
fn demo_config() -> ServerConfig {
    let seed = |path: &str, content: &str| SeedFile {
        path: path.to_string(),
        content: content.to_string(),
    };
    ServerConfig {
        port: 8080,
        users: vec![Account::new("demo", "demo").with_display_name("Demo User")],
        files: vec![
            seed("Documents/", ""),
            seed("Documents/welcome.txt", "Welcome to oxdav.\n"),
            seed("Photos/", ""),
            seed("Readme.md", "# oxdav\n\nLog in as demo/demo.\n"),
        ],
        ..ServerConfig::default()
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Serve(args) => {
            let config = args.resolve()?;
            let factory = config.build_factory().context("Failed to build the demo tree")?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start the async runtime")?;
            runtime.block_on(serve(config, factory))
        }
    }
}

async fn serve(config: ServerConfig, factory: oxdav_plugins::ServerFactory) -> Result<()> {
    let server = WebDavServer::start(&config, factory)
        .await
        .with_context(|| format!("Failed to bind {}", config.socket_addr()))?;
    eprintln!("Serving WebDAV at {}", server.url());
    if config.public {
        eprintln!("Authentication disabled (public)");
    } else if let Some(user) = config.users.first() {
        eprintln!("Log in as '{}'", user.uid);
    }
    eprintln!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    server.stop().await;
    Ok(())
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    #[cfg(feature = "tokio-console")]
    {
        use tracing_subscriber::Layer;

        let fmt_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
        tracing_subscriber::registry()
            .with(console_subscriber::spawn())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_filter(fmt_filter))
            .init();
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
