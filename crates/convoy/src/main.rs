use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use log::{debug, info, LevelFilter};
use tokio::net::TcpListener;

use convoy::agent::{Orchestrator, OrchestratorConfig};
use convoy::api::{self, AppState};
use convoy::config::AppConfig;
use convoy::conversation::ConversationStore;
use convoy::repo::RepoCache;
use convoy::session::SessionRegistry;

const APP_NAME: &str = "convoy";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = resolve_config_file(cli.common.config.clone())?;
    init_logging(&cli.common);
    let config = load_or_init_config(&config_file)?;
    debug!("config loaded from {}", config_file.display());

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
        Command::Config { command } => handle_config(&config, &config_file, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Convoy - browser chat backend for a command-line AI assistant.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP/WebSocket server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.quiet {
        LevelFilter::Error
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn resolve_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(if path.is_dir() {
            path.join("config.toml")
        } else {
            path
        });
    }
    let dir = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
    Ok(dir.join(APP_NAME).join("config.toml"))
}

fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        write_default_config(config_file)?;
    }

    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("CONVOY").separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let body = format!("# Configuration for {APP_NAME}\n\n{toml}");
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn handle_config(config: &AppConfig, config_file: &Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml = toml::to_string_pretty(config)?;
            print!("{toml}");
        }
        ConfigCommand::Path => println!("{}", config_file.display()),
    }
    Ok(())
}

#[tokio::main]
async fn run_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    let paths = config.paths.resolve()?;
    for dir in [
        &paths.repositories_dir,
        &paths.projects_dir,
        &paths.hot_copies_dir,
        &paths.data_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
    }

    let conversations = Arc::new(ConversationStore::open(&paths.data_dir).await?);
    let sessions = Arc::new(SessionRegistry::open(&paths.data_dir).await?);
    let repos = RepoCache::new(paths.repositories_dir.clone(), paths.hot_copies_dir.clone());
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::new(&config.assistant, &paths),
        Arc::clone(&conversations),
        Arc::clone(&sessions),
        Arc::clone(&repos),
    );

    let state = AppState {
        conversations,
        repos,
        orchestrator,
    };
    let app = api::router(state);

    let host = cmd.host.unwrap_or(config.server.host);
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("server running on http://{addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
