mod cli;
mod config;
mod envelope;
mod error;
mod gateway;
mod journal;
mod session;
mod transport;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use session::{FileStore, MemoryStore, SessionStore};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "portal", about = "Command-line client for the learning portal API")]
pub struct Args {
    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "PORTAL_BASE_URL", help = "API base URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "PORTAL_SESSION_FILE", help = "Session file path")]
    pub session_file: Option<PathBuf>,

    #[arg(long, help = "Keep the session in memory only (useful with `shell`)")]
    pub no_persist: bool,

    #[arg(long, help = "Append gateway events to this JSONL file")]
    pub journal: Option<PathBuf>,

    #[arg(long, help = "Debug output (print HTTP details and settings)")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Log in and store the session
    Login {
        email: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true, help = "Account password (prefer the env var)")]
        password: Option<String>,
        #[arg(long = "as", value_name = "TYPE", default_value = "student")]
        user_type: String,
    },
    /// Create an account
    Signup {
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true, help = "Account password (prefer the env var)")]
        password: Option<String>,
        #[arg(long = "as", value_name = "TYPE", default_value = "student")]
        user_type: String,
    },
    /// End the session and delete stored credentials
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Issue a single API call
    Call {
        method: String,
        path: String,
        #[arg(long, help = "JSON request body")]
        body: Option<String>,
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE", action = clap::ArgAction::Append)]
        headers: Vec<String>,
        #[arg(long, help = "Send without credentials and never refresh")]
        skip_auth: bool,
    },
    /// Interactive request shell
    Shell,
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "portal=debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.debug);

    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        config::Config::load()?
    };

    // CLI flags and env vars override config files
    if let Some(base_url) = &args.base_url {
        cfg.api.base_url = Some(base_url.clone());
    }
    if let Some(session_file) = &args.session_file {
        cfg.session.path = Some(session_file.clone());
    }
    if let Some(journal) = &args.journal {
        cfg.journal.path = Some(journal.clone());
    }

    if let Err(errors) = cfg.validate() {
        for error in &errors {
            eprintln!("Config error {}", error);
        }
        return Err(anyhow::anyhow!("Invalid configuration"));
    }

    let session_path = cfg.session_path();
    if args.debug {
        eprintln!("[DEBUG] API: {}", cfg.api.base_url());
        eprintln!("[DEBUG] Timeout: {:?}", cfg.api.timeout());
        if args.no_persist {
            eprintln!("[DEBUG] Session: in memory");
        } else {
            eprintln!("[DEBUG] Session: {}", session_path.display());
        }
    }

    let store: Box<dyn SessionStore> = if args.no_persist {
        Box::new(MemoryStore::new())
    } else {
        Box::new(FileStore::new(&session_path))
    };
    let transport = transport::HttpTransport::new(cfg.api.timeout());

    let mut gateway = gateway::Gateway::new(gateway::Endpoints::from(&cfg.api), transport, store)
        .with_context(|| format!("Failed to load session from {}", session_path.display()))?
        .on_signed_out(Box::new(|| {
            eprintln!("Session expired. Run `portal login` to sign in again.");
        }));

    if let Some(journal_path) = &cfg.journal.path {
        let client_id = uuid::Uuid::new_v4().to_string();
        let journal = journal::Journal::new(journal_path, &client_id)
            .with_context(|| format!("Failed to open journal {}", journal_path.display()))?;
        if args.debug {
            eprintln!("[DEBUG] Journal: {}", journal.path.display());
        }
        gateway = gateway.with_journal(journal);
    }

    let ctx = cli::Context {
        gateway,
        config: cfg,
    };
    cli::run(&ctx, args.command)
}
