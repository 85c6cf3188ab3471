mod config;
mod db;
mod error;
mod http;
mod invoice;
mod ledger;
mod llm_client;
mod llm_extract;
mod llm_key;
mod pdf_extract;
mod rag;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, LlmBackend};
use db::Store;
use error::AppResult;
use http::AppState;
use llm_client::OpenAiClient;
use llm_key::LlmKey;

#[derive(Debug, Parser)]
#[command(name = "nota_fiscal", version, about = "Invoice intake and schema Q&A service")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = "config/app.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Write the configuration file interactively
    Setup,
    /// Rebuild the schema embedding index
    Index,
    /// Extract one invoice PDF and print the result as JSON
    Extract { pdf: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Setup => setup(&cli.config)?,
        command => {
            let cfg = Config::load(&cli.config)?;
            match command {
                Command::Index => index(cfg).await?,
                Command::Extract { pdf } => extract(cfg, &pdf).await?,
                _ => serve(cfg).await?,
            }
        }
    }
    Ok(())
}

/// Make sure a remote backend has a key before the server starts. Without
/// one, startup only continues when the admin endpoint can supply it later.
fn ensure_llm_key(cfg: &Config, key: &LlmKey) -> AppResult<()> {
    if !cfg.llm.requires_api_key() || key.is_set() {
        return Ok(());
    }
    match key.prompt(cfg.production) {
        Ok(()) => Ok(()),
        Err(e) if cfg.admin_setup_token.is_some() => {
            warn!(error = %e, "Starting without an LLM key; set it with POST /api/admin/llm-key");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn llm_client(cfg: &Config, key: Arc<LlmKey>) -> AppResult<Arc<OpenAiClient>> {
    let client = OpenAiClient::new(&cfg.llm, key)?;
    if !client.check_health().await {
        warn!("LLM backend is not reachable yet; requests will fail until it is");
    }
    Ok(Arc::new(client))
}

fn open_store(cfg: &Config) -> AppResult<Arc<Store>> {
    let store = Store::open(&cfg.database.path)?;
    let (pessoas, classificacoes, movimentos, parcelas) = store.get_counts()?;
    info!(pessoas, classificacoes, movimentos, parcelas, "Database ready");
    Ok(Arc::new(store))
}

async fn serve(cfg: Config) -> AppResult<()> {
    let llm_key = Arc::new(LlmKey::new(cfg.llm.api_key.clone()));
    ensure_llm_key(&cfg, &llm_key)?;
    let client = llm_client(&cfg, llm_key.clone()).await?;
    let store = open_store(&cfg)?;

    let state = AppState {
        store,
        chat: client.clone(),
        embedder: client,
        llm_key,
        config: Arc::new(cfg),
    };
    http::serve(state).await
}

async fn index(cfg: Config) -> AppResult<()> {
    let llm_key = Arc::new(LlmKey::new(cfg.llm.api_key.clone()));
    ensure_llm_key(&cfg, &llm_key)?;
    let client = llm_client(&cfg, llm_key).await?;
    let store = open_store(&cfg)?;

    let summary = rag::build_index(&store, client.as_ref(), &cfg.rag.index_path).await?;
    info!(
        count = summary.count,
        tables = ?summary.docs_processed,
        path = %cfg.rag.index_path.display(),
        "Embedding index rebuilt"
    );
    Ok(())
}

async fn extract(cfg: Config, pdf: &Path) -> AppResult<()> {
    let llm_key = Arc::new(LlmKey::new(cfg.llm.api_key.clone()));
    ensure_llm_key(&cfg, &llm_key)?;
    let client = llm_client(&cfg, llm_key).await?;

    let bytes = tokio::fs::read(pdf).await?;
    let text = pdf_extract::invoice_text_blocking(bytes).await?;
    println!("----- extracted text -----\n{text}\n--------------------------");

    let invoice = llm_extract::extract_invoice(client.as_ref(), &text).await?;
    println!("{}", serde_json::to_string_pretty(&invoice)?);
    Ok(())
}

/// Prompt for the main settings and write them into the config file,
/// keeping whatever else the file already holds.
fn setup(path: &Path) -> AppResult<()> {
    let current = Config::load(path)?;
    println!("Configuring {}", path.display());

    let with_default = |question: &str, default: &str| -> AppResult<String> {
        let answer = llm_key::ask(&format!("{question} [{default}]: "))?;
        Ok(if answer.is_empty() {
            default.to_string()
        } else {
            answer
        })
    };

    let port = with_default("Server port", &current.server.port.to_string())?;
    let port: u16 = port
        .parse()
        .map_err(|_| error::AppError::Config(format!("invalid port: {port}")))?;
    Config::update_value(path, "server", "port", i64::from(port))?;

    let frontend = llm_key::ask("Frontend URL (blank allows any origin): ")?;
    if !frontend.is_empty() {
        Config::update_value(path, "server", "frontend_url", frontend)?;
    }

    let db_path = with_default("SQLite database path", &current.database.path)?;
    Config::update_value(path, "database", "path", db_path)?;

    let backend = with_default("LLM backend (remote/ollama)", "remote")?;
    match backend.to_ascii_lowercase().as_str() {
        "ollama" => {
            Config::update_value(path, "llm", "backend", "ollama")?;
        }
        "remote" => {
            Config::update_value(path, "llm", "backend", "remote")?;
            let key = llm_key::ask("LLM API key (blank keeps the current one): ")?;
            if !key.is_empty() {
                Config::update_value(path, "llm", "api_key", key)?;
            }
        }
        other => {
            return Err(error::AppError::Config(format!("unknown LLM backend: {other}")));
        }
    }

    let written = Config::load(path)?;
    info!(
        path = %path.display(),
        port = written.server.port,
        database = %written.database.path,
        ollama = written.llm.backend == LlmBackend::Ollama,
        "Configuration written"
    );
    Ok(())
}
