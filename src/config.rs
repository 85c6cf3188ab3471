use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};
use toml_edit::{DocumentMut, Item, Table, value};
use tracing::info;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub rag: RagSection,
    /// Shared secret for `POST /api/admin/llm-key`. Only read from the
    /// environment, never from the file.
    #[serde(skip)]
    pub admin_setup_token: Option<String>,
    #[serde(skip)]
    pub production: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub frontend_url: Option<String>,
}

fn default_port() -> u16 {
    5000
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            frontend_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/sistema_financeiro.db".to_string()
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Any OpenAI-compatible HTTP API (Gemini's compatibility layer by default).
    Remote,
    /// Local Ollama server.
    Ollama,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_backend")]
    pub backend: LlmBackend,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: EndpointSection,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

fn default_backend() -> LlmBackend {
    LlmBackend::Remote
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_remote() -> EndpointSection {
    EndpointSection {
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
        model: "gemini-2.0-flash".to_string(),
        embedding_model: "text-embedding-004".to_string(),
    }
}

fn default_ollama() -> EndpointSection {
    EndpointSection {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen3:8b".to_string(),
        embedding_model: "nomic-embed-text".to_string(),
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
            remote: default_remote(),
            ollama: default_ollama(),
        }
    }
}

impl LlmSection {
    /// The endpoint the selected backend talks to.
    pub fn endpoint(&self) -> &EndpointSection {
        match self.backend {
            LlmBackend::Remote => &self.remote,
            LlmBackend::Ollama => &self.ollama,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.backend == LlmBackend::Remote
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RagSection {
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
}

fn default_index_path() -> PathBuf {
    PathBuf::from("uploads/rag_index.json")
}

impl Default for RagSection {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            database: DatabaseSection::default(),
            llm: LlmSection::default(),
            rag: RagSection::default(),
            admin_setup_token: None,
            production: false,
        }
    }
}

impl Config {
    /// Read the TOML file (defaults when it does not exist) and apply
    /// environment overrides.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let content = fs::read_to_string(path)?;
            Self::parse(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env(|name| std::env::var(name).ok());
        Ok(cfg)
    }

    pub fn parse(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(port) = var("PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = var("FRONTEND_URL") {
            self.server.frontend_url = Some(url);
        }

        if let Some(path) = var("DATABASE_URL").and_then(|u| sqlite_path_from_url(&u)) {
            self.database.path = path;
        } else if let Some(name) = var("DB_NAME") {
            let dir = var("DB_DIR").unwrap_or_else(|| "data".to_string());
            let file = if name.ends_with(".db") {
                name
            } else {
                format!("{name}.db")
            };
            self.database.path = Path::new(&dir).join(file).to_string_lossy().into_owned();
        }

        if let Some(path) = var("RAG_INDEX_PATH") {
            self.rag.index_path = PathBuf::from(path);
        }
        if let Some(key) = var("LLM_API_KEY").or_else(|| var("GEMINI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        self.admin_setup_token = var("ADMIN_SETUP_TOKEN");
        self.production = var("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production"));
    }

    /// Set `[section] key = new_value` in the config file, creating the file
    /// and the section when missing. Formatting and comments are preserved.
    pub fn update_value(
        path: impl AsRef<Path>,
        section: &str,
        key: &str,
        new_value: impl Into<toml_edit::Value>,
    ) -> AppResult<()> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path)?
        } else {
            String::new()
        };
        let mut doc = content
            .parse::<DocumentMut>()
            .map_err(|e| AppError::Config(e.to_string()))?;

        if !doc.contains_table(section) {
            doc[section] = Item::Table(Table::new());
        }
        doc[section][key] = value(new_value);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, doc.to_string())?;
        Ok(())
    }
}

/// Accepts `sqlite:path`, `sqlite://path` and `file:path`. Anything else is
/// not a SQLite URL and is ignored.
fn sqlite_path_from_url(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .or_else(|| url.strip_prefix("file:"))?;
    let rest = rest.split('?').next().unwrap_or(rest);
    (!rest.is_empty()).then(|| rest.to_string())
}
