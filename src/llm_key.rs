use sha2::{Digest, Sha256};
use std::io::{BufRead, IsTerminal, Write};
use std::sync::RwLock;

use crate::error::{AppError, AppResult};

/// Process-wide LLM credential. Starts from config/env and can be replaced
/// at runtime through the admin endpoint; never written to disk from here.
#[derive(Debug, Default)]
pub struct LlmKey {
    key: RwLock<Option<String>>,
}

impl LlmKey {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            key: RwLock::new(initial.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())),
        }
    }

    pub fn get(&self) -> AppResult<String> {
        self.key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                AppError::Config("LLM_API_KEY missing. Set the environment variable on the server.".into())
            })
    }

    pub fn set(&self, key: &str) -> AppResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::Validation("Invalid LLM key".into()));
        }
        *self.key.write().unwrap_or_else(|e| e.into_inner()) = Some(key.to_string());
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.key.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Ask for the key on the terminal. Refuses when stdin is not a TTY or
    /// when running in production.
    pub fn prompt(&self, production: bool) -> AppResult<()> {
        if production || !std::io::stdin().is_terminal() {
            return Err(AppError::Config(
                "LLM_API_KEY missing. Set the environment variable on the server.".into(),
            ));
        }
        let answer = ask("Enter your LLM API key: ")?;
        if answer.is_empty() {
            return Err(AppError::Config("LLM API key not provided".into()));
        }
        self.set(&answer)
    }
}

/// Read one trimmed line from stdin after printing `question`.
pub fn ask(question: &str) -> AppResult<String> {
    let mut stdout = std::io::stdout();
    stdout.write_all(question.as_bytes())?;
    stdout.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Compare the SHA-256 digests of the configured and presented setup tokens.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
