use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub transcript: Transcript,
    #[serde(default)]
    pub symbols: Symbols,
    pub sampling: Option<Sampling>,
    #[serde(default)]
    pub ai: Ai,
    #[serde(default)]
    pub worker_threads: WorkerThreads,
}

/// Where the recorded debugger session lives: a JSON command map or a
/// directory of per-command text files.
#[derive(Debug, Deserialize)]
pub struct Transcript {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct Symbols {
    /// Symbol file search paths, in priority order.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Clone, Debug, Deserialize)]
pub struct Sampling {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_ledger_items() -> usize {
    50
}

fn default_max_iterations() -> usize {
    16
}

#[derive(Debug, Deserialize)]
pub struct Ai {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_ledger_items")]
    pub max_ledger_items: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for Ai {
    fn default() -> Self {
        Ai {
            enabled: false,
            max_ledger_items: default_max_ledger_items(),
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize)]
pub enum WorkerThreads {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(untagged)]
    Exact(usize),
}
