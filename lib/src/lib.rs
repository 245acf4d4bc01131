pub use config::Config;
use analyzer::DiagnosticPass;
use anyhow::Context;
use report::{AiAnalysisResult, AssemblyVersionInfo, CrashAnalysisResult};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
pub use status::Status;
use tokio::runtime;

pub mod ai;
pub mod analyzer;
pub mod config;
pub mod debugger;
pub mod dotnet;
pub mod frames;
pub mod heap;
pub mod procinfo;
pub mod report;
pub mod sourcelink;
pub mod status;

pub(crate) const APP_USER_AGENT: &str = "dump-triage/1.0";

pub struct DumpTriage {
    pub status: Arc<Status>,
    config: Config,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageOutput {
    pub report: CrashAnalysisResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiAnalysisResult>,
}

/// A recorded session file: either a bare command -> output map, or an
/// object with the map under `commands` plus optional assembly metadata.
#[derive(Deserialize)]
#[serde(untagged)]
enum SessionFile {
    Structured {
        commands: std::collections::BTreeMap<String, String>,
        #[serde(default)]
        assemblies: Vec<AssemblyVersionInfo>,
    },
    Bare(std::collections::BTreeMap<String, String>),
}

fn load_session(path: &Path) -> anyhow::Result<(debugger::TranscriptDebugger, Vec<AssemblyVersionInfo>)> {
    if path.is_dir() {
        return Ok((debugger::TranscriptDebugger::from_dir(path)?, Vec::new()));
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("while reading {}", path.display()))?;
    let session: SessionFile = serde_json::from_str(&text)
        .with_context(|| format!("while parsing {}", path.display()))?;
    Ok(match session {
        SessionFile::Structured { commands, assemblies } => {
            (debugger::TranscriptDebugger::from_outputs(commands), assemblies)
        }
        SessionFile::Bare(commands) => {
            (debugger::TranscriptDebugger::from_outputs(commands), Vec::new())
        }
    })
}

impl DumpTriage {
    pub fn new(config: Config) -> Self {
        let status = Arc::new(Status::new());
        DumpTriage { status, config }
    }

    pub fn run(self) -> anyhow::Result<TriageOutput> {
        let DumpTriage { status, config } = self;

        log::info!("configuration: {config:#?}");

        let mut builder = runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("dump-triage");

        if let config::WorkerThreads::Exact(n) = config.worker_threads {
            builder.worker_threads(n);
        }

        builder.build()?.block_on(async move {
            let (client, assemblies) = load_session(&config.transcript.path)?;
            let session = debugger::DumpSession::open(Box::new(client));

            status.commands.set_total(analyzer::DotNetCrashAnalyzer::COMMAND_COUNT);
            let pass = analyzer::DotNetCrashAnalyzer::new(
                status.clone(),
                assemblies,
                config.symbols.search_paths.clone(),
            );
            // The diagnostic pass is synchronous and may block on the
            // debugger; keep it off the async workers.
            let report = tokio::task::spawn_blocking(move || pass.execute(&session))
                .await
                .context("analysis task failed")?;

            let ai = if config.ai.enabled && !status.is_cancelled() {
                let client = ai::sampling::HttpSamplingClient::new(config.sampling.as_ref())?;
                let orchestrator = ai::AiAnalysisOrchestrator::new(
                    &client,
                    &status,
                    &report,
                    config.ai.max_ledger_items,
                    config.ai.max_iterations,
                )?;
                // Endpoint failures propagate so the binary can map them to
                // the retryable exit code.
                orchestrator.run().await?
            } else {
                None
            };

            Ok(TriageOutput { report, ai })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_file_accepts_bare_and_structured_forms() {
        let dir = std::env::temp_dir().join(format!("triage-session-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let bare = dir.join("bare.json");
        std::fs::write(&bare, r#"{"!threads": "  12  0x1a2b  Running\n"}"#).unwrap();
        let (client, assemblies) = load_session(&bare).unwrap();
        let session = debugger::DumpSession::open(Box::new(client));
        assert!(session.execute_command("!threads").is_ok());
        assert!(assemblies.is_empty());

        let structured = dir.join("structured.json");
        std::fs::write(
            &structured,
            r#"{
                "commands": {"!threads": "output"},
                "assemblies": [{"name": "MyApp", "repositoryUrl": "https://github.com/org/repo"}]
            }"#,
        )
        .unwrap();
        let (_, assemblies) = load_session(&structured).unwrap();
        assert_eq!(assemblies.len(), 1);
        assert_eq!(assemblies[0].name, "MyApp");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
