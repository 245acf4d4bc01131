//! Debugger command execution interface.
//!
//! The process that actually drives a native debugger lives outside this
//! crate; analysis only needs `execute_command` over a fixed command set. The
//! `TranscriptDebugger` replays a recorded session for offline analysis.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;

/// The fixed, named command set. Nothing outside this list is executed.
pub mod commands {
    pub const EEVERSION: &str = "!eeversion";
    pub const PRINT_EXCEPTION: &str = "!pe -nested";
    pub const DUMP_HEAP_STAT: &str = "!dumpheap -stat";
    pub const CLR_THREADS: &str = "!clrthreads";
    pub const FINALIZE_QUEUE: &str = "!finalizequeue";
    pub const SYNC_BLOCKS: &str = "!syncblk";
    pub const THREADS: &str = "!threads";
    pub const ANALYZE: &str = "!analyze -v";
    pub const ALL_STACKS: &str = "~*k";
    pub const TIMER_INFO: &str = "!timerinfo";
    pub const PEB: &str = "!peb";
    pub const STRING_STATS: &str = "!strings -stat";

    pub const ALL: &[&str] = &[
        EEVERSION,
        PRINT_EXCEPTION,
        DUMP_HEAP_STAT,
        CLR_THREADS,
        FINALIZE_QUEUE,
        SYNC_BLOCKS,
        THREADS,
        ANALYZE,
        ALL_STACKS,
        TIMER_INFO,
        PEB,
        STRING_STATS,
    ];
}

pub trait DebuggerClient: Send + Sync {
    fn execute_command(&self, command: &str) -> anyhow::Result<String>;
}

/// Precondition violations; the only fatal error class in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionError {
    NotInitialized,
    DumpNotOpen,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotInitialized => write!(f, "debugger connection not initialized"),
            SessionError::DumpNotOpen => write!(f, "no dump is open in the debugger session"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A debugger client together with its open/initialized state.
pub struct DumpSession {
    client: Option<Box<dyn DebuggerClient>>,
    dump_open: bool,
}

impl DumpSession {
    pub fn open(client: Box<dyn DebuggerClient>) -> Self {
        DumpSession {
            client: Some(client),
            dump_open: true,
        }
    }

    /// A session whose dump has not been opened; every command fails.
    pub fn closed(client: Box<dyn DebuggerClient>) -> Self {
        DumpSession {
            client: Some(client),
            dump_open: false,
        }
    }

    pub fn uninitialized() -> Self {
        DumpSession {
            client: None,
            dump_open: false,
        }
    }

    pub fn execute_command(&self, command: &str) -> anyhow::Result<String> {
        let client = self.client.as_ref().ok_or(SessionError::NotInitialized)?;
        if !self.dump_open {
            return Err(SessionError::DumpNotOpen.into());
        }
        client.execute_command(command)
    }
}

/// Serves commands from a recorded session: a command -> output map, or a
/// directory of per-command text files with sanitized names.
pub struct TranscriptDebugger {
    outputs: BTreeMap<String, String>,
}

impl TranscriptDebugger {
    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut outputs = BTreeMap::new();
        for command in commands::ALL {
            let file = dir.join(format!("{}.txt", sanitize_command(command)));
            if file.is_file() {
                outputs.insert(
                    command.to_string(),
                    std::fs::read_to_string(&file)
                        .with_context(|| format!("while reading {}", file.display()))?,
                );
            }
        }
        Ok(TranscriptDebugger { outputs })
    }

    pub fn from_outputs(outputs: BTreeMap<String, String>) -> Self {
        TranscriptDebugger { outputs }
    }
}

/// Map a command string to a filesystem-safe file stem.
pub fn sanitize_command(command: &str) -> String {
    command
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl DebuggerClient for TranscriptDebugger {
    fn execute_command(&self, command: &str) -> anyhow::Result<String> {
        self.outputs
            .get(command)
            .cloned()
            .with_context(|| format!("no recorded output for command {command:?}"))
    }
}
