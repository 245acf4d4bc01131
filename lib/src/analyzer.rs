//! Crash analysis passes.
//!
//! `NativeCrashAnalyzer` recovers what any native dump offers (stacks,
//! modules, the crash event); `DotNetCrashAnalyzer` runs it first and layers
//! the managed-runtime passes over the same result. Every command failure is
//! caught and degrades into an absent section.

use crate::debugger::{commands, DumpSession};
use crate::report::*;
use crate::status::Status;
use crate::{dotnet, frames, heap, procinfo, sourcelink};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

const TOP_CONSUMERS: usize = 10;

/// The fixed capability interface: one implementation per target-runtime
/// family.
pub trait DiagnosticPass {
    fn execute(&self, session: &DumpSession) -> CrashAnalysisResult;
}

/// Execute a command, store its raw output under the exact command string,
/// and convert failure into "section absent".
fn run_command(
    result: &mut CrashAnalysisResult,
    session: &DumpSession,
    status: &Status,
    command: &str,
) -> Option<String> {
    let output = match session.execute_command(command) {
        Ok(output) => {
            result
                .command_outputs
                .insert(command.to_string(), output.clone());
            Some(output)
        }
        Err(e) => {
            log::debug!("command {command:?} failed: {e:#}");
            None
        }
    };
    status.commands.inc_complete();
    output
}

pub struct NativeCrashAnalyzer {
    status: Arc<Status>,
}

impl NativeCrashAnalyzer {
    pub const COMMAND_COUNT: usize = 2;

    pub fn new(status: Arc<Status>) -> Self {
        NativeCrashAnalyzer { status }
    }
}

static EXCEPTION_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*ExceptionCode:\s*(\S+)(?:\s+\((.*)\))?").unwrap());

impl DiagnosticPass for NativeCrashAnalyzer {
    fn execute(&self, session: &DumpSession) -> CrashAnalysisResult {
        let mut result = CrashAnalysisResult::default();

        if let Some(output) = run_command(&mut result, session, &self.status, commands::ALL_STACKS)
        {
            let mut faulting_index = None;
            for (header, call_stack) in frames::parse_stack_transcript(&output) {
                let index = result.threads.all.len();
                // At most one faulting thread per dump; first selected wins.
                let is_faulting = header.is_selected && faulting_index.is_none();
                if is_faulting {
                    faulting_index = Some(index);
                }
                result.threads.all.push(ThreadInfo {
                    thread_id: header.thread_id,
                    state: if header.detail.is_empty() {
                        "Unknown".to_string()
                    } else {
                        header.detail
                    },
                    is_faulting,
                    top_function: call_stack
                        .first()
                        .map(|f| f.function.clone())
                        .unwrap_or_else(|| "[no frames]".to_string()),
                    call_stack,
                    wait_note: None,
                });
            }
            result.threads.faulting_index = faulting_index;
            result.modules = modules_from_threads(&result.threads);
        }

        if let Some(output) = run_command(&mut result, session, &self.status, commands::ANALYZE) {
            if let Some(c) = EXCEPTION_CODE.captures(&output) {
                let mut warning = format!("native exception code {}", &c[1]);
                if let Some(name) = c.get(2) {
                    warning.push_str(&format!(" ({})", name.as_str()));
                }
                result.summary.warnings.push(warning);
            }
        }

        result
    }
}

/// Distinct modules observed across all stacks; a module "has symbols" if any
/// of its frames resolved to a real function.
fn modules_from_threads(threads: &ThreadsInfo) -> Vec<ModuleInfo> {
    let mut modules: Vec<ModuleInfo> = Vec::new();
    for thread in &threads.all {
        for frame in &thread.call_stack {
            if frame.module.is_empty() {
                continue;
            }
            let has_symbols = !frame.function.starts_with('[');
            match modules.iter_mut().find(|m| m.name == frame.module) {
                Some(module) => module.has_symbols |= has_symbols,
                None => modules.push(ModuleInfo {
                    name: frame.module.clone(),
                    base_address: frame.instruction_pointer.clone(),
                    has_symbols,
                    path: None,
                }),
            }
        }
    }
    modules
}

pub struct DotNetCrashAnalyzer {
    native: NativeCrashAnalyzer,
    status: Arc<Status>,
    assemblies: Vec<AssemblyVersionInfo>,
    symbol_search_paths: Vec<PathBuf>,
}

impl DotNetCrashAnalyzer {
    pub const COMMAND_COUNT: usize = NativeCrashAnalyzer::COMMAND_COUNT + 10;

    pub fn new(
        status: Arc<Status>,
        assemblies: Vec<AssemblyVersionInfo>,
        symbol_search_paths: Vec<PathBuf>,
    ) -> Self {
        DotNetCrashAnalyzer {
            native: NativeCrashAnalyzer::new(status.clone()),
            status,
            assemblies,
            symbol_search_paths,
        }
    }
}

static EXCEPTION_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(Exception type|Message|HResult|InnerException):\s*(.+?)\s*$").unwrap());

/// Parse the `!pe -nested` output into exception details.
pub fn parse_exception(output: &str) -> Option<ExceptionInfo> {
    let mut exception = ExceptionInfo::default();
    for c in EXCEPTION_FIELD.captures_iter(output) {
        let value = c[2].to_string();
        match &c[1] {
            "Exception type" => {
                if exception.exception_type.is_empty() {
                    exception.exception_type = value;
                } else {
                    // Subsequent sections are the nested exceptions.
                    exception.nested.push(value);
                }
            }
            "Message" => {
                if exception.message.is_empty() {
                    exception.message = value;
                }
            }
            "HResult" => {
                if exception.hresult.is_none() {
                    exception.hresult = Some(value);
                }
            }
            "InnerException" => {
                let name = value.split([',', ' ']).next().unwrap_or(&value);
                exception.nested.push(name.to_string());
            }
            _ => (),
        }
    }
    (!exception.exception_type.is_empty()).then_some(exception)
}

impl DiagnosticPass for DotNetCrashAnalyzer {
    fn execute(&self, session: &DumpSession) -> CrashAnalysisResult {
        // Inheritance as composition: the generic native pass runs first and
        // the managed passes layer over its result.
        let mut result = self.native.execute(session);
        let started = std::time::Instant::now();

        if let Some(output) =
            run_command(&mut result, session, &self.status, commands::PRINT_EXCEPTION)
        {
            result.exception = parse_exception(&output);
        }

        if let Some(output) =
            run_command(&mut result, session, &self.status, commands::CLR_THREADS)
        {
            result.threads.summary = dotnet::parse_thread_counts(&output);
            result
                .summary
                .recommendations
                .extend(dotnet::thread_recommendations(&result.threads.summary));
        }

        let thread_states = run_command(&mut result, session, &self.status, commands::THREADS)
            .map(|output| dotnet::parse_thread_states(&output))
            .unwrap_or_default();
        for (id, state) in &thread_states {
            if let Some(thread) = result.threads.all.iter_mut().find(|t| &t.thread_id == id) {
                thread.state = state.clone();
            }
        }

        if let Some(output) =
            run_command(&mut result, session, &self.status, commands::SYNC_BLOCKS)
        {
            let sync_blocks = dotnet::parse_sync_blocks(&output);
            result.threads.deadlock = dotnet::detect_deadlock(&sync_blocks, &thread_states);
            if let Some(deadlock) = &result.threads.deadlock {
                for lock in &deadlock.locks {
                    if let Some(thread) = result
                        .threads
                        .all
                        .iter_mut()
                        .find(|t| t.thread_id == lock.owner_thread_id)
                    {
                        thread.wait_note = Some(format!(
                            "holds sync block {} while in state {}",
                            lock.sync_block_index, lock.owner_state
                        ));
                    }
                }
            }
        }

        if let Some(output) = run_command(&mut result, session, &self.status, commands::PEB) {
            result.environment = Some(procinfo::parse_peb_output(&output));
        }

        if let Some(output) = run_command(&mut result, session, &self.status, commands::TIMER_INFO)
        {
            let timers = dotnet::parse_timers(&output);
            let arguments = result
                .environment
                .as_ref()
                .map(|e| e.arguments.as_slice())
                .unwrap_or_default();
            if let Some(rec) = dotnet::timer_recommendation(&timers, arguments) {
                result.summary.recommendations.push(rec);
            }
        }

        // Stored for the report's raw-output map; later heuristics may read
        // them there.
        run_command(&mut result, session, &self.status, commands::EEVERSION);
        run_command(&mut result, session, &self.status, commands::FINALIZE_QUEUE);

        let heap_stat = run_command(&mut result, session, &self.status, commands::DUMP_HEAP_STAT)
            .map(|output| dotnet::parse_heap_stat(&output));
        let string_stats = run_command(&mut result, session, &self.status, commands::STRING_STATS)
            .map(|output| dotnet::parse_string_stats(&output));

        if let Some(heap_stat) = heap_stat {
            if let Some(rec) = dotnet::loh_recommendation(&heap_stat.type_stats) {
                result.summary.recommendations.push(rec);
            }

            if let Some(exception) = &result.exception {
                let type_resolution =
                    dotnet::analyze_type_resolution(exception, &heap_stat.type_stats, session);
                if let Some(exception) = &mut result.exception {
                    exception.type_resolution = type_resolution;
                }
            }

            let string_stats = string_stats.unwrap_or_default();
            let string_total_count = string_stats.values().map(|s| s.count).sum();
            let string_total_size = string_stats.values().map(|s| s.total_bytes).sum();
            let snapshot = HeapSnapshot {
                type_stats: heap_stat.type_stats,
                string_stats,
                total_size: heap_stat.total_size,
                free_size: heap_stat.free_size,
                total_count: heap_stat.total_count,
                string_total_size,
                string_total_count,
                was_aborted: self.status.is_cancelled(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            };
            result.memory = Some(heap::analyze(&snapshot, TOP_CONSUMERS));
        }

        for thread in &mut result.threads.all {
            for frame in &mut thread.call_stack {
                sourcelink::resolve(frame, &self.assemblies, &self.symbol_search_paths);
            }
        }
        result.assemblies = self.assemblies.clone();

        summarize(&mut result);
        result
    }
}

/// Compose the narrative summary from the collected signals.
fn summarize(result: &mut CrashAnalysisResult) {
    let mut parts: Vec<String> = Vec::new();

    match &result.exception {
        Some(exception) => {
            parts.push(format!(
                "The process faulted with {}: {}.",
                exception.exception_type, exception.message
            ));
            if let Some(tr) = &exception.type_resolution {
                if tr.type_found && !tr.method_found {
                    parts.push(format!(
                        "The type {} is loaded but does not expose {}; this looks like an \
                         assembly version mismatch.",
                        tr.expected_type, tr.expected_member
                    ));
                }
            }
        }
        None => parts.push("No managed exception was found in the dump.".to_string()),
    }

    if let Some(thread) = result.threads.faulting_thread() {
        let location = crate::ai::prompt::meaningful_top_frame(thread)
            .map(|f| format!("{}!{}", f.module, f.function))
            .unwrap_or_else(|| thread.top_function.clone());
        parts.push(format!(
            "The faulting thread ({}) was executing {}.",
            thread.thread_id, location
        ));
    }

    if let Some(deadlock) = &result.threads.deadlock {
        if deadlock.likely_deadlock {
            parts.push(format!(
                "{} locks are held by threads that are themselves waiting ({}); this is \
                 likely a deadlock.",
                deadlock.locks.len(),
                deadlock.blocked_thread_ids.join(", ")
            ));
        }
    }

    if let Some(memory) = &result.memory {
        if let Some(top) = memory.consumers.by_size.first() {
            parts.push(format!(
                "The largest heap consumer is {} ({} objects, {}% of the heap).",
                top.type_name, top.count, top.percent_of_heap
            ));
        }
        if memory.strings.wasted_percent > 10.0 {
            parts.push(format!(
                "{}% of string bytes are duplicates.",
                memory.strings.wasted_percent
            ));
        }
    }

    if let Some(environment) = &result.environment {
        for argument in &environment.suspicious_arguments {
            result
                .summary
                .warnings
                .push(format!("suspicious process argument: {argument}"));
        }
    }

    result.summary.text = parts.join(" ");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::TranscriptDebugger;
    use std::collections::BTreeMap;

    fn session(outputs: &[(&str, &str)]) -> DumpSession {
        let outputs: BTreeMap<String, String> = outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DumpSession::open(Box::new(TranscriptDebugger::from_outputs(outputs)))
    }

    const STACKS: &str = "\
thread #1, stop reason = none
    frame #0: 0x0000000100000000 SP=0x0000000000001000 libc`poll + 12
* thread #2, stop reason = signal SIGABRT
    frame #0: 0x0000000100000200 SP=0x0000000000003000
    frame #1: 0x0000000100000300 SP=0x0000000000003100 MyApp`Program.Run + 4 at /_/src/program.cs:10
";

    #[test]
    fn exception_fields_parse_with_nested() {
        let output = "\
Exception object: 0000020a40f2b2c8
Exception type:   System.InvalidOperationException
Message:          Collection was modified
InnerException:   System.ArgumentException, Use !pe to see more
HResult: 80131509
";
        let exception = parse_exception(output).unwrap();
        assert_eq!(exception.exception_type, "System.InvalidOperationException");
        assert_eq!(exception.message, "Collection was modified");
        assert_eq!(exception.hresult.as_deref(), Some("80131509"));
        assert_eq!(exception.nested, vec!["System.ArgumentException"]);
    }

    #[test]
    fn missing_exception_output_is_absent_not_fatal() {
        assert!(parse_exception("no exception here").is_none());

        let status = Arc::new(Status::new());
        let analyzer = DotNetCrashAnalyzer::new(status, Vec::new(), Vec::new());
        let result = analyzer.execute(&session(&[(commands::ALL_STACKS, STACKS)]));
        assert!(result.exception.is_none());
        assert_eq!(result.threads.all.len(), 2);
    }

    #[test]
    fn native_pass_marks_single_faulting_thread() {
        let status = Arc::new(Status::new());
        let analyzer = NativeCrashAnalyzer::new(status);
        let result = analyzer.execute(&session(&[(commands::ALL_STACKS, STACKS)]));
        assert_eq!(result.threads.faulting_index, Some(1));
        assert!(result.threads.all[1].is_faulting);
        assert!(!result.threads.all[0].is_faulting);
        assert_eq!(result.threads.faulting_thread().unwrap().thread_id, "2");
    }

    #[test]
    fn modules_deduplicate_and_track_symbols() {
        let status = Arc::new(Status::new());
        let analyzer = NativeCrashAnalyzer::new(status);
        let result = analyzer.execute(&session(&[(commands::ALL_STACKS, STACKS)]));
        let names: Vec<&str> = result.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["libc", "MyApp"]);
        assert!(result.modules.iter().all(|m| m.has_symbols));
    }

    #[test]
    fn dotnet_pass_layers_over_native_and_resolves_source_links() {
        let status = Arc::new(Status::new());
        let assemblies = vec![AssemblyVersionInfo {
            name: "MyApp".into(),
            repository_url: Some("https://github.com/org/repo".into()),
            commit_hash: Some("abc123".into()),
            ..Default::default()
        }];
        let analyzer = DotNetCrashAnalyzer::new(status, assemblies, Vec::new());
        let result = analyzer.execute(&session(&[
            (commands::ALL_STACKS, STACKS),
            (commands::CLR_THREADS, "ThreadCount: 2\nDeadThread: 1\n"),
            (
                commands::PRINT_EXCEPTION,
                "Exception type: System.Exception\nMessage: boom\n",
            ),
        ]));

        assert_eq!(result.threads.summary.thread_count, 2);
        assert!(result
            .summary
            .recommendations
            .iter()
            .any(|r| r.contains("dead managed threads")));
        assert!(result.summary.text.contains("System.Exception"));

        // The managed frame is not eligible here (module makes it native in
        // this transcript), so no URL appears on frame 1.
        let frames = &result.threads.all[1].call_stack;
        assert!(frames[1].source_url.is_none());
        // Raw outputs are stored under the exact command strings.
        assert!(result.command_outputs.contains_key(commands::ALL_STACKS));
        assert_eq!(result.assemblies.len(), 1);
    }

    #[test]
    fn deadlock_feeds_summary_and_wait_notes() {
        let status = Arc::new(Status::new());
        let analyzer = DotNetCrashAnalyzer::new(status, Vec::new(), Vec::new());
        let result = analyzer.execute(&session(&[
            (commands::ALL_STACKS, "thread #12\nthread #7\n"),
            (
                commands::THREADS,
                "  12  0x1a2b  WaitSleepJoin\n  7  0x5a0  Wait (Monitor)\n",
            ),
            (
                commands::SYNC_BLOCKS,
                "   23  0000020a40f2b2c8  3  1  0000020a3f2a1234  4f8  12  System.Object\n   \
                 24  0000020a40f2b3d8  1  1  0000020a3f2a5678  5a0  7  System.Object\n",
            ),
        ]));
        let deadlock = result.threads.deadlock.as_ref().unwrap();
        assert!(deadlock.likely_deadlock);
        assert!(result.summary.text.contains("deadlock"));
        assert!(result.threads.all.iter().all(|t| t.wait_note.is_some()));
    }
}
