//! Report data model.
//!
//! Everything in here is serialized camelCase; the whole tree is owned by a
//! single analysis run and never mutated concurrently.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub frame_number: u32,
    pub instruction_pointer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_pointer: Option<String>,
    pub module: String,
    /// Never empty: frames without a resolvable symbol get a synthetic
    /// bracketed placeholder instead.
    pub function: String,
    /// `<file>:<line>` verbatim from the debugger output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_provider: Option<String>,
    pub is_managed: bool,
}

impl StackFrame {
    /// Split the stored source location on the last `:` into path and line.
    pub fn source_file_and_line(&self) -> Option<(&str, Option<u32>)> {
        let source = self.source.as_deref()?;
        match source.rsplit_once(':') {
            Some((path, line)) => match line.parse() {
                Ok(n) => Some((path, Some(n))),
                Err(_) => Some((source, None)),
            },
            None => Some((source, None)),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub thread_id: String,
    pub state: String,
    pub is_faulting: bool,
    pub top_function: String,
    pub call_stack: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_note: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsInfo {
    /// All threads in dump order.
    pub all: Vec<ThreadInfo>,
    /// Index into `all`; a reference, never a copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faulting_index: Option<usize>,
    pub summary: ThreadSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadlock: Option<DeadlockInfo>,
}

impl ThreadsInfo {
    pub fn faulting_thread(&self) -> Option<&ThreadInfo> {
        self.all.get(self.faulting_index?)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub thread_count: u32,
    pub background: u32,
    pub unstarted: u32,
    pub pending: u32,
    pub dead: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub name: String,
    pub base_address: String,
    pub has_symbols: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Static assembly metadata; read-only lookup input to source-link resolution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyVersionInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockInfo {
    pub locks: Vec<HeldLock>,
    pub blocked_thread_ids: Vec<String>,
    pub likely_deadlock: bool,
}

/// A sync block whose owning thread is currently in a wait state. Locks held
/// by runnable threads are never surfaced here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldLock {
    pub sync_block_index: u32,
    pub address: String,
    pub owner_thread_id: String,
    pub recursion: u32,
    pub owner_state: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub exception_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hresult: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_resolution: Option<TypeResolutionAnalysis>,
}

/// Version-skew diagnosis for missing-method style exceptions: the expected
/// member vs. what the loaded type actually exposes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeResolutionAnalysis {
    pub expected_type: String,
    pub expected_member: String,
    pub type_found: bool,
    pub method_found: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matching_members: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_table: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStat {
    pub count: u64,
    pub total_size: u64,
    pub largest_instance: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_table: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringStat {
    pub count: u64,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeObject {
    pub address: String,
    pub type_name: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultedTask {
    pub address: String,
    pub exception_type: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineStat {
    pub type_name: String,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncSummary {
    pub pending_tasks: u64,
    pub pending_state_machines: u64,
}

/// Caller-supplied heap aggregates; the analyzer derives from these but never
/// owns or mutates them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSnapshot {
    pub type_stats: BTreeMap<String, TypeStat>,
    pub string_stats: BTreeMap<String, StringStat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub large_objects: Vec<LargeObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faulted_tasks: Vec<FaultedTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_machines: Vec<StateMachineStat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_summary: Option<AsyncSummary>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_length_distribution: BTreeMap<String, u64>,
    pub total_size: u64,
    pub free_size: u64,
    pub total_count: u64,
    pub string_total_size: u64,
    pub string_total_count: u64,
    pub was_aborted: bool,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAnalysis {
    pub consumers: TopMemoryConsumers,
    pub strings: StringAnalysis,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub large_objects: Vec<LargeObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faulted_tasks: Vec<FaultedTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_machines: Vec<StateMachineStat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub async_summary: Option<AsyncSummary>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_length_distribution: BTreeMap<String, u64>,
    pub was_aborted: bool,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopMemoryConsumers {
    pub total_heap_size: u64,
    pub free_size: u64,
    pub fragmentation_ratio: f64,
    pub total_object_count: u64,
    pub by_size: Vec<TypeConsumer>,
    pub by_count: Vec<TypeConsumer>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeConsumer {
    pub type_name: String,
    pub count: u64,
    pub total_size: u64,
    pub largest_instance: u64,
    /// Rounded to two decimals; exactly 0 when the heap total is 0.
    pub percent_of_heap: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringAnalysis {
    pub unique_strings: u64,
    pub duplicated_strings: u64,
    pub total_strings: u64,
    pub total_bytes: u64,
    pub wasted_bytes: u64,
    pub wasted_percent: f64,
    pub top_duplicates: Vec<DuplicatedString>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatedString {
    /// Control characters escaped for display.
    pub sample: String,
    pub count: u64,
    pub total_bytes: u64,
    pub wasted_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessArgument {
    pub value: String,
    pub sensitive: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEnvironment {
    /// Base address of the process environment block; absent when the
    /// debugger printed an implausible pointer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peb_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    pub arguments: Vec<ProcessArgument>,
    /// Values are already redacted at parse time.
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspicious_arguments: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub text: String,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashAnalysisResult {
    pub summary: AnalysisSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
    pub threads: ThreadsInfo,
    pub modules: Vec<ModuleInfo>,
    pub assemblies: Vec<AssemblyVersionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<ProcessEnvironment>,
    /// Raw command outputs keyed by the exact command string.
    pub command_outputs: BTreeMap<String, String>,
}

/// Result of the AI-assisted investigation.
///
/// Older reports serialized the summary under `summaryRewrite`; it
/// deserializes transparently but always serializes back as `summary`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiAnalysisResult {
    #[serde(alias = "summaryRewrite")]
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<crate::ai::ledger::LedgerItem>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}
