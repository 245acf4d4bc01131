//! Parsers for the managed-runtime diagnostic command outputs: thread
//! listings, timer queues, heap statistics, and sync blocks.
//!
//! All of these are line-oriented and silent-skip: an unrecognized line
//! degrades the output rather than failing the parse.

use crate::debugger::DumpSession;
use crate::report::{
    DeadlockInfo, ExceptionInfo, HeldLock, ProcessArgument, StringStat, ThreadSummary,
    TypeResolutionAnalysis, TypeStat,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Per-instance size above which an allocation lands on the Large Object Heap.
pub const LOH_THRESHOLD_BYTES: u64 = 85_000;

/// Timer count above which a recommendation fires.
pub const TIMER_RECOMMENDATION_THRESHOLD: usize = 50;

/// Thread count above which a pool-exhaustion recommendation fires.
pub const THREAD_POOL_THRESHOLD: u32 = 100;

static COUNTER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\w+):?\s+(\d+)\s*$").unwrap());

// (L) 0x... @ 100 ms every 250 ms | 0x... (My.StateMachine) -> Callback
static TIMER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^\s*\(L\)\s+(0x[0-9a-fA-F]+)\s+@\s+(\d+)\s+ms\s+every\s+(\d+)\s+ms\s+
          \|\s+(0x[0-9a-fA-F]+)\s+\(([^)]+)\)\s*->\s*Callback",
    )
    .unwrap()
});

// 00007ff8a1b2c3d4      1250        50000 System.String
static HEAP_STAT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*((?:0x)?[0-9a-fA-F]{8,16})\s+(\d+)\s+(\d+)\s+(\S.*?)\s*$").unwrap()
});

static TOTAL_OBJECTS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Total\s+(\d+)\s+objects").unwrap());

// Thread 12: Wait (Sleep/Join)  --  or  --  12  0x1a2b  WaitSleepJoin ...
static THREAD_STATE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:Thread\s+#?)?(\d+)\s*[:,]?\s+(?:0x[0-9a-fA-F]+\s+)?([A-Za-z][A-Za-z0-9 /()|+-]*?)\s*$")
        .unwrap()
});

// <count> <bytes> <value...>
static STRING_STAT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s+(\d+)\s+(\S.*?)\s*$").unwrap());

/// Parse the SOS thread-listing header counters.
pub fn parse_thread_counts(output: &str) -> ThreadSummary {
    let mut summary = ThreadSummary::default();
    for line in output.lines() {
        let Some(c) = COUNTER_LINE.captures(line) else {
            continue;
        };
        let Ok(value) = c[2].parse() else { continue };
        match &c[1] {
            "ThreadCount" => summary.thread_count = value,
            "BackgroundThread" => summary.background = value,
            "UnstartedThread" => summary.unstarted = value,
            "PendingThread" => summary.pending = value,
            "DeadThread" => summary.dead = value,
            _ => (),
        }
    }
    summary
}

/// Recommendations derived from thread counters. The dead-thread and
/// pool-exhaustion recommendations are gated independently and never
/// double-fire off the same counter.
pub fn thread_recommendations(summary: &ThreadSummary) -> Vec<String> {
    let mut recommendations = Vec::new();
    if summary.dead > 0 {
        recommendations.push(format!(
            "{} dead managed threads; check for threads that exited without being joined",
            summary.dead
        ));
    }
    if summary.thread_count > THREAD_POOL_THRESHOLD {
        recommendations.push(format!(
            "{} managed threads is unusually high; the thread pool may be exhausted by blocking calls",
            summary.thread_count
        ));
    }
    recommendations
}

/// Ordered `(thread_id, state)` pairs from a thread listing.
pub fn parse_thread_states(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let c = THREAD_STATE_LINE.captures(line)?;
            let state = c[2].trim().to_string();
            // Header rows ("ID OSID ...") have no numeric id and are skipped
            // by the regex; single-word ids alone are not a state row.
            if state.is_empty() {
                return None;
            }
            Some((c[1].to_string(), state))
        })
        .collect()
}

pub fn is_wait_state(state: &str) -> bool {
    state.to_lowercase().contains("wait")
}

#[derive(Clone, Debug, Default)]
pub struct TimerSummary {
    pub count: usize,
    /// Timer count per owning state-machine type.
    pub owners: BTreeMap<String, usize>,
}

pub fn parse_timers(output: &str) -> TimerSummary {
    let mut summary = TimerSummary::default();
    for line in output.lines() {
        if let Some(c) = TIMER_LINE.captures(line) {
            summary.count += 1;
            *summary.owners.entry(c[5].to_string()).or_default() += 1;
        }
    }
    summary
}

fn is_test_runner(arguments: &[ProcessArgument]) -> bool {
    arguments.iter().any(|a| {
        let v = a.value.to_lowercase();
        v.contains("testhost") || v.contains("vstest")
    })
}

/// Timer recommendation; fires only above the threshold and calls out a test
/// host context when the launch arguments show one, since test runners
/// legitimately hold many timers.
pub fn timer_recommendation(
    timers: &TimerSummary,
    arguments: &[ProcessArgument],
) -> Option<String> {
    if timers.count <= TIMER_RECOMMENDATION_THRESHOLD {
        return None;
    }
    let mut owners: Vec<(&String, &usize)> = timers.owners.iter().collect();
    owners.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    let top_owners = owners
        .iter()
        .take(3)
        .map(|(name, count)| format!("{name} ({count})"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut text = format!(
        "{} active timers; top owners: {}",
        timers.count, top_owners
    );
    if is_test_runner(arguments) {
        text.push_str(
            "; the process is running under a test host, where a high timer count can be legitimate",
        );
    } else {
        text.push_str("; check for timers that are created but never disposed");
    }
    Some(text)
}

#[derive(Clone, Debug, Default)]
pub struct HeapStatOutput {
    pub type_stats: BTreeMap<String, TypeStat>,
    pub total_size: u64,
    pub free_size: u64,
    pub total_count: u64,
}

/// Parse `<methodTable> <count> <totalSize> <TypeName>` rows. The `Free` row
/// feeds the free size; totals are summed over all rows.
pub fn parse_heap_stat(output: &str) -> HeapStatOutput {
    let mut result = HeapStatOutput::default();
    for line in output.lines() {
        if let Some(c) = TOTAL_OBJECTS_LINE.captures(line) {
            if let Ok(n) = c[1].parse() {
                result.total_count = n;
            }
            continue;
        }
        let Some(c) = HEAP_STAT_LINE.captures(line) else {
            continue;
        };
        let (Ok(count), Ok(total_size)) = (c[2].parse::<u64>(), c[3].parse::<u64>()) else {
            continue;
        };
        let type_name = c[4].to_string();
        result.total_size += total_size;
        result.total_count += count;
        if type_name == "Free" {
            result.free_size += total_size;
            continue;
        }
        let entry = result.type_stats.entry(type_name).or_default();
        entry.count += count;
        entry.total_size += total_size;
        entry.largest_instance = entry.largest_instance.max(if count > 0 {
            total_size / count
        } else {
            0
        });
        entry.method_table = Some(c[1].to_string());
    }
    result
}

/// Flag Large Object Heap pressure when any type's average instance size
/// exceeds the LOH threshold.
pub fn loh_recommendation(stats: &BTreeMap<String, TypeStat>) -> Option<String> {
    let loh_bytes: u64 = stats
        .values()
        .filter(|s| s.count > 0 && s.total_size / s.count > LOH_THRESHOLD_BYTES)
        .map(|s| s.total_size)
        .sum();
    (loh_bytes > 0).then(|| {
        format!(
            "{loh_bytes} bytes of Large Object Heap allocations; large-object churn causes fragmentation"
        )
    })
}

#[derive(Clone, Debug, Default)]
pub struct SyncBlock {
    pub index: u32,
    pub address: String,
    pub owner_thread_id: String,
    pub recursion: u32,
}

/// Parse the sync-block listing rows:
/// `Index SyncBlock MonitorHeld Recursion ThreadObj OSID ManagedId [Owner]`.
pub fn parse_sync_blocks(output: &str) -> Vec<SyncBlock> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 7 {
                return None;
            }
            let index: u32 = tokens[0].parse().ok()?;
            let address = tokens[1];
            if !address.trim_start_matches("0x").chars().all(|c| c.is_ascii_hexdigit())
                || address.trim_start_matches("0x").len() < 8
            {
                return None;
            }
            let recursion: u32 = tokens[3].parse().ok()?;
            let owner_thread_id: u32 = tokens[6].parse().ok()?;
            Some(SyncBlock {
                index,
                address: address.to_string(),
                recursion,
                owner_thread_id: owner_thread_id.to_string(),
            })
        })
        .collect()
}

/// Reconstruct who-holds/who-waits facts from the sync-block and thread-state
/// listings. A lock is surfaced only when its owner is currently in a wait
/// state; two or more surfaced entries are reported as a likely deadlock.
/// Cycle interpretation is left to the summary layer.
pub fn detect_deadlock(
    sync_blocks: &[SyncBlock],
    thread_states: &[(String, String)],
) -> Option<DeadlockInfo> {
    let states: BTreeMap<&str, &str> = thread_states
        .iter()
        .map(|(id, state)| (id.as_str(), state.as_str()))
        .collect();

    let locks: Vec<HeldLock> = sync_blocks
        .iter()
        .filter_map(|block| {
            let state = states.get(block.owner_thread_id.as_str())?;
            is_wait_state(state).then(|| HeldLock {
                sync_block_index: block.index,
                address: block.address.clone(),
                owner_thread_id: block.owner_thread_id.clone(),
                recursion: block.recursion,
                owner_state: state.to_string(),
            })
        })
        .collect();

    if locks.is_empty() {
        return None;
    }

    let mut blocked_thread_ids: Vec<String> = Vec::new();
    for lock in &locks {
        if !blocked_thread_ids.contains(&lock.owner_thread_id) {
            blocked_thread_ids.push(lock.owner_thread_id.clone());
        }
    }
    let likely_deadlock = locks.len() >= 2;
    Some(DeadlockInfo {
        locks,
        blocked_thread_ids,
        likely_deadlock,
    })
}

/// Parse duplicate-string listing rows (`<count> <totalBytes> <value>`) into
/// a string-stat map.
pub fn parse_string_stats(output: &str) -> BTreeMap<String, StringStat> {
    let mut stats: BTreeMap<String, StringStat> = BTreeMap::new();
    for line in output.lines() {
        if line.trim_start().starts_with("Total") {
            continue;
        }
        let Some(c) = STRING_STAT_LINE.captures(line) else {
            continue;
        };
        let (Ok(count), Ok(total_bytes)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) else {
            continue;
        };
        let value = c[3].trim_matches('"').to_string();
        let entry = stats.entry(value).or_default();
        entry.count += count;
        entry.total_bytes += total_bytes;
    }
    stats
}

static MEMBER_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[\w.<>`\[\]]+\s+)?([\w.<>`\[\]]+)\(?").unwrap());

fn is_type_resolution_exception(exception_type: &str) -> bool {
    exception_type.contains("MissingMethod")
        || exception_type.contains("MissingField")
        || exception_type.contains("TypeLoad")
}

fn normalize_arity(type_name: &str) -> &str {
    type_name.split('`').next().unwrap_or(type_name)
}

/// Diagnose version skew for missing-member exceptions: find the declaring
/// type in the heap statistics and compare its actual members against the one
/// the exception expected.
pub fn analyze_type_resolution(
    exception: &ExceptionInfo,
    type_stats: &BTreeMap<String, TypeStat>,
    session: &DumpSession,
) -> Option<TypeResolutionAnalysis> {
    if !is_type_resolution_exception(&exception.exception_type) {
        return None;
    }

    let reference = MEMBER_REFERENCE
        .captures(&exception.message)
        .map(|c| c[1].to_string())
        .or_else(|| {
            // No quoted member; fall back to the last dotted token.
            exception
                .message
                .split_whitespace()
                .rev()
                .find(|t| t.contains('.'))
                .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '.').to_string())
        })?;

    let (expected_type, expected_member) = reference.rsplit_once('.')?;
    let expected_type = expected_type.to_string();
    let expected_member = expected_member.to_string();

    let found = type_stats.get(&expected_type).or_else(|| {
        let normalized = normalize_arity(&expected_type);
        type_stats
            .iter()
            .find(|(name, _)| normalize_arity(name) == normalized)
            .map(|(_, stat)| stat)
    });

    let mut analysis = TypeResolutionAnalysis {
        expected_type,
        expected_member,
        type_found: found.is_some(),
        ..Default::default()
    };

    let Some(method_table) = found.and_then(|s| s.method_table.clone()) else {
        return Some(analysis);
    };

    match session.execute_command(&format!("!dumpmt -md {method_table}")) {
        Err(e) => log::debug!("method table dump failed: {e:#}"),
        Ok(output) => {
            let members = parse_method_table_members(&output);
            analysis.matching_members = members
                .iter()
                .filter(|m| member_name(m) == analysis.expected_member)
                .cloned()
                .collect();
            analysis.method_found = !analysis.matching_members.is_empty();
        }
    }
    analysis.method_table = Some(method_table);
    Some(analysis)
}

fn member_name(member: &str) -> &str {
    let bare = member.split('(').next().unwrap_or(member);
    bare.rsplit('.').next().unwrap_or(bare)
}

/// Member signatures from a method-table dump: the trailing
/// `Namespace.Type.Member(args)` token of each entry row.
pub fn parse_method_table_members(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 {
                return None;
            }
            // Entry rows start with two hex columns (entry + method desc).
            let hex = |t: &str| {
                t.trim_start_matches("0x").len() >= 8
                    && t.trim_start_matches("0x").chars().all(|c| c.is_ascii_hexdigit())
            };
            if !hex(tokens[0]) || !hex(tokens[1]) {
                return None;
            }
            let signature = tokens.last()?;
            signature.contains('.').then(|| signature.to_string())
        })
        .collect()
}
