//! Prompt construction: a redacting, truncating projection of the report.
//!
//! The model never sees the full report up front; it pages through it with
//! the `report_get` tool instead. The projection drops the analyzer's own
//! recommendations (to avoid biasing the investigation), drops environment
//! variables and sensitive arguments, and caps list sizes.

use crate::report::{CrashAnalysisResult, StackFrame, ThreadInfo};
use serde_json::{json, Value};

pub const MAX_THREADS: usize = 200;
pub const MAX_FAULTING_FRAMES: usize = 60;

/// The first frame from the top of the stack with a real module and
/// function, skipping JIT/placeholder frames; `None` if the whole stack is
/// placeholders.
pub fn meaningful_top_frame(thread: &ThreadInfo) -> Option<&StackFrame> {
    thread
        .call_stack
        .iter()
        .find(|frame| !frame.module.is_empty() && !frame.function.starts_with('['))
}

fn frame_value(frame: &StackFrame) -> Value {
    json!({
        "frameNumber": frame.frame_number,
        "module": frame.module,
        "function": frame.function,
        "source": frame.source,
        "sourceUrl": frame.source_url,
        "isManaged": frame.is_managed,
    })
}

pub fn build_prompt(report: &CrashAnalysisResult) -> Value {
    let mut truncation = json!({
        "threadsCapped": false,
        "callStackCapped": false,
    });

    let threads_capped = report.threads.all.len() > MAX_THREADS;
    if threads_capped {
        truncation["threadsCapped"] = json!(true);
        truncation["maxThreads"] = json!(MAX_THREADS);
    }

    let threads: Vec<Value> = report
        .threads
        .all
        .iter()
        .take(MAX_THREADS)
        .map(|thread| {
            json!({
                "threadId": thread.thread_id,
                "state": thread.state,
                "isFaulting": thread.is_faulting,
                "topFrame": meaningful_top_frame(thread).map(frame_value),
                "waitNote": thread.wait_note,
            })
        })
        .collect();

    // The faulting thread gets its own, larger full-frame cap.
    let faulting_thread = report.threads.faulting_thread().map(|thread| {
        if thread.call_stack.len() > MAX_FAULTING_FRAMES {
            truncation["callStackCapped"] = json!(true);
            truncation["maxFrames"] = json!(MAX_FAULTING_FRAMES);
        }
        json!({
            "threadId": thread.thread_id,
            "state": thread.state,
            "callStack": thread
                .call_stack
                .iter()
                .take(MAX_FAULTING_FRAMES)
                .map(frame_value)
                .collect::<Vec<_>>(),
        })
    });

    let environment = report.environment.as_ref().map(|env| {
        json!({
            "executable": env.executable,
            // Sensitive arguments are dropped outright, not just redacted.
            "arguments": env
                .arguments
                .iter()
                .filter(|a| !a.sensitive)
                .map(|a| a.value.clone())
                .collect::<Vec<_>>(),
            "suspiciousArguments": env.suspicious_arguments,
        })
    });

    json!({
        "summary": {
            // No recommendations: the model draws its own conclusions.
            "text": report.summary.text,
            "warnings": report.summary.warnings,
            "errors": report.summary.errors,
        },
        "exception": report.exception.as_ref().map(|e| json!({
            "exceptionType": e.exception_type,
            "message": e.message,
            "nested": e.nested,
        })),
        "threads": threads,
        "threadSummary": serde_json::to_value(report.threads.summary).unwrap_or(Value::Null),
        "deadlock": serde_json::to_value(&report.threads.deadlock).unwrap_or(Value::Null),
        "faultingThread": faulting_thread,
        "environment": environment,
        "truncation": truncation,
    })
}
