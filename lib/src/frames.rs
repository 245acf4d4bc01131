//! Stack-frame line parsing.
//!
//! Debugger backtrace output is loosely specified; these parsers recover what
//! they can and silently skip anything they don't recognize. A malformed line
//! never aborts parsing of the rest of a transcript.

use crate::report::StackFrame;
use regex::Regex;
use std::sync::LazyLock;

// Shapes are tried most specific first.

// frame #0: 0x... SP=0x... Module`Function + 12 at /src/app.cs:42
static FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^\s*\*?\s*frame\s\#(\d+):\s+(0x[0-9a-fA-F]+)\s+SP=(0x[0-9a-fA-F]+)\s+
          ([^`\s]+)`(\[[^\]]+\]|\S+)(?:\s+\+\s+\d+)?(?:\s+at\s+(\S+))?\s*$",
    )
    .unwrap()
});

// frame #1: 0x... SP=0x... raw_symbol + 12 at file:line
static SYMBOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^\s*\*?\s*frame\s\#(\d+):\s+(0x[0-9a-fA-F]+)\s+SP=(0x[0-9a-fA-F]+)\s+
          (\[[^\]]+\]|\S+)(?:\s+\+\s+\d+)?(?:\s+at\s+(\S+))?\s*$",
    )
    .unwrap()
});

// frame #2: 0x... SP=0x...
static JIT_WITH_SP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\*?\s*frame #(\d+):\s+(0x[0-9a-fA-F]+)\s+SP=(0x[0-9a-fA-F]+)\s*$").unwrap()
});

// frame #3: 0x... 0x...   (instruction pointer repeated, no SP= token)
static JIT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\*?\s*frame #(\d+):\s+(0x[0-9a-fA-F]+)\s+(0x[0-9a-fA-F]+)\s*$").unwrap()
});

// thread #1, name = 'main', stop reason = ...
static THREAD_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\*?)\s*thread #(\d+)(?:[,:]\s*(.*))?$").unwrap());

fn is_placeholder(function: &str) -> bool {
    function.starts_with('[')
}

/// Parse one line of stack-trace text into a frame, or `None` if the line
/// matches no recognized shape.
pub fn parse_frame_line(line: &str) -> Option<StackFrame> {
    if let Some(c) = FULL.captures(line) {
        let function = c[5].to_string();
        // A bracketed symbol is a managed placeholder from another dialect,
        // never a real native module member.
        let managed = is_placeholder(&function);
        return Some(StackFrame {
            frame_number: c[1].parse().ok()?,
            instruction_pointer: c[2].to_string(),
            stack_pointer: Some(c[3].to_string()),
            module: if managed { String::new() } else { c[4].to_string() },
            function,
            source: c.get(6).map(|m| m.as_str().to_string()),
            is_managed: managed,
            ..Default::default()
        });
    }

    if let Some(c) = JIT_WITH_SP.captures(line) {
        let addr = c[2].to_string();
        return Some(StackFrame {
            frame_number: c[1].parse().ok()?,
            function: format!("[JIT Code @ {addr}]"),
            instruction_pointer: addr,
            stack_pointer: Some(c[3].to_string()),
            is_managed: true,
            ..Default::default()
        });
    }

    if let Some(c) = SYMBOL.captures(line) {
        let symbol = c[4].to_string();
        let managed = is_placeholder(&symbol);
        return Some(StackFrame {
            frame_number: c[1].parse().ok()?,
            instruction_pointer: c[2].to_string(),
            stack_pointer: Some(c[3].to_string()),
            module: String::new(),
            // Raw symbol with no module attribution; keep it visibly synthetic.
            function: if managed { symbol } else { format!("[{symbol}]") },
            source: c.get(5).map(|m| m.as_str().to_string()),
            is_managed: managed,
            ..Default::default()
        });
    }

    if let Some(c) = JIT_BARE.captures(line) {
        let addr = c[2].to_string();
        return Some(StackFrame {
            frame_number: c[1].parse().ok()?,
            function: format!("[JIT Code @ {addr}]"),
            instruction_pointer: addr,
            stack_pointer: None,
            is_managed: true,
            ..Default::default()
        });
    }

    None
}

#[derive(Clone, Debug, Default)]
pub struct ThreadHeader {
    pub thread_id: String,
    /// The `*`-marked (selected) thread is the faulting candidate.
    pub is_selected: bool,
    pub detail: String,
}

/// Split an all-threads backtrace transcript into per-thread frame lists.
///
/// Lines that are neither thread headers nor recognizable frames are skipped.
pub fn parse_stack_transcript(transcript: &str) -> Vec<(ThreadHeader, Vec<StackFrame>)> {
    let mut threads: Vec<(ThreadHeader, Vec<StackFrame>)> = Vec::new();

    for line in transcript.lines() {
        if let Some(c) = THREAD_HEADER.captures(line) {
            threads.push((
                ThreadHeader {
                    thread_id: c[2].to_string(),
                    is_selected: !c[1].is_empty(),
                    detail: c.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
                },
                Vec::new(),
            ));
            continue;
        }
        if let Some(frame) = parse_frame_line(line) {
            if let Some((_, frames)) = threads.last_mut() {
                frames.push(frame);
            }
        }
    }

    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_form_with_module_and_source() {
        let frame = parse_frame_line(
            "  * frame #0: 0x0000000100000000 SP=0x0000000000001000 MyApp`Main + 12 at /src/app.cs:42",
        )
        .unwrap();
        assert_eq!(frame.frame_number, 0);
        assert_eq!(frame.module, "MyApp");
        assert!(frame.function.contains("Main"));
        assert_eq!(frame.source.as_deref(), Some("/src/app.cs:42"));
        assert_eq!(frame.stack_pointer.as_deref(), Some("0x0000000000001000"));
        assert!(!frame.is_managed);
    }

    #[test]
    fn offset_is_stripped_from_function() {
        let frame = parse_frame_line(
            "    frame #1: 0x0000000100000100 SP=0x0000000000002000 libc`malloc + 64",
        )
        .unwrap();
        assert_eq!(frame.function, "malloc");
    }

    #[test]
    fn bare_symbol_is_bracketed() {
        let frame = parse_frame_line(
            "    frame #1: 0x0000000100000100 SP=0x0000000000002000 _start + 8",
        )
        .unwrap();
        assert_eq!(frame.module, "");
        assert_eq!(frame.function, "[_start]");
        assert!(!frame.is_managed);
    }

    #[test]
    fn sp_only_line_is_jit_placeholder() {
        let frame =
            parse_frame_line("    frame #2: 0x0000000100000200 SP=0x0000000000003000").unwrap();
        assert!(frame.is_managed);
        assert!(frame.function.contains("[JIT Code"));
        assert!(frame.stack_pointer.is_some());
    }

    #[test]
    fn repeated_address_line_is_jit_without_sp() {
        let frame =
            parse_frame_line("    frame #3: 0x0000000100000300 0x0000000100000300").unwrap();
        assert!(frame.is_managed);
        assert!(frame.function.contains("[JIT Code"));
        assert!(frame.stack_pointer.is_none());
    }

    #[test]
    fn bracketed_symbol_forces_managed_and_empty_module() {
        let frame = parse_frame_line(
            "    frame #4: 0x0000000100000400 SP=0x0000000000004000 Foo`[Managed to Native Transition]",
        )
        .unwrap();
        assert!(frame.is_managed);
        assert_eq!(frame.module, "");
        assert_eq!(frame.function, "[Managed to Native Transition]");
    }

    #[test]
    fn unrecognized_line_yields_none() {
        assert!(parse_frame_line("random text").is_none());
        assert!(parse_frame_line("frame #x: garbage").is_none());
        assert!(parse_frame_line("").is_none());
    }

    #[test]
    fn transcript_splits_on_thread_headers() {
        let transcript = "\
thread #1, name = 'main'
    frame #0: 0x0000000100000000 SP=0x0000000000001000 MyApp`Main + 12 at /src/app.cs:42
    this line is noise
* thread #2, stop reason = signal SIGSEGV
    frame #0: 0x0000000100000200 SP=0x0000000000003000
";
        let threads = parse_stack_transcript(transcript);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].0.thread_id, "1");
        assert!(!threads[0].0.is_selected);
        assert_eq!(threads[0].1.len(), 1);
        assert!(threads[1].0.is_selected);
        assert_eq!(threads[1].1.len(), 1);
    }
}
