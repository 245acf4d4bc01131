//! Process metadata extraction and redaction.
//!
//! Values extracted from a dump may contain secrets (tokens in command lines,
//! credential environment variables) or injection attempts; everything here is
//! pure validation/redaction over already-extracted text.

use crate::report::{ProcessArgument, ProcessEnvironment};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const REDACTED: &str = "<redacted>";

static SENSITIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(password|passwd|pwd|secret|token|api[-_]?key|connection[-_]?string|credential|bearer|auth)",
    )
    .unwrap()
});

static POINTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{4,16}$").unwrap());

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '>', '<', '`', '\n'];

/// Whether a name (argument flag, environment variable) looks like it holds a
/// sensitive value.
pub fn is_sensitive_name(name: &str) -> bool {
    SENSITIVE_NAME.is_match(name)
}

pub fn redact_value(_value: &str) -> String {
    REDACTED.to_string()
}

pub fn has_shell_metacharacters(value: &str) -> bool {
    value.contains(SHELL_METACHARACTERS)
}

/// Whether a string is a plausibly-sized `0x`-prefixed pointer.
pub fn valid_pointer(value: &str) -> bool {
    POINTER.is_match(value)
}

/// Classify a single argument, redacting `--name=value` forms in place when
/// the name part is sensitive.
pub fn argument_flags(arg: &str) -> ProcessArgument {
    if let Some((name, _value)) = arg.split_once('=') {
        if is_sensitive_name(name) {
            return ProcessArgument {
                value: format!("{name}={REDACTED}"),
                sensitive: true,
            };
        }
    }
    ProcessArgument {
        value: arg.to_string(),
        sensitive: is_sensitive_name(arg) && arg.starts_with('-'),
    }
}

/// Classify an argument list, redacting the value half of sensitive
/// `--flag value` pairs as well as `--flag=value` forms.
pub fn classify_arguments<'a>(args: impl IntoIterator<Item = &'a str>) -> Vec<ProcessArgument> {
    let mut out: Vec<ProcessArgument> = Vec::new();
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push(ProcessArgument {
                value: REDACTED.to_string(),
                sensitive: true,
            });
            redact_next = false;
            continue;
        }
        let classified = argument_flags(arg);
        // A sensitive bare flag consumes its value argument.
        redact_next = classified.sensitive && !classified.value.contains('=');
        out.push(classified);
    }
    out
}

/// Tolerant parser for the debugger's process-environment block output.
///
/// Recognizes the `PEB at <addr>` header, `CommandLine:`, `ImageFile:` and
/// an `Environment:` section of `NAME=value` lines; anything else is skipped.
pub fn parse_peb_output(text: &str) -> ProcessEnvironment {
    let mut peb_address = None;
    let mut executable = None;
    let mut arguments = Vec::new();
    let mut environment = BTreeMap::new();
    let mut in_environment = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("PEB at ") {
            // An implausible pointer is dropped, not carried through.
            let address = rest.trim();
            if valid_pointer(address) {
                peb_address = Some(address.to_string());
            }
            in_environment = false;
        } else if let Some(rest) = trimmed.strip_prefix("ImageFile:") {
            let rest = rest.trim().trim_matches('\'');
            if !rest.is_empty() {
                executable = Some(rest.to_string());
            }
            in_environment = false;
        } else if let Some(rest) = trimmed.strip_prefix("CommandLine:") {
            let rest = rest.trim().trim_matches('\'');
            let mut parts = rest.split_whitespace();
            if executable.is_none() {
                executable = parts.next().map(ToOwned::to_owned);
            } else {
                parts.next();
            }
            arguments = classify_arguments(parts);
            in_environment = false;
        } else if trimmed == "Environment:" {
            in_environment = true;
        } else if in_environment {
            if let Some((name, value)) = trimmed.split_once('=') {
                let value = if is_sensitive_name(name) {
                    redact_value(value)
                } else {
                    value.to_string()
                };
                environment.insert(name.to_string(), value);
            } else if !trimmed.is_empty() {
                in_environment = false;
            }
        }
    }

    let suspicious_arguments = arguments
        .iter()
        .filter(|a| !a.sensitive && has_shell_metacharacters(&a.value))
        .map(|a| a.value.clone())
        .collect();

    ProcessEnvironment {
        peb_address,
        executable,
        arguments,
        environment,
        suspicious_arguments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_names_are_detected() {
        assert!(is_sensitive_name("--password"));
        assert!(is_sensitive_name("API_KEY"));
        assert!(is_sensitive_name("ConnectionString"));
        assert!(is_sensitive_name("FOO_TOKEN"));
        assert!(!is_sensitive_name("verbose"));
        assert!(!is_sensitive_name("PATH"));
    }

    #[test]
    fn sensitive_flag_value_is_redacted_in_place() {
        let arg = argument_flags("--password=hunter2");
        assert!(arg.sensitive);
        assert!(!arg.value.contains("hunter2"));
        assert!(arg.value.contains(REDACTED));
    }

    #[test]
    fn sensitive_flag_pair_redacts_following_value() {
        let args = classify_arguments(["--token", "abc123", "--verbose"]);
        assert!(args[0].sensitive);
        assert_eq!(args[1].value, REDACTED);
        assert!(args[1].sensitive);
        assert!(!args[2].sensitive);
    }

    #[test]
    fn shell_metacharacters_are_flagged() {
        assert!(has_shell_metacharacters("rm -rf $(x)"));
        assert!(has_shell_metacharacters("a|b"));
        assert!(has_shell_metacharacters("`whoami`"));
        assert!(!has_shell_metacharacters("--log-level=debug"));
    }

    #[test]
    fn pointer_validation() {
        assert!(valid_pointer("0x0000000100000000"));
        assert!(valid_pointer("0x1000"));
        assert!(!valid_pointer("0x"));
        assert!(!valid_pointer("100000000"));
        assert!(!valid_pointer("0xzzzz"));
        assert!(!valid_pointer("0x00000001000000001234"));
    }

    #[test]
    fn peb_output_parses_and_redacts() {
        let text = "\
PEB at 0x00000000003c9000
ImageFile: '/usr/bin/myapp'
CommandLine: 'myapp --password=hunter2 run $(evil)'
Environment:
    PATH=/usr/bin
    FOO_TOKEN=secret123
    HOME=/home/user
";
        let env = parse_peb_output(text);
        assert_eq!(env.peb_address.as_deref(), Some("0x00000000003c9000"));
        assert_eq!(env.executable.as_deref(), Some("/usr/bin/myapp"));
        assert!(env.arguments.iter().any(|a| a.sensitive));
        assert!(!serde_json::to_string(&env).unwrap().contains("hunter2"));
        assert_eq!(env.environment.get("FOO_TOKEN").unwrap(), REDACTED);
        assert_eq!(env.environment.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(env.suspicious_arguments, vec!["$(evil)"]);
    }

    #[test]
    fn implausible_peb_pointer_is_dropped() {
        let env = parse_peb_output("PEB at garbage\nImageFile: '/usr/bin/myapp'\n");
        assert!(env.peb_address.is_none());
        assert_eq!(env.executable.as_deref(), Some("/usr/bin/myapp"));

        let env = parse_peb_output("PEB at 0x\n");
        assert!(env.peb_address.is_none());
    }
}
