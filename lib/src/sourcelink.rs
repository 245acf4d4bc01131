//! Source Link resolution: mapping a managed frame's source file to a
//! browsable repository URL.
//!
//! The primary path reads the embedded Source Link document out of the
//! assembly's symbol file; the fallback builds a blob URL from assembly-level
//! repository metadata. Failure at every step is the defined "leave unset"
//! outcome, never an error.

use crate::ai::jsonutil::json_first_value;
use crate::report::{AssemblyVersionInfo, StackFrame};
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Fill `source_url`/`source_provider` on a frame, or leave them unset.
pub fn resolve(
    frame: &mut StackFrame,
    assemblies: &[AssemblyVersionInfo],
    symbol_search_paths: &[PathBuf],
) {
    // Native frames never get a URL, regardless of metadata present for other
    // assemblies in the report.
    if !frame.is_managed {
        return;
    }
    let Some((file, line)) = frame.source_file_and_line() else {
        return;
    };
    let file = file.to_string();

    if !frame.module.is_empty() {
        if let Some(url) = resolve_from_symbols(&frame.module, &file, line, symbol_search_paths) {
            frame.source_provider = Some(provider_for_url(&url));
            frame.source_url = Some(url);
            return;
        }
    }

    // Fallback: assembly-level repository metadata, only when the symbol file
    // yielded nothing.
    let Some(assembly) = find_assembly(frame, assemblies) else {
        return;
    };
    if let Some(url) = resolve_from_repository(assembly, &file, line) {
        frame.source_provider = Some(provider_for_url(&url));
        frame.source_url = Some(url);
    }
}

fn find_assembly<'a>(
    frame: &StackFrame,
    assemblies: &'a [AssemblyVersionInfo],
) -> Option<&'a AssemblyVersionInfo> {
    if frame.module.is_empty() {
        return None;
    }
    let module = frame.module.to_lowercase();
    let module = module
        .strip_suffix(".dll")
        .or_else(|| module.strip_suffix(".exe"))
        .unwrap_or(&module);
    assemblies.iter().find(|a| {
        let name = a.name.to_lowercase();
        let name = name
            .strip_suffix(".dll")
            .or_else(|| name.strip_suffix(".exe"))
            .unwrap_or(&name);
        name == module
    })
}

/// Primary path: locate `<module>.pdb` under the search paths (order
/// significant, first match wins) and instantiate its Source Link template.
fn resolve_from_symbols(
    module: &str,
    file: &str,
    line: Option<u32>,
    search_paths: &[PathBuf],
) -> Option<String> {
    let pdb = search_paths
        .iter()
        .map(|dir| dir.join(format!("{module}.pdb")))
        .find(|p| p.is_file())?;
    match read_source_link(&pdb) {
        Err(e) => {
            log::debug!("unreadable symbol file {}: {e:#}", pdb.display());
            None
        }
        Ok(documents) => {
            let url = instantiate_template(&documents, file)?;
            Some(append_line(url, line))
        }
    }
}

/// Extract the `{"documents": {...}}` Source Link JSON embedded in a symbol
/// file, returning the template -> URL pairs.
fn read_source_link(pdb: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let file = std::fs::File::open(pdb).context("opening symbol file")?;
    let map = unsafe { memmap2::Mmap::map(&file) }.context("mapping symbol file")?;

    const MARKER: &[u8] = b"{\"documents\"";
    let start = map
        .windows(MARKER.len())
        .position(|w| w == MARKER)
        .context("no source link document")?;
    // The document is a short JSON object embedded in binary data; parse the
    // first complete value and ignore whatever follows.
    let tail = String::from_utf8_lossy(&map[start..]);
    let value = json_first_value(&tail).context("malformed source link document")?;
    let documents = value
        .get("documents")
        .and_then(|d| d.as_object())
        .context("source link document has no documents map")?;
    Ok(documents
        .iter()
        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
        .collect())
}

/// Match a source file against `prefix*` templates and substitute into the
/// URL's `*` placeholder. An exact (wildcard-free) entry must match the whole
/// path.
fn instantiate_template(documents: &[(String, String)], file: &str) -> Option<String> {
    let normalized = file.replace('\\', "/");
    for (template, url) in documents {
        let template = template.replace('\\', "/");
        match template.strip_suffix('*') {
            Some(prefix) => {
                if let Some(rest) = normalized.strip_prefix(prefix) {
                    return Some(url.replace('*', rest));
                }
            }
            None => {
                if normalized == template {
                    return Some(url.clone());
                }
            }
        }
    }
    None
}

/// Fallback path: repository URL + commit hash from the assembly metadata.
fn resolve_from_repository(
    assembly: &AssemblyVersionInfo,
    file: &str,
    line: Option<u32>,
) -> Option<String> {
    if let Some(url) = &assembly.source_url {
        return Some(append_line(url.clone(), line));
    }
    let repository = assembly.repository_url.as_deref()?.trim_end_matches('/');
    let commit = assembly.commit_hash.as_deref()?;
    let path = normalize_source_path(file);
    Some(append_line(
        format!("{repository}/blob/{commit}/{path}"),
        line,
    ))
}

/// Strip the `/_/` build-root rewrite prefix some toolchains bake into paths,
/// and normalize separators.
fn normalize_source_path(file: &str) -> String {
    let normalized = file.replace('\\', "/");
    let stripped = normalized
        .strip_prefix("/_/")
        .or_else(|| normalized.strip_prefix("_/"))
        .unwrap_or(&normalized);
    stripped.trim_start_matches('/').to_string()
}

fn append_line(url: String, line: Option<u32>) -> String {
    match line {
        Some(line) => format!("{url}#L{line}"),
        None => url,
    }
}

pub fn provider_for_url(url: &str) -> String {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("");
    if host.contains("github") {
        "GitHub".to_string()
    } else if host.contains("gitlab") {
        "GitLab".to_string()
    } else if host.contains("bitbucket") {
        "Bitbucket".to_string()
    } else if host.contains("dev.azure.com") || host.contains("visualstudio.com") {
        "Azure DevOps".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembly() -> AssemblyVersionInfo {
        AssemblyVersionInfo {
            name: "MyApp".into(),
            repository_url: Some("https://github.com/org/repo".into()),
            commit_hash: Some("abc123".into()),
            ..Default::default()
        }
    }

    fn managed_frame(source: &str) -> StackFrame {
        StackFrame {
            module: "MyApp".into(),
            function: "Main".into(),
            source: Some(source.into()),
            is_managed: true,
            ..Default::default()
        }
    }

    #[test]
    fn fallback_builds_blob_url() {
        let mut frame = managed_frame("/_/src/x/y.cs:38");
        resolve(&mut frame, &[assembly()], &[]);
        assert_eq!(
            frame.source_url.as_deref(),
            Some("https://github.com/org/repo/blob/abc123/src/x/y.cs#L38")
        );
        assert_eq!(frame.source_provider.as_deref(), Some("GitHub"));
    }

    #[test]
    fn native_frame_never_gets_a_url() {
        let mut frame = managed_frame("/_/src/x/y.cs:38");
        frame.is_managed = false;
        resolve(&mut frame, &[assembly()], &[]);
        assert!(frame.source_url.is_none());
        assert!(frame.source_provider.is_none());
    }

    #[test]
    fn missing_metadata_leaves_fields_unset() {
        let mut frame = managed_frame("/src/app.cs:1");
        resolve(
            &mut frame,
            &[AssemblyVersionInfo {
                name: "MyApp".into(),
                ..Default::default()
            }],
            &[],
        );
        assert!(frame.source_url.is_none());

        // No matching assembly at all.
        let mut frame = managed_frame("/src/app.cs:1");
        resolve(&mut frame, &[], &[]);
        assert!(frame.source_url.is_none());
    }

    #[test]
    fn pre_resolved_source_url_is_used() {
        let mut frame = managed_frame("/src/app.cs:7");
        let assembly = AssemblyVersionInfo {
            name: "MyApp".into(),
            source_url: Some("https://gitlab.com/org/repo/-/blob/x/app.cs".into()),
            ..Default::default()
        };
        resolve(&mut frame, &[assembly], &[]);
        assert_eq!(
            frame.source_url.as_deref(),
            Some("https://gitlab.com/org/repo/-/blob/x/app.cs#L7")
        );
        assert_eq!(frame.source_provider.as_deref(), Some("GitLab"));
    }

    #[test]
    fn provider_names_derive_from_host() {
        assert_eq!(provider_for_url("https://github.com/a/b"), "GitHub");
        assert_eq!(provider_for_url("https://gitlab.example.net/a"), "GitLab");
        assert_eq!(provider_for_url("https://bitbucket.org/a"), "Bitbucket");
        assert_eq!(provider_for_url("https://dev.azure.com/a"), "Azure DevOps");
        assert_eq!(provider_for_url("https://sources.internal/a"), "sources.internal");
    }

    #[test]
    fn template_instantiation_matches_wildcard_prefix() {
        let documents = vec![(
            "C:\\src\\*".to_string(),
            "https://raw.githubusercontent.com/org/repo/abc/*".to_string(),
        )];
        assert_eq!(
            instantiate_template(&documents, "C:\\src\\lib\\a.cs").as_deref(),
            Some("https://raw.githubusercontent.com/org/repo/abc/lib/a.cs")
        );
        assert!(instantiate_template(&documents, "D:\\other\\a.cs").is_none());
    }

    #[test]
    fn primary_path_reads_embedded_source_link() {
        let dir = std::env::temp_dir().join(format!("sourcelink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut bytes = vec![0u8; 64];
        bytes.extend_from_slice(
            br#"{"documents": {"/_/*": "https://github.com/org/repo/raw/abc123/*"}}"#,
        );
        bytes.extend_from_slice(&[0u8; 32]);
        std::fs::write(dir.join("MyApp.pdb"), &bytes).unwrap();

        let mut frame = managed_frame("/_/src/x/y.cs:38");
        resolve(&mut frame, &[assembly()], &[dir.clone()]);
        assert_eq!(
            frame.source_url.as_deref(),
            Some("https://github.com/org/repo/raw/abc123/src/x/y.cs#L38")
        );
        assert_eq!(frame.source_provider.as_deref(), Some("GitHub"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unreadable_symbols_fall_back_to_repository_metadata() {
        let dir = std::env::temp_dir().join(format!("sourcelink-junk-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("MyApp.pdb"), b"no source link here").unwrap();

        let mut frame = managed_frame("/_/src/x/y.cs:38");
        resolve(&mut frame, &[assembly()], &[dir.clone()]);
        assert_eq!(
            frame.source_url.as_deref(),
            Some("https://github.com/org/repo/blob/abc123/src/x/y.cs#L38")
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
