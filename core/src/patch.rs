//! Whitelisted doc-patch service (spec §4.H).
//!
//! Built on top of [`conductor_apply_patch`]'s hunk-parsing/chunk-application
//! engine (the same grammar the agent-facing patch tool uses) but scoped
//! here to a caller-supplied whitelist and normalized input, never invoked
//! directly by an agent process.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use conductor_apply_patch::parse_patch;
use conductor_apply_patch::unified_diff_from_chunks;
use conductor_apply_patch::Hunk;
use conductor_protocol::ConductorError;
use conductor_protocol::Result;

/// Strips a leading `a/` or `b/` prefix, the convention both GNU diff and
/// the app-server envelope use for the patch-relative path.
fn strip_ab_prefix(path: &str) -> &str {
    path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")).unwrap_or(path)
}

/// Converts a GNU-style unified diff (`--- a/X` / `+++ b/X` / `@@ ... @@`)
/// into the `*** Begin Patch` envelope grammar [`conductor_apply_patch`]
/// understands. Hunk header line-number ranges are dropped: the engine only
/// needs the bare `@@` separator plus the leading `+`/`-`/` ` body lines,
/// which share the same convention as GNU unified diff.
fn gnu_diff_to_envelope(text: &str) -> Result<String> {
    let mut out = String::from("*** Begin Patch\n");
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    let mut saw_file = false;
    while i < lines.len() {
        let line = lines[i];
        if let Some(old_path) = line.strip_prefix("--- ") {
            let old_path = old_path.trim();
            i += 1;
            let new_path = lines
                .get(i)
                .and_then(|l| l.strip_prefix("+++ "))
                .ok_or_else(|| ConductorError::validation("malformed unified diff: missing +++ header"))?
                .trim();
            i += 1;

            let is_delete = new_path == "/dev/null";
            let is_add = old_path == "/dev/null";
            let path = if is_delete {
                strip_ab_prefix(old_path)
            } else {
                strip_ab_prefix(new_path)
            };

            if is_delete {
                out.push_str(&format!("*** Delete File: {path}\n"));
                saw_file = true;
                while i < lines.len() && !lines[i].starts_with("--- ") {
                    i += 1;
                }
                continue;
            }

            if is_add {
                out.push_str(&format!("*** Add File: {path}\n"));
                saw_file = true;
                while i < lines.len() && !lines[i].starts_with("--- ") {
                    let body = lines[i];
                    if let Some(added) = body.strip_prefix('+') {
                        out.push('+');
                        out.push_str(added);
                        out.push('\n');
                    }
                    i += 1;
                }
                continue;
            }

            out.push_str(&format!("*** Update File: {path}\n"));
            saw_file = true;
            while i < lines.len() && !lines[i].starts_with("--- ") {
                let body = lines[i];
                if body.starts_with("@@") {
                    out.push_str("@@\n");
                } else if body.starts_with("\\ No newline at end of file") {
                    // not representable in the envelope grammar; drop it.
                } else if body.starts_with(['+', '-', ' ']) {
                    out.push_str(body);
                    out.push('\n');
                }
                i += 1;
            }
            continue;
        }
        i += 1;
    }
    if !saw_file {
        return Err(ConductorError::validation("unified diff contained no file headers"));
    }
    out.push_str("*** End Patch");
    Ok(out)
}

/// Extracts the target paths an envelope-format patch touches, without
/// fully parsing chunk bodies (cheap pre-check ahead of the real parse).
fn envelope_target_paths(hunks: &[Hunk]) -> Vec<String> {
    hunks
        .iter()
        .map(|h| match h {
            Hunk::AddFile { path, .. } => path.display().to_string(),
            Hunk::DeleteFile { path } => path.display().to_string(),
            Hunk::UpdateFile { path, move_path, .. } => {
                move_path.clone().unwrap_or_else(|| path.clone()).display().to_string()
            }
        })
        .collect()
}

/// Accepts either grammar, returns the envelope-normalized text plus the
/// set of target paths the patch claims to modify (spec §4.H).
pub fn normalize_patch_text(text: &str) -> Result<(String, Vec<String>)> {
    let trimmed = text.trim();
    let envelope = if trimmed.starts_with("*** Begin Patch") {
        trimmed.to_string()
    } else if trimmed.starts_with("--- ") {
        gnu_diff_to_envelope(trimmed)?
    } else {
        return Err(ConductorError::validation(
            "patch text is neither a unified diff nor an apply-patch envelope",
        ));
    };

    let hunks = parse_patch(&envelope).map_err(|e| ConductorError::patch_rejected(e.to_string()))?;
    let targets = envelope_target_paths(&hunks);
    Ok((envelope, targets))
}

/// Validates every target resolves (after normalization) to a path in
/// `whitelist`. Fails atomically: on any violation, nothing is touched.
pub fn ensure_patch_targets_allowed(targets: &[String], whitelist: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let allowed: HashSet<PathBuf> = whitelist.iter().map(|p| normalize_rel(p)).collect();
    let mut normalized = Vec::with_capacity(targets.len());
    for target in targets {
        let rel = normalize_rel(Path::new(strip_ab_prefix(target)));
        if !allowed.contains(&rel) {
            return Err(ConductorError::patch_rejected(format!(
                "patch target {target} is not in the whitelist"
            )));
        }
        normalized.push(rel);
    }
    Ok(normalized)
}

fn normalize_rel(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Side-effect-free: computes post-apply content for each touched file
/// without writing anything.
pub fn preview_patch(repo_root: &Path, envelope_text: &str, targets: &[PathBuf]) -> Result<BTreeMap<PathBuf, String>> {
    let hunks = parse_patch(envelope_text).map_err(|e| ConductorError::patch_rejected(e.to_string()))?;
    let mut previews = BTreeMap::new();
    for hunk in &hunks {
        match hunk {
            Hunk::AddFile { path, contents } => {
                let rel = relativize(repo_root, path, targets)?;
                previews.insert(rel, contents.clone());
            }
            Hunk::DeleteFile { path } => {
                let rel = relativize(repo_root, path, targets)?;
                previews.insert(rel, String::new());
            }
            Hunk::UpdateFile { path, chunks, .. } => {
                let abs = repo_root.join(relativize(repo_root, path, targets)?);
                let diff = unified_diff_from_chunks(&abs, chunks).map_err(|e| ConductorError::patch_rejected(e.to_string()))?;
                let rel = relativize(repo_root, path, targets)?;
                previews.insert(rel, diff.content().to_string());
            }
        }
    }
    Ok(previews)
}

fn relativize(_repo_root: &Path, path: &Path, targets: &[PathBuf]) -> Result<PathBuf> {
    let candidate = normalize_rel(Path::new(strip_ab_prefix(&path.display().to_string())));
    if targets.contains(&candidate) {
        return Ok(candidate);
    }
    // The hunk path may already be whitelist-relative with no a/ b/ prefix.
    if targets.iter().any(|t| t == &candidate) {
        return Ok(candidate);
    }
    Err(ConductorError::patch_rejected(format!(
        "patch hunk path {} is not among the pre-validated targets",
        path.display()
    )))
}

/// Applies an already whitelist-checked patch to `repo_root`. Callers must
/// have run [`ensure_patch_targets_allowed`] first.
pub fn apply_patch_file(repo_root: &Path, envelope_text: &str, targets: &[PathBuf]) -> Result<()> {
    let hunks = parse_patch(envelope_text).map_err(|e| ConductorError::patch_rejected(e.to_string()))?;
    for hunk in &hunks {
        let touched = match hunk {
            Hunk::AddFile { path, .. } | Hunk::DeleteFile { path } => path.clone(),
            Hunk::UpdateFile { path, move_path, .. } => move_path.clone().unwrap_or_else(|| path.clone()),
        };
        relativize(repo_root, &touched, targets)?;
    }

    let absolute_hunks = rebase_hunks(hunks, repo_root);
    conductor_apply_patch::apply_hunks_to_files(&absolute_hunks)
        .map_err(|e| ConductorError::patch_rejected(e.to_string()))?;
    Ok(())
}

fn rebase_hunks(hunks: Vec<Hunk>, repo_root: &Path) -> Vec<Hunk> {
    hunks
        .into_iter()
        .map(|h| match h {
            Hunk::AddFile { path, contents } => Hunk::AddFile {
                path: rebase(repo_root, &path),
                contents,
            },
            Hunk::DeleteFile { path } => Hunk::DeleteFile {
                path: rebase(repo_root, &path),
            },
            Hunk::UpdateFile { path, move_path, chunks } => Hunk::UpdateFile {
                path: rebase(repo_root, &path),
                move_path: move_path.map(|p| rebase(repo_root, &p)),
                chunks,
            },
        })
        .collect()
}

fn rebase(repo_root: &Path, path: &Path) -> PathBuf {
    let stripped = strip_ab_prefix(&path.display().to_string());
    repo_root.join(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn normalizes_gnu_diff_to_envelope() {
        let gnu = "--- a/TODO.md\n+++ b/TODO.md\n@@ -1,2 +1,3 @@\n # TODO\n-- [ ] Write tests\n+- [ ] Write tests\n+- [ ] Write docs\n";
        let (envelope, targets) = normalize_patch_text(gnu).expect("normalize");
        assert!(envelope.starts_with("*** Begin Patch"));
        assert_eq!(targets, vec!["TODO.md".to_string()]);
    }

    #[test]
    fn rejects_target_outside_whitelist() {
        let gnu = "--- a/etc/passwd\n+++ b/etc/passwd\n@@ -1 +1 @@\n-root\n+pwned\n";
        let (_, targets) = normalize_patch_text(gnu).expect("normalize");
        let whitelist = vec![PathBuf::from("TODO.md")];
        let result = ensure_patch_targets_allowed(&targets, &whitelist);
        assert!(matches!(result, Err(ConductorError::PatchRejected(_))));
    }

    #[test]
    fn apply_patch_file_writes_through_whitelist() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("TODO.md"), "# TODO\n- [ ] Write tests\n").expect("seed");
        let gnu = "--- a/TODO.md\n+++ b/TODO.md\n@@ -1,2 +1,3 @@\n # TODO\n-- [ ] Write tests\n+- [ ] Write tests\n+- [ ] Write docs\n";
        let (envelope, targets) = normalize_patch_text(gnu).expect("normalize");
        let whitelist = vec![PathBuf::from("TODO.md")];
        let normalized = ensure_patch_targets_allowed(&targets, &whitelist).expect("allowed");
        apply_patch_file(dir.path(), &envelope, &normalized).expect("apply");
        let contents = fs::read_to_string(dir.path().join("TODO.md")).expect("read");
        assert_eq!(contents, "# TODO\n- [ ] Write tests\n- [ ] Write docs\n");
    }
}
