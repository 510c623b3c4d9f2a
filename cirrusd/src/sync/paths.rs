use std::path::{Component, Path, PathBuf};

use thiserror::Error;

const MAX_WORKSPACE_DIR_NAME: usize = 50;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a normalized relative path ("Docs/a.txt") under the workspace root.
pub fn local_path_for(root: &Path, rel_path: &str) -> Result<PathBuf, PathError> {
    if rel_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Extracts the forward-slash relative path of `path` under `root`, or None
/// when `path` is outside the root or is the root itself.
pub fn rel_path_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rel = relative.to_string_lossy().replace('\\', "/");
    if rel.is_empty() { None } else { Some(rel) }
}

/// Replaces characters the host filesystem rejects with underscores.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Directory name for a workspace under the sync root:
/// `<id>_<sanitized-name>`, capped at 50 characters and never empty.
pub fn workspace_dir_name(id: i64, name: &str) -> String {
    let mut out = format!("{id}_{}", sanitize_file_name(name));
    if out.len() > MAX_WORKSPACE_DIR_NAME {
        let mut cut = MAX_WORKSPACE_DIR_NAME;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}
