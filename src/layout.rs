use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

const RESERVED_CHARS: &[char] = &['?', '!', '.', ':', '\\', '/', '<', '>', '|', '*', '"', ','];
const MAX_NAME_CHARS: usize = 100;

pub const ARTIFACT_EXTENSION: &str = "epub";

/// Strips reserved characters, joins words with `-` and caps the length.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !RESERVED_CHARS.contains(c))
        .map(|c| if c == ' ' { '-' } else { c })
        .take(MAX_NAME_CHARS)
        .collect()
}

pub fn work_dir(output_dir: &Path, work_name: &str) -> PathBuf {
    output_dir.join(sanitize_name(work_name))
}

pub fn volume_file_name(volume_name: &str, work_name: &str) -> String {
    format!(
        "{}.{ARTIFACT_EXTENSION}",
        sanitize_name(&format!("{volume_name}-{work_name}"))
    )
}

pub fn volume_path(output_dir: &Path, work_name: &str, volume_name: &str) -> PathBuf {
    work_dir(output_dir, work_name).join(volume_file_name(volume_name, work_name))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::artifact_io(path, "artifact path must have a parent"))?;
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
        .map_err(|err| SyncError::artifact_io(parent, format!("create directory: {err}")))
}
