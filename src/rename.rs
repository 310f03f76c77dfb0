//! Moving a finished download from its temporary name to its display name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Used when nothing of the requested name survives sanitizing.
pub const INVALID_FILE_NAME: &str = "InvalidFileName_RenameMe";

const MAX_RENAME_ATTEMPTS: u32 = 1000;

/// Renames `temp` to `name` in the same directory and returns where the file
/// ended up.
///
/// An existing file with the same name is never overwritten: " (1)", " (2)"...
/// is appended to the stem instead. On any other failure the file stays where
/// it is and `temp` is returned.
pub fn rename_completed(temp: &Path, name: &str) -> PathBuf {
    let dir = temp.parent().unwrap_or_else(|| Path::new("."));
    let name = sanitize_file_name(name);
    let base = dir.join(&name);

    for attempt in 0..MAX_RENAME_ATTEMPTS {
        let target = if attempt == 0 { base.clone() } else { numbered(&base, attempt) };
        if target.exists() {
            continue;
        }
        match fs::rename(temp, &target) {
            Ok(()) => {
                info!("Download {} completed as {}", temp.display(), target.display());
                return target;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                error!("Failed to rename {} to {}: {}", temp.display(), target.display(), e);
                return temp.to_path_buf();
            }
        }
    }
    warn!("No free name found for {} after {} attempts", base.display(), MAX_RENAME_ATTEMPTS);
    temp.to_path_buf()
}

/// Replaces characters that are not valid in a file name on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim_end();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_' || c == '.') {
        INVALID_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn numbered(base: &Path, n: u32) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    base.with_file_name(name)
}
