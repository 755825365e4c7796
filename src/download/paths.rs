//! Temporary and final file paths, filename sanitization and URL-derived names.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::constants::{FALLBACK_TEMP_SUFFIX, TEMP_SUFFIX};
use crate::task::RenamePolicy;

/// Path of the in-progress file: `<dir>/<filename>.part`.
#[must_use]
pub fn temp_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(format!("{filename}{TEMP_SUFFIX}"))
}

/// Path used when a stale temp file cannot be deleted: `<dir>/<filename>.1.part`.
#[must_use]
pub fn fallback_temp_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(format!("{filename}{FALLBACK_TEMP_SUFFIX}"))
}

/// Final path for a finished transfer under `policy`.
#[must_use]
pub fn destination_path(dir: &Path, filename: &str, policy: RenamePolicy) -> PathBuf {
    match policy {
        RenamePolicy::Overwrite => dir.join(filename),
        RenamePolicy::AppendIndex => unique_path(dir, filename, 2),
    }
}

/// First free path among `name.ext`, `name_<start>.ext`, `name_<start+1>.ext`, ...
///
/// Example with `suffix_start = 2`: `file.iso`, then `file_2.iso`, `file_3.iso`, ...
pub(crate) fn unique_path(dir: &Path, filename: &str, suffix_start: usize) -> PathBuf {
    let base_path = dir.join(filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    };

    for i in suffix_start..1000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    // Fallback (extremely unlikely)
    let timestamp = chrono::Utc::now().timestamp();
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

/// Sanitizes a filename by replacing characters that are invalid on common
/// filesystems (`/ \ : * ? " < > |` and control characters).
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Filename from the last URL path segment (percent-decoded), or
/// `download_<timestamp>.bin` when the path has none.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last)
            .map_or_else(|_| last.to_string(), std::borrow::Cow::into_owned);
        return sanitize_filename(&decoded);
    }

    format!("download_{}.bin", chrono::Utc::now().timestamp())
}
