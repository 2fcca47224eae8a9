//! Suffix classification, target path mapping and pointer URL rules.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::database::models::{FileType, TaskDbModel};
use crate::remote::{encode_remote_path, validate_remote_path};
use crate::{Error, Result};

/// Parse a comma-separated suffix list.
///
/// Items are trimmed and empty items dropped. Items with a leading dot are
/// malformed and ignored.
pub fn parse_suffixes(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter(|item| {
            if item.starts_with('.') {
                warn!(suffix = %item, "Ignoring suffix with a leading dot");
                false
            } else {
                true
            }
        })
        .map(str::to_string)
        .collect()
}

/// Text after the last `.` of a file name.
pub fn file_suffix(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, suffix)) if !stem.is_empty() && !suffix.is_empty() => Some(suffix),
        _ => None,
    }
}

/// How a remote file is handled by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Media,
    Sidecar(FileType),
    Ignored,
}

/// Per-task suffix sets.
#[derive(Debug, Clone, Default)]
pub struct SuffixRules {
    media: HashSet<String>,
    metadata: Option<HashSet<String>>,
    subtitle: Option<HashSet<String>>,
}

impl SuffixRules {
    pub fn from_task(task: &TaskDbModel) -> Self {
        Self {
            media: parse_suffixes(&task.file_suffix),
            metadata: task
                .download_metadata
                .then(|| parse_suffixes(&task.metadata_suffix)),
            subtitle: task
                .download_subtitle
                .then(|| parse_suffixes(&task.subtitle_suffix)),
        }
    }

    pub fn media_is_empty(&self) -> bool {
        self.media.is_empty()
    }

    /// Case-sensitive exact match. Media wins over sidecars when a suffix is
    /// configured in both lists.
    pub fn classify(&self, name: &str) -> FileKind {
        let Some(suffix) = file_suffix(name) else {
            return FileKind::Ignored;
        };
        if self.media.contains(suffix) {
            return FileKind::Media;
        }
        if self.metadata.as_ref().is_some_and(|s| s.contains(suffix)) {
            return FileKind::Sidecar(FileType::Metadata);
        }
        if self.subtitle.as_ref().is_some_and(|s| s.contains(suffix)) {
            return FileKind::Sidecar(FileType::Subtitle);
        }
        FileKind::Ignored
    }
}

/// Local directory mirroring the remote parent of `remote_path`.
///
/// Fails when `remote_path` is not below `source_root` or would escape the
/// target root.
pub fn target_dir(source_root: &str, target_root: &Path, remote_path: &str) -> Result<PathBuf> {
    validate_remote_path(remote_path)?;

    let root = source_root.trim_end_matches('/');
    let relative = if root.is_empty() {
        remote_path
    } else {
        remote_path
            .strip_prefix(root)
            .filter(|rest| rest.starts_with('/'))
            .ok_or_else(|| {
                Error::InvalidRemotePath(format!(
                    "{remote_path} is outside source root {source_root}"
                ))
            })?
    };

    let parent = match relative.rsplit_once('/') {
        Some((parent, _)) => parent.trim_start_matches('/'),
        None => "",
    };

    let mut dir = target_root.to_path_buf();
    for component in Path::new(parent).components() {
        match component {
            Component::Normal(part) => dir.push(part),
            Component::CurDir => {}
            _ => return Err(Error::InvalidRemotePath(remote_path.to_string())),
        }
    }
    Ok(dir)
}

/// Pointer file name for a media file.
///
/// `movie_4k.mp4` becomes `movie_4k.strm` with `replace_suffix`, otherwise
/// `movie_4k.mp4.strm`.
pub fn pointer_file_name(name: &str, replace_suffix: bool, extension: &str) -> String {
    let base = if replace_suffix {
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        }
    } else {
        name
    };
    format!("{base}.{extension}")
}

/// URL written into a pointer file.
pub fn build_pointer_url(host: &str, remote_path: &str, sign: &str, url_encode: bool) -> String {
    let path = if url_encode {
        encode_remote_path(remote_path)
    } else {
        remote_path.to_string()
    };

    let mut url = format!("{}/d{}", host.trim().trim_end_matches('/'), path);
    if !sign.is_empty() {
        url.push_str("?sign=");
        url.push_str(sign);
    }
    url
}

/// The URL stored in a pointer file.
pub fn read_pointer_url(contents: &str) -> &str {
    contents.trim()
}
