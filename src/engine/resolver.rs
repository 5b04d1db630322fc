//! Comparison pair resolution
//!
//! Enumerates what has to be diffed after a run: the recorded console
//! streams, and every entry of the expected filesystem tree paired with the
//! same relative path under the candidate's working root. Only what is
//! expected is enumerated; extra entries in the actual tree are not reported.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::verdict::ConsoleStream;

/// Recorded stdin, an input supply rather than a comparison target
pub const STDIN_FILE: &str = "stdin.txt";

const CONSOLE_DIR: &str = "cio";
const FILE_DIR: &str = "file";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Roots of the expected tree, the captured console output and the
/// candidate's working directory, as seen from the host
#[derive(Debug, Clone)]
pub struct Layout {
    pub expected_root: PathBuf,
    pub actual_root: PathBuf,
    pub work_root: PathBuf,
}

impl Layout {
    pub fn new(
        expected_root: impl Into<PathBuf>,
        actual_root: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            expected_root: expected_root.into(),
            actual_root: actual_root.into(),
            work_root: work_root.into(),
        }
    }

    pub fn expected_console_dir(&self) -> PathBuf {
        self.expected_root.join(CONSOLE_DIR)
    }

    pub fn expected_file_dir(&self) -> PathBuf {
        self.expected_root.join(FILE_DIR)
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.expected_console_dir().join(STDIN_FILE)
    }

    /// Where the captured stream is stored for comparison
    pub fn actual_console_path(&self, stream: ConsoleStream) -> PathBuf {
        self.actual_root.join(stream.file_name())
    }
}

/// Expected/actual paths of one console stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolePair {
    pub stream: ConsoleStream,
    pub expected: PathBuf,
    pub actual: PathBuf,
}

/// Type of an entry in the expected tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks, FIFOs, sockets and devices
    Other,
}

/// Expected/actual paths of one filesystem artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    /// `/`-separated path relative to both roots
    pub relative: String,
    pub kind: EntryKind,
    pub expected: PathBuf,
    pub actual: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PathPairResolver {
    layout: Layout,
}

impl PathPairResolver {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Default pair of a console stream, used whether or not it was recorded
    pub fn console_pair(&self, stream: ConsoleStream) -> ConsolePair {
        ConsolePair {
            stream,
            expected: self.layout.expected_console_dir().join(stream.file_name()),
            actual: self.layout.actual_console_path(stream),
        }
    }

    /// Recorded console streams, excluding stdin
    pub fn console_pairs(&self) -> Result<Vec<ConsolePair>, ResolveError> {
        let dir = self.layout.expected_console_dir();
        let entries = fs::read_dir(&dir).map_err(|source| ResolveError::List {
            path: dir.clone(),
            source,
        })?;

        let mut pairs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ResolveError::List {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == STDIN_FILE {
                continue;
            }
            match ConsoleStream::from_file_name(&name) {
                Some(stream) => pairs.push(self.console_pair(stream)),
                None => warn!("Ignoring unexpected console file {:?}", entry.path()),
            }
        }
        Ok(pairs)
    }

    /// Every entry of the expected filesystem tree, at any depth, sorted by
    /// relative path. A missing tree yields no pairs.
    pub fn file_pairs(&self) -> Result<Vec<ArtifactPair>, ResolveError> {
        let root = self.layout.expected_file_dir();
        let mut pairs = Vec::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(rel_dir) = pending.pop() {
            let dir = root.join(&rel_dir);
            let is_root = rel_dir.as_os_str().is_empty();
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if is_root && e.kind() == io::ErrorKind::NotFound => {
                    debug!("No expected filesystem tree at {:?}", dir);
                    return Ok(pairs);
                }
                Err(source) if is_root => {
                    return Err(ResolveError::List { path: dir, source });
                }
                Err(e) => {
                    warn!("Skipping unreadable expected directory {:?}: {}", dir, e);
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry in {:?}: {}", dir, e);
                        continue;
                    }
                };
                let rel = rel_dir.join(entry.file_name());
                // DirEntry::file_type does not traverse symlinks
                let kind = match entry.file_type() {
                    Ok(ft) if ft.is_dir() => EntryKind::Directory,
                    Ok(ft) if ft.is_file() => EntryKind::File,
                    _ => EntryKind::Other,
                };
                if kind == EntryKind::Directory {
                    pending.push(rel.clone());
                }
                pairs.push(ArtifactPair {
                    relative: relative_key(&rel),
                    kind,
                    expected: root.join(&rel),
                    actual: self.layout.work_root.join(&rel),
                });
            }
        }

        pairs.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(pairs)
    }
}

fn relative_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(escape_name(part)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// UTF-8 form of a file name; bytes that are not valid UTF-8 become `\xNN`
/// so distinct names keep distinct keys
fn escape_name(name: &OsStr) -> String {
    let mut out = String::new();
    for chunk in name.as_bytes().utf8_chunks() {
        out.push_str(chunk.valid());
        for byte in chunk.invalid() {
            let _ = write!(out, "\\x{:02x}", byte);
        }
    }
    out
}
