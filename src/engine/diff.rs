//! Diff engine
//!
//! Compares regular files byte for byte (rendering a unified diff when they
//! differ) and directories by permission bits. Paths are never dereferenced:
//! a symlink is compared as a symlink. Missing or wrong-typed inputs are a
//! normal grading outcome and come back as `DiffStatus::Error`.

use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use crate::core::verdict::{Perm, VerdictError};

/// Lines of unchanged context around each hunk
const CONTEXT_LINES: usize = 3;
/// Largest LCS table computed before falling back to a whole-block rewrite
const MAX_LCS_CELLS: usize = 1 << 22;
const COMPARE_CHUNK: usize = 64 * 1024;

/// Tri-state comparison status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum DiffStatus {
    Identical,
    Different,
    Error,
}

impl TryFrom<i64> for DiffStatus {
    type Error = VerdictError;

    fn try_from(code: i64) -> Result<Self, VerdictError> {
        match code {
            0 => Ok(DiffStatus::Identical),
            1 => Ok(DiffStatus::Different),
            2 => Ok(DiffStatus::Error),
            other => Err(VerdictError::InvalidStatus(other)),
        }
    }
}

impl From<DiffStatus> for i64 {
    fn from(status: DiffStatus) -> Self {
        match status {
            DiffStatus::Identical => 0,
            DiffStatus::Different => 1,
            DiffStatus::Error => 2,
        }
    }
}

/// Result of comparing two files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub status: DiffStatus,
    pub text: String,
}

impl FileDiff {
    fn identical() -> Self {
        Self {
            status: DiffStatus::Identical,
            text: String::new(),
        }
    }

    pub fn error() -> Self {
        Self {
            status: DiffStatus::Error,
            text: String::new(),
        }
    }
}

/// Result of comparing two directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirDiff {
    pub status: DiffStatus,
    /// XOR of both permission values
    pub mask: u32,
}

/// Compare two regular files
///
/// Equality is decided on the full contents, streamed in chunks. Only the
/// first `limit` bytes of each side are loaded to render the diff text.
pub fn diff_files(expected: &Path, actual: &Path, limit: usize) -> FileDiff {
    match (open_regular(expected), open_regular(actual)) {
        (Some(mut exp), Some(mut act)) => match same_contents(&mut exp, &mut act) {
            Some(true) => FileDiff::identical(),
            Some(false) => render_difference(&mut exp, &mut act, limit)
                .unwrap_or_else(FileDiff::error),
            None => FileDiff::error(),
        },
        _ => diff_links(expected, actual).unwrap_or_else(FileDiff::error),
    }
}

/// Compare the permission bits of two directories
pub fn diff_dirs(expected: &Path, actual: &Path) -> DirDiff {
    match (dir_perm(expected), dir_perm(actual)) {
        (Some(exp), Some(act)) => {
            let mask = exp.bits() ^ act.bits();
            let status = if mask == 0 {
                DiffStatus::Identical
            } else {
                DiffStatus::Different
            };
            DirDiff { status, mask }
        }
        _ => DirDiff {
            status: DiffStatus::Error,
            mask: 0,
        },
    }
}

/// Permission bits of any existing entry, without following symlinks
pub fn permissions(path: &Path) -> Option<Perm> {
    fs::symlink_metadata(path)
        .ok()
        .map(|meta| Perm::from_mode(meta.mode()))
}

/// Text of a regular file, truncated to `limit` bytes
pub fn read_text(path: &Path, limit: usize) -> Option<String> {
    let mut file = open_regular(path)?;
    let (bytes, _) = read_prefix(&mut file, limit).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn dir_perm(path: &Path) -> Option<Perm> {
    let meta = fs::symlink_metadata(path).ok()?;
    meta.is_dir().then(|| Perm::from_mode(meta.mode()))
}

/// Open a regular file with `O_NOFOLLOW`, so the type check and the reads
/// see the same inode. `O_NONBLOCK` keeps a FIFO from stalling the open.
fn open_regular(path: &Path) -> Option<File> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)
        .ok()?;
    let meta = file.metadata().ok()?;
    meta.is_file().then_some(file)
}

fn same_contents(exp: &mut File, act: &mut File) -> Option<bool> {
    if exp.metadata().ok()?.len() != act.metadata().ok()?.len() {
        return Some(false);
    }
    let mut exp_buf = vec![0u8; COMPARE_CHUNK];
    let mut act_buf = vec![0u8; COMPARE_CHUNK];
    loop {
        let n = fill(exp, &mut exp_buf).ok()?;
        let m = fill(act, &mut act_buf).ok()?;
        if exp_buf[..n] != act_buf[..m] {
            return Some(false);
        }
        if n < COMPARE_CHUNK {
            return Some(true);
        }
    }
}

/// Read until `buf` is full or the file ends
fn fill(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// First `limit` bytes of the file and whether anything was left behind
fn read_prefix(file: &mut File, limit: usize) -> io::Result<(Vec<u8>, bool)> {
    file.seek(SeekFrom::Start(0))?;
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    let mut bytes = Vec::new();
    file.by_ref().take(limit).read_to_end(&mut bytes)?;
    let truncated = file.read(&mut [0u8; 1])? > 0;
    Ok((bytes, truncated))
}

fn render_difference(exp: &mut File, act: &mut File, limit: usize) -> Option<FileDiff> {
    let (exp_bytes, exp_cut) = read_prefix(exp, limit).ok()?;
    let (act_bytes, act_cut) = read_prefix(act, limit).ok()?;

    let text = if !(exp_cut || act_cut) {
        unified_diff(&exp_bytes, &act_bytes)
    } else if exp_bytes == act_bytes {
        format!("Files expected and actual differ after the first {} bytes\n", limit)
    } else {
        let mut text = unified_diff(&exp_bytes, &act_bytes);
        let _ = writeln!(text, "\\ Diff limited to the first {} bytes", limit);
        text
    };
    Some(FileDiff {
        status: DiffStatus::Different,
        text,
    })
}

/// Two symlinks are equal when they point at the same target string
fn diff_links(expected: &Path, actual: &Path) -> Option<FileDiff> {
    let is_link = |p: &Path| {
        fs::symlink_metadata(p)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    };
    if !is_link(expected) || !is_link(actual) {
        return None;
    }

    let exp = fs::read_link(expected).ok()?;
    let act = fs::read_link(actual).ok()?;
    if exp == act {
        return Some(FileDiff::identical());
    }

    let render = |target: &Path| format!("-> {}\n", target.display());
    Some(FileDiff {
        status: DiffStatus::Different,
        text: unified_diff(render(&exp).as_bytes(), render(&act).as_bytes()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Keep,
    Remove,
    Add,
}

/// Render a unified diff of two byte buffers, line by line
///
/// The output is never empty: buffers that differ only in bytes lost to
/// UTF-8 replacement are reported as a binary difference.
fn unified_diff(expected: &[u8], actual: &[u8]) -> String {
    let exp_text = String::from_utf8_lossy(expected);
    let act_text = String::from_utf8_lossy(actual);
    let exp_lines: Vec<&str> = exp_text.split_inclusive('\n').collect();
    let act_lines: Vec<&str> = act_text.split_inclusive('\n').collect();

    let ops = line_ops(&exp_lines, &act_lines);
    if ops.iter().all(|(tag, _)| *tag == Tag::Keep) {
        return "Binary files expected and actual differ\n".to_string();
    }

    let mut out = String::from("--- expected\n+++ actual\n");
    for (lo, hi) in hunks(&ops) {
        render_hunk(&mut out, &ops, lo, hi);
    }
    out
}

/// Edit script between two line sequences
fn line_ops<'a>(exp: &[&'a str], act: &[&'a str]) -> Vec<(Tag, &'a str)> {
    let prefix = exp
        .iter()
        .zip(act.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = exp[prefix..]
        .iter()
        .rev()
        .zip(act[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let exp_mid = &exp[prefix..exp.len() - suffix];
    let act_mid = &act[prefix..act.len() - suffix];

    let mut ops: Vec<(Tag, &str)> = exp[..prefix].iter().map(|l| (Tag::Keep, *l)).collect();
    if (exp_mid.len() + 1).saturating_mul(act_mid.len() + 1) <= MAX_LCS_CELLS {
        ops.extend(lcs_ops(exp_mid, act_mid));
    } else {
        ops.extend(exp_mid.iter().map(|l| (Tag::Remove, *l)));
        ops.extend(act_mid.iter().map(|l| (Tag::Add, *l)));
    }
    ops.extend(exp[exp.len() - suffix..].iter().map(|l| (Tag::Keep, *l)));
    ops
}

fn lcs_ops<'a>(exp: &[&'a str], act: &[&'a str]) -> Vec<(Tag, &'a str)> {
    let (n, m) = (exp.len(), act.len());
    let width = m + 1;
    // table[i * width + j] = LCS length of exp[i..] and act[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if exp[i] == act[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if exp[i] == act[j] {
            ops.push((Tag::Keep, exp[i]));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            ops.push((Tag::Remove, exp[i]));
            i += 1;
        } else {
            ops.push((Tag::Add, act[j]));
            j += 1;
        }
    }
    ops.extend(exp[i..].iter().map(|l| (Tag::Remove, *l)));
    ops.extend(act[j..].iter().map(|l| (Tag::Add, *l)));
    ops
}

/// Group changed ops into `[lo, hi)` ranges padded with context
fn hunks(ops: &[(Tag, &str)]) -> Vec<(usize, usize)> {
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (idx, _) in ops.iter().enumerate().filter(|(_, (t, _))| *t != Tag::Keep) {
        let lo = idx.saturating_sub(CONTEXT_LINES);
        let hi = (idx + CONTEXT_LINES + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if lo <= last.1 => last.1 = hi,
            _ => ranges.push((lo, hi)),
        }
    }
    ranges
}

fn render_hunk(out: &mut String, ops: &[(Tag, &str)], lo: usize, hi: usize) {
    let old_before = ops[..lo].iter().filter(|(t, _)| *t != Tag::Add).count();
    let new_before = ops[..lo].iter().filter(|(t, _)| *t != Tag::Remove).count();
    let old_len = ops[lo..hi].iter().filter(|(t, _)| *t != Tag::Add).count();
    let new_len = ops[lo..hi].iter().filter(|(t, _)| *t != Tag::Remove).count();

    let _ = writeln!(
        out,
        "@@ -{} +{} @@",
        hunk_range(old_before, old_len),
        hunk_range(new_before, new_len)
    );
    for (tag, line) in &ops[lo..hi] {
        out.push(match tag {
            Tag::Keep => ' ',
            Tag::Remove => '-',
            Tag::Add => '+',
        });
        out.push_str(line);
        if !line.ends_with('\n') {
            out.push_str("\n\\ No newline at end of file\n");
        }
    }
}

fn hunk_range(before: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", before),
        1 => format!("{}", before + 1),
        _ => format!("{},{}", before + 1, len),
    }
}
