//! Verdict model
//!
//! `FileResult` holds one artifact comparison, `TcResult` the whole verdict of
//! a testcase run. Both serialize to the fixed wire shape consumed by the
//! grading service:
//!
//! ```text
//! { "result": 0, "etime": 12, "pstatus": 0,
//!   "cio": { "stdout": {..}, "stderr": {..} },
//!   "fio": { "a/b.txt": {"content": "..", "diff": "..", "perm": 420, "status": 0} } }
//! ```
//!
//! `status` is always written but optional when decoding; without it the
//! entry is identical exactly when its diff is empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::engine::diff::DiffStatus;

/// Mask of the permission bits of a file mode (`S_IMODE`)
const PERM_MASK: u32 = 0o7777;
/// Wire value for "permission not applicable"
const PERM_ABSENT: i64 = -1;

/// Errors building or decoding a verdict
#[derive(Debug, Error)]
pub enum VerdictError {
    #[error("permission value {0} is not a pure permission-bits value")]
    InvalidPerm(i64),
    #[error("unknown testcase result code {0}")]
    InvalidResult(i64),
    #[error("unknown diff status code {0}")]
    InvalidStatus(i64),
    #[error("console result `{0}` was already recorded")]
    ConsoleAlreadySet(&'static str),
    #[error("console result `{0}` was never recorded")]
    ConsoleMissing(&'static str),
    #[error("console slot `{expected}` cannot hold result `{actual}`")]
    ConsoleNameMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("artifact `{0}` was already recorded")]
    DuplicateArtifact(String),
    #[error("malformed verdict data: {0}")]
    Format(#[from] serde_json::Error),
}

/// Outcome of the execution phase of a testcase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TcStatus {
    Success,
    Fail,
    Timeout,
    Error,
}

impl TcStatus {
    pub fn code(self) -> i64 {
        match self {
            TcStatus::Success => 0,
            TcStatus::Fail => 1,
            TcStatus::Timeout => 2,
            TcStatus::Error => 3,
        }
    }
}

impl TryFrom<i64> for TcStatus {
    type Error = VerdictError;

    fn try_from(code: i64) -> Result<Self, VerdictError> {
        match code {
            0 => Ok(TcStatus::Success),
            1 => Ok(TcStatus::Fail),
            2 => Ok(TcStatus::Timeout),
            3 => Ok(TcStatus::Error),
            other => Err(VerdictError::InvalidResult(other)),
        }
    }
}

impl From<TcStatus> for i64 {
    fn from(status: TcStatus) -> Self {
        status.code()
    }
}

impl fmt::Display for TcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcStatus::Success => "success",
            TcStatus::Fail => "fail",
            TcStatus::Timeout => "timeout",
            TcStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Console stream slot of a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

impl ConsoleStream {
    pub const ALL: [ConsoleStream; 2] = [ConsoleStream::Stdout, ConsoleStream::Stderr];

    /// Identity of the stream inside `cio`
    pub fn name(self) -> &'static str {
        match self {
            ConsoleStream::Stdout => "stdout",
            ConsoleStream::Stderr => "stderr",
        }
    }

    /// File name of the recorded stream in the expected and actual trees
    pub fn file_name(self) -> &'static str {
        match self {
            ConsoleStream::Stdout => "stdout.txt",
            ConsoleStream::Stderr => "stderr.txt",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.file_name() == name)
    }
}

/// POSIX permission bits (the 12 low bits of a file mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Perm(u32);

impl Perm {
    /// Validate a value that must contain permission bits only
    pub fn new(bits: u32) -> Result<Self, VerdictError> {
        if bits & !PERM_MASK != 0 {
            return Err(VerdictError::InvalidPerm(bits.into()));
        }
        Ok(Self(bits))
    }

    /// Extract the permission bits of a full `st_mode`
    pub fn from_mode(mode: u32) -> Self {
        Self(mode & PERM_MASK)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

fn perm_to_wire(perm: Option<Perm>) -> i64 {
    perm.map_or(PERM_ABSENT, |p| p.bits().into())
}

fn perm_from_wire(raw: i64) -> Result<Option<Perm>, VerdictError> {
    if raw == PERM_ABSENT {
        return Ok(None);
    }
    let bits = u32::try_from(raw).map_err(|_| VerdictError::InvalidPerm(raw))?;
    Perm::new(bits).map(Some)
}

/// Comparison outcome of a single named artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    name: String,
    status: DiffStatus,
    content: String,
    diff: String,
    perm: Option<Perm>,
}

impl FileResult {
    pub fn new(
        name: impl Into<String>,
        status: DiffStatus,
        content: impl Into<String>,
        diff: impl Into<String>,
        perm: Option<Perm>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            content: content.into(),
            diff: diff.into(),
            perm,
        }
    }

    /// Build from a raw permission value where `-1` means "not applicable"
    pub fn with_raw_perm(
        name: impl Into<String>,
        status: DiffStatus,
        content: impl Into<String>,
        diff: impl Into<String>,
        perm: i64,
    ) -> Result<Self, VerdictError> {
        Ok(Self::new(name, status, content, diff, perm_from_wire(perm)?))
    }

    /// Result for a console stream, which never carries permissions
    pub fn console(
        stream: ConsoleStream,
        status: DiffStatus,
        content: impl Into<String>,
        diff: impl Into<String>,
    ) -> Self {
        Self::new(stream.name(), status, content, diff, None)
    }

    /// Placeholder for an artifact that could not be compared at all
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::new(name, DiffStatus::Error, String::new(), String::new(), None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> DiffStatus {
        self.status
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn diff(&self) -> &str {
        &self.diff
    }

    pub fn perm(&self) -> Option<Perm> {
        self.perm
    }

    pub fn is_identical(&self) -> bool {
        self.status == DiffStatus::Identical
    }

    fn into_wire(self) -> FileEntryWire {
        FileEntryWire {
            content: self.content,
            diff: self.diff,
            perm: perm_to_wire(self.perm),
            status: Some(self.status),
        }
    }

    fn from_wire(name: String, entry: FileEntryWire) -> Result<Self, VerdictError> {
        // Entries written without a status carry only the diff text
        let status = entry.status.unwrap_or(if entry.diff.is_empty() {
            DiffStatus::Identical
        } else {
            DiffStatus::Different
        });
        Self::with_raw_perm(name, status, entry.content, entry.diff, entry.perm)
    }
}

/// Complete verdict of one testcase run
///
/// Only obtainable from [`VerdictBuilder::finish`] or by decoding, so both
/// console slots are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TcResultWire", into = "TcResultWire")]
pub struct TcResult {
    result: TcStatus,
    etime: u64,
    pstatus: i32,
    stdout: FileResult,
    stderr: FileResult,
    fio: BTreeMap<String, FileResult>,
}

impl TcResult {
    pub fn result(&self) -> TcStatus {
        self.result
    }

    /// Elapsed wall-clock time in milliseconds
    pub fn etime(&self) -> u64 {
        self.etime
    }

    /// Raw process exit status
    pub fn pstatus(&self) -> i32 {
        self.pstatus
    }

    pub fn console(&self, stream: ConsoleStream) -> &FileResult {
        match stream {
            ConsoleStream::Stdout => &self.stdout,
            ConsoleStream::Stderr => &self.stderr,
        }
    }

    pub fn stdout(&self) -> &FileResult {
        &self.stdout
    }

    pub fn stderr(&self) -> &FileResult {
        &self.stderr
    }

    /// Filesystem artifacts keyed by relative path
    pub fn fio(&self) -> &BTreeMap<String, FileResult> {
        &self.fio
    }

    pub fn artifact(&self, path: &str) -> Option<&FileResult> {
        self.fio.get(path)
    }

    /// True when every compared artifact, console streams included, is identical
    pub fn all_identical(&self) -> bool {
        self.stdout.is_identical()
            && self.stderr.is_identical()
            && self.fio.values().all(FileResult::is_identical)
    }

    pub fn to_json(&self) -> Result<String, VerdictError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, VerdictError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, VerdictError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, VerdictError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Incremental construction of a [`TcResult`]
///
/// Execution fields are fixed up front; each console slot may be filled once
/// and each artifact path recorded once.
#[derive(Debug)]
pub struct VerdictBuilder {
    result: TcStatus,
    etime: u64,
    pstatus: i32,
    stdout: Option<FileResult>,
    stderr: Option<FileResult>,
    fio: BTreeMap<String, FileResult>,
}

impl VerdictBuilder {
    pub fn new(result: TcStatus, etime: u64, pstatus: i32) -> Self {
        Self {
            result,
            etime,
            pstatus,
            stdout: None,
            stderr: None,
            fio: BTreeMap::new(),
        }
    }

    pub fn set_console(
        &mut self,
        stream: ConsoleStream,
        result: FileResult,
    ) -> Result<(), VerdictError> {
        if result.name != stream.name() {
            return Err(VerdictError::ConsoleNameMismatch {
                expected: stream.name(),
                actual: result.name,
            });
        }
        let slot = match stream {
            ConsoleStream::Stdout => &mut self.stdout,
            ConsoleStream::Stderr => &mut self.stderr,
        };
        if slot.is_some() {
            return Err(VerdictError::ConsoleAlreadySet(stream.name()));
        }
        *slot = Some(result);
        Ok(())
    }

    pub fn add_file(&mut self, result: FileResult) -> Result<(), VerdictError> {
        if self.fio.contains_key(&result.name) {
            return Err(VerdictError::DuplicateArtifact(result.name));
        }
        self.fio.insert(result.name.clone(), result);
        Ok(())
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.fio.contains_key(name)
    }

    pub fn finish(self) -> Result<TcResult, VerdictError> {
        let stdout = self
            .stdout
            .ok_or(VerdictError::ConsoleMissing(ConsoleStream::Stdout.name()))?;
        let stderr = self
            .stderr
            .ok_or(VerdictError::ConsoleMissing(ConsoleStream::Stderr.name()))?;
        Ok(TcResult {
            result: self.result,
            etime: self.etime,
            pstatus: self.pstatus,
            stdout,
            stderr,
            fio: self.fio,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEntryWire {
    content: String,
    diff: String,
    perm: i64,
    #[serde(default)]
    status: Option<DiffStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsoleWire {
    stdout: FileEntryWire,
    stderr: FileEntryWire,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TcResultWire {
    result: TcStatus,
    etime: u64,
    pstatus: i32,
    cio: ConsoleWire,
    fio: BTreeMap<String, FileEntryWire>,
}

impl From<TcResult> for TcResultWire {
    fn from(verdict: TcResult) -> Self {
        Self {
            result: verdict.result,
            etime: verdict.etime,
            pstatus: verdict.pstatus,
            cio: ConsoleWire {
                stdout: verdict.stdout.into_wire(),
                stderr: verdict.stderr.into_wire(),
            },
            fio: verdict
                .fio
                .into_iter()
                .map(|(path, result)| (path, result.into_wire()))
                .collect(),
        }
    }
}

impl TryFrom<TcResultWire> for TcResult {
    type Error = VerdictError;

    fn try_from(wire: TcResultWire) -> Result<Self, VerdictError> {
        let mut builder = VerdictBuilder::new(wire.result, wire.etime, wire.pstatus);
        builder.set_console(
            ConsoleStream::Stdout,
            FileResult::from_wire(ConsoleStream::Stdout.name().to_string(), wire.cio.stdout)?,
        )?;
        builder.set_console(
            ConsoleStream::Stderr,
            FileResult::from_wire(ConsoleStream::Stderr.name().to_string(), wire.cio.stderr)?,
        )?;
        for (path, entry) in wire.fio {
            builder.add_file(FileResult::from_wire(path, entry)?)?;
        }
        builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console_pair(builder: &mut VerdictBuilder) {
        builder
            .set_console(
                ConsoleStream::Stdout,
                FileResult::console(ConsoleStream::Stdout, DiffStatus::Identical, "hello\n", ""),
            )
            .unwrap();
        builder
            .set_console(
                ConsoleStream::Stderr,
                FileResult::console(
                    ConsoleStream::Stderr,
                    DiffStatus::Different,
                    "oops\n",
                    "--- expected\n+++ actual\n@@ -0,0 +1 @@\n+oops\n",
                ),
            )
            .unwrap();
    }

    fn sample_verdict(result: TcStatus) -> TcResult {
        let mut builder = VerdictBuilder::new(result, 42, 0);
        console_pair(&mut builder);
        builder
            .add_file(FileResult::new(
                "a/b/c.txt",
                DiffStatus::Identical,
                "data\n",
                "",
                Some(Perm::new(0o644).unwrap()),
            ))
            .unwrap();
        builder
            .add_file(FileResult::new(
                "a",
                DiffStatus::Different,
                "",
                "0311",
                Some(Perm::new(0o755).unwrap()),
            ))
            .unwrap();
        builder
            .add_file(FileResult::unavailable("missing.txt"))
            .unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_perm_rejects_type_bits() {
        assert!(Perm::new(0o4755).is_ok());
        assert!(matches!(
            Perm::new(0o100644),
            Err(VerdictError::InvalidPerm(0o100644))
        ));
        assert_eq!(Perm::from_mode(0o100644), Perm::new(0o644).unwrap());
    }

    #[test]
    fn test_file_result_raw_perm_validation() {
        let ok = FileResult::with_raw_perm("f", DiffStatus::Identical, "", "", 0o600).unwrap();
        assert_eq!(ok.perm().map(Perm::bits), Some(0o600));

        let absent = FileResult::with_raw_perm("f", DiffStatus::Identical, "", "", -1).unwrap();
        assert_eq!(absent.perm(), None);

        assert!(FileResult::with_raw_perm("f", DiffStatus::Identical, "", "", 0o40755).is_err());
        assert!(FileResult::with_raw_perm("f", DiffStatus::Identical, "", "", -2).is_err());
    }

    #[test]
    fn test_round_trip_all_results() {
        for result in [
            TcStatus::Success,
            TcStatus::Fail,
            TcStatus::Timeout,
            TcStatus::Error,
        ] {
            let verdict = sample_verdict(result);
            let json = verdict.to_json().unwrap();
            assert_eq!(TcResult::from_json(&json).unwrap(), verdict);
        }
    }

    #[test]
    fn test_round_trip_without_artifacts() {
        let mut builder = VerdictBuilder::new(TcStatus::Timeout, 5003, -256);
        console_pair(&mut builder);
        let verdict = builder.finish().unwrap();

        let decoded = TcResult::from_slice(verdict.to_json_pretty().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, verdict);
        assert!(decoded.fio().is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let value: serde_json::Value =
            serde_json::from_str(&sample_verdict(TcStatus::Fail).to_json().unwrap()).unwrap();

        assert_eq!(value["result"], 1);
        assert_eq!(value["etime"], 42);
        assert_eq!(value["pstatus"], 0);
        assert_eq!(value["cio"]["stdout"]["perm"], -1);
        assert_eq!(value["cio"]["stdout"]["content"], "hello\n");
        assert_eq!(value["cio"]["stderr"]["status"], 1);
        assert_eq!(value["fio"]["a/b/c.txt"]["perm"], 0o644);
        assert_eq!(value["fio"]["missing.txt"]["status"], 2);
        assert_eq!(value["fio"]["missing.txt"]["perm"], -1);
    }

    #[test]
    fn test_decode_entries_without_status() {
        let json = r#"{
          "result": 1,
          "etime": 120,
          "pstatus": 1,
          "cio": { "stdout": {"content": "4\n", "diff": "--- expected\n+++ actual\n@@ -1 +1 @@\n-3\n+4\n", "perm": -1},
                   "stderr": {"content": "", "diff": "", "perm": -1} },
          "fio": { "out/result.txt": {"content": "ok\n", "diff": "", "perm": 420} }
        }"#;
        let verdict = TcResult::from_json(json).unwrap();

        assert_eq!(verdict.result(), TcStatus::Fail);
        assert_eq!(verdict.etime(), 120);
        assert_eq!(verdict.stdout().status(), DiffStatus::Different);
        assert_eq!(verdict.stdout().content(), "4\n");
        assert_eq!(verdict.stderr().status(), DiffStatus::Identical);
        let artifact = verdict.artifact("out/result.txt").unwrap();
        assert_eq!(artifact.status(), DiffStatus::Identical);
        assert_eq!(artifact.perm().map(Perm::bits), Some(0o644));
    }

    #[test]
    fn test_decode_rejects_missing_key() {
        let json = r#"{"result":0,"etime":1,"pstatus":0,
            "cio":{"stdout":{"content":"","diff":"","perm":-1,"status":0},
                   "stderr":{"content":"","diff":"","perm":-1,"status":0}}}"#;
        assert!(matches!(
            TcResult::from_json(json),
            Err(VerdictError::Format(_))
        ));

        let json = r#"{"result":0,"etime":1,"pstatus":0,
            "cio":{"stdout":{"content":"","diff":"","perm":-1,"status":0}},
            "fio":{}}"#;
        assert!(TcResult::from_json(json).is_err());

        let json = r#"{"result":0,"etime":1,"pstatus":0,
            "cio":{"stdout":{"content":"","perm":-1,"status":0},
                   "stderr":{"content":"","diff":"","perm":-1,"status":0}},
            "fio":{}}"#;
        assert!(TcResult::from_json(json).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_values() {
        let template = |result: &str, perm: &str, etime: &str| {
            format!(
                r#"{{"result":{result},"etime":{etime},"pstatus":-9,
                "cio":{{"stdout":{{"content":"","diff":"","perm":-1,"status":0}},
                       "stderr":{{"content":"","diff":"","perm":-1,"status":0}}}},
                "fio":{{"x":{{"content":"","diff":"","perm":{perm},"status":2}}}}}}"#
            )
        };

        assert!(TcResult::from_json(&template("3", "420", "0")).is_ok());
        assert!(TcResult::from_json(&template("4", "420", "0")).is_err());
        assert!(TcResult::from_json(&template("0", "33188", "0")).is_err());
        assert!(TcResult::from_json(&template("0", "-5", "0")).is_err());
        assert!(TcResult::from_json(&template("0", "420", "-1")).is_err());
    }

    #[test]
    fn test_builder_slots_filled_once() {
        let mut builder = VerdictBuilder::new(TcStatus::Success, 0, 0);
        console_pair(&mut builder);

        let again = FileResult::console(ConsoleStream::Stdout, DiffStatus::Identical, "", "");
        assert!(matches!(
            builder.set_console(ConsoleStream::Stdout, again),
            Err(VerdictError::ConsoleAlreadySet("stdout"))
        ));

        builder.add_file(FileResult::unavailable("x")).unwrap();
        assert!(builder.has_file("x"));
        assert!(!builder.has_file("y"));
        assert!(matches!(
            builder.add_file(FileResult::unavailable("x")),
            Err(VerdictError::DuplicateArtifact(_))
        ));
    }

    #[test]
    fn test_builder_checks_console_identity() {
        let mut builder = VerdictBuilder::new(TcStatus::Success, 0, 0);
        let wrong = FileResult::console(ConsoleStream::Stderr, DiffStatus::Identical, "", "");
        assert!(matches!(
            builder.set_console(ConsoleStream::Stdout, wrong),
            Err(VerdictError::ConsoleNameMismatch { .. })
        ));
        assert!(matches!(
            builder.finish(),
            Err(VerdictError::ConsoleMissing("stdout"))
        ));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TcStatus::Success.to_string(), "success");
        assert_eq!(TcStatus::Timeout.to_string(), "timeout");
        assert_eq!(i64::from(TcStatus::Error), 3);
    }
}
