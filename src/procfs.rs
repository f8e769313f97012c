//! `/proc/<pid>/stat` reader.
//!
//! Short-lived processes are often reaped before their stat file can be opened;
//! that is an expected outcome (`StatError::Vanished`), not a fault. The reader
//! keeps a single pre-sized scratch buffer so the event hot path does not
//! allocate per call.

use std::fs::File;
use std::io::Read;

use thiserror::Error;

/// stat files are small (well under 1 KiB); one read with this buffer is enough.
const SCRATCH_SIZE: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatError {
    #[error("process vanished before /proc could be read")]
    Vanished,
    #[error("malformed stat line")]
    Malformed,
}

/// Command name and parent pid of a live process, as read from its stat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub comm: String,
    pub ppid: i32,
}

/// Seam between the accounting engine and `/proc`, so tests can fake the latter.
pub trait ProcReader: Send {
    fn read_stat(&mut self, pid: i32) -> Result<ProcStat, StatError>;
}

/// The real thing: reads `/proc/<pid>/stat` through a reused scratch buffer.
///
/// Not safe to share across threads without external locking; the accounting
/// engine only ever calls it while holding the graph lock.
pub struct SysProcReader {
    scratch: Vec<u8>,
}

impl SysProcReader {
    pub fn new() -> Self {
        Self {
            scratch: vec![0; SCRATCH_SIZE],
        }
    }
}

impl Default for SysProcReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcReader for SysProcReader {
    fn read_stat(&mut self, pid: i32) -> Result<ProcStat, StatError> {
        let path = format!("/proc/{pid}/stat");
        let mut file = File::open(path).map_err(|_| StatError::Vanished)?;
        let n = file.read(&mut self.scratch).map_err(|_| StatError::Vanished)?;
        if n == 0 {
            return Err(StatError::Vanished);
        }
        parse_stat(&self.scratch[..n])
    }
}

/// Extract field 2 (comm, parenthesized, may contain spaces and parentheses)
/// and field 4 (ppid) from a stat line.
///
/// The comm is delimited by the first `(` and the *last* `)` on the line; a
/// process named `a) b` would otherwise shift every later field.
pub fn parse_stat(line: &[u8]) -> Result<ProcStat, StatError> {
    let open = line
        .iter()
        .position(|&b| b == b'(')
        .ok_or(StatError::Malformed)?;
    let close = line
        .iter()
        .rposition(|&b| b == b')')
        .ok_or(StatError::Malformed)?;
    if close < open {
        return Err(StatError::Malformed);
    }
    let comm = String::from_utf8_lossy(&line[open + 1..close]).into_owned();

    // After the comm: " <state> <ppid> ..."
    let rest = &line[close + 1..];
    let mut fields = rest.split(|&b| b == b' ').filter(|f| !f.is_empty());
    let _state = fields.next().ok_or(StatError::Malformed)?;
    let ppid = fields.next().ok_or(StatError::Malformed)?;
    let ppid = std::str::from_utf8(ppid)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or(StatError::Malformed)?;

    Ok(ProcStat { comm, ppid })
}

/// In-memory stand-in for `/proc`, used by the test suites to replay
/// deterministic process trees.
#[derive(Debug, Default)]
pub struct FakeProcReader {
    entries: std::collections::HashMap<i32, ProcStat>,
}

impl FakeProcReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: i32, comm: &str, ppid: i32) -> &mut Self {
        self.entries.insert(
            pid,
            ProcStat {
                comm: comm.to_string(),
                ppid,
            },
        );
        self
    }

    pub fn remove(&mut self, pid: i32) -> &mut Self {
        self.entries.remove(&pid);
        self
    }
}

impl ProcReader for FakeProcReader {
    fn read_stat(&mut self, pid: i32) -> Result<ProcStat, StatError> {
        self.entries.get(&pid).cloned().ok_or(StatError::Vanished)
    }
}
