//! The live process/command graph.
//!
//! One record per known live pid, one aggregate record per distinct command
//! name ever seen this session. Command records live in an arena with stable
//! indices so process records can point at them cheaply and outlive churn in
//! the pid map; they are only discarded by a counter reset.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use crate::procfs::ProcReader;
use crate::tracker::histogram::Histogram;

/// Stable index into the command arena.
pub type CommandId = usize;

/// Aggregate statistics for every process instance sharing one command name.
///
/// The empty name is the sentinel for processes that vanished before their
/// `/proc` entry could be read.
#[derive(Debug)]
pub struct CommandStats {
    pub name: String,
    /// Exec events whose executing process carried this name.
    pub exec_count: u64,
    /// Total exec-to-exit wall time over completed instances, in nanoseconds.
    pub exec_time_total: u64,
    /// Exec events attributed to this command as an ancestor, once per exec.
    pub subtree_exec_count: u64,
    /// Wall time attributed to this command as an ancestor, once per exit.
    pub subtree_exec_time_total: u64,
    /// Serial of the last ancestor climb that touched this record. Dedups a
    /// command appearing several times in one chain (bash → find → bash).
    pub(crate) attributed_climb: u64,
}

impl CommandStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exec_count: 0,
            exec_time_total: 0,
            subtree_exec_count: 0,
            subtree_exec_time_total: 0,
            attributed_climb: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(vanished)"
        } else {
            &self.name
        }
    }
}

/// One known live process.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    /// Parent pid once a climb has resolved it. Cleared implicitly: a resolved
    /// parent that is no longer in the pid map stops the climb instead of
    /// being re-read from `/proc`.
    pub(crate) parent: Option<i32>,
    pub command: CommandId,
    /// Timestamp of the exec that created this record; 0 when the record was
    /// synthesized from `/proc` and the true start is unknown.
    pub start_ts: u64,
}

/// Event totals for the current session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub fork_events: u64,
    pub exec_events: u64,
    pub exit_events: u64,
    /// Failed `/proc` reads.
    pub vanished: u64,
    /// Process records deleted by exit or by the liveness sweep.
    pub removed: u64,
}

/// All mutable accounting state. Always accessed under the tracker's lock.
pub struct Graph {
    pub(crate) processes: HashMap<i32, ProcessInfo>,
    commands: Vec<CommandStats>,
    by_name: HashMap<String, CommandId>,
    pub histogram: Histogram,
    pub counters: SessionCounters,
    pub(crate) climb_serial: u64,
    session_clock: Instant,
    session_start: SystemTime,
    reader: Box<dyn ProcReader>,
}

impl Graph {
    pub fn new(reader: Box<dyn ProcReader>) -> Self {
        Self {
            processes: HashMap::new(),
            commands: Vec::new(),
            by_name: HashMap::new(),
            histogram: Histogram::default(),
            counters: SessionCounters::default(),
            climb_serial: 0,
            session_clock: Instant::now(),
            session_start: SystemTime::now(),
            reader,
        }
    }

    fn intern(&mut self, name: &str) -> CommandId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.commands.len();
        self.commands.push(CommandStats::new(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn command(&self, id: CommandId) -> &CommandStats {
        &self.commands[id]
    }

    pub(crate) fn command_mut(&mut self, id: CommandId) -> &mut CommandStats {
        &mut self.commands[id]
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandStats> {
        self.commands.iter()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn process(&self, pid: i32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn pids(&self) -> Vec<i32> {
        self.processes.keys().copied().collect()
    }

    /// Record an exec event for `pid`: re-read its `/proc` entry (the image,
    /// and possibly the parent, just changed) and replace any existing record.
    ///
    /// Every exec event increments exactly one command's `exec_count` (the
    /// vanished sentinel when the read fails), which is what keeps the event
    /// counter and the per-command counts in agreement.
    pub(crate) fn record_exec(&mut self, pid: i32, ts: u64) {
        let (name, ppid) = match self.reader.read_stat(pid) {
            Ok(stat) => (stat.comm, stat.ppid),
            Err(_) => {
                self.counters.vanished += 1;
                (String::new(), -1)
            }
        };
        let command = self.intern(&name);
        self.commands[command].exec_count += 1;
        self.processes.insert(
            pid,
            ProcessInfo {
                pid,
                ppid,
                parent: None,
                command,
                start_ts: ts,
            },
        );
    }

    /// Make sure `pid` has a record, synthesizing one from `/proc` if needed.
    ///
    /// Used by the ancestor climb for parents that never exec'd during this
    /// session: the record gets `start_ts = 0` (we never saw it start, so no
    /// execution time may be charged at its exit) and its command's
    /// `exec_count` is untouched (no exec event happened).
    ///
    /// Returns false when the process vanished before it could be read.
    pub(crate) fn ensure_process(&mut self, pid: i32) -> bool {
        if self.processes.contains_key(&pid) {
            return true;
        }
        let stat = match self.reader.read_stat(pid) {
            Ok(stat) => stat,
            Err(_) => {
                self.counters.vanished += 1;
                return false;
            }
        };
        let command = self.intern(&stat.comm);
        self.processes.insert(
            pid,
            ProcessInfo {
                pid,
                ppid: stat.ppid,
                parent: None,
                command,
                start_ts: 0,
            },
        );
        true
    }

    pub(crate) fn remove(&mut self, pid: i32) -> Option<ProcessInfo> {
        self.processes.remove(&pid)
    }

    /// Discard every record, the histogram and all counters, and re-stamp the
    /// session start. Equivalent to a fresh boot of the tool.
    pub fn reset(&mut self) {
        self.processes.clear();
        self.commands.clear();
        self.by_name.clear();
        self.histogram.clear();
        self.counters = SessionCounters::default();
        self.climb_serial = 0;
        self.session_clock = Instant::now();
        self.session_start = SystemTime::now();
    }

    /// Wall-clock time since session start (process start or last reset).
    pub fn elapsed(&self) -> std::time::Duration {
        self.session_clock.elapsed()
    }

    pub fn session_start(&self) -> SystemTime {
        self.session_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::FakeProcReader;

    fn graph_with(entries: &[(i32, &str, i32)]) -> Graph {
        let mut reader = FakeProcReader::new();
        for &(pid, comm, ppid) in entries {
            reader.insert(pid, comm, ppid);
        }
        Graph::new(Box::new(reader))
    }

    #[test]
    fn test_record_exec_creates_command_and_process() {
        let mut g = graph_with(&[(100, "ls", 1)]);
        g.record_exec(100, 42);

        let rec = g.process(100).unwrap();
        assert_eq!(rec.ppid, 1);
        assert_eq!(rec.start_ts, 42);
        assert_eq!(g.command(rec.command).name, "ls");
        assert_eq!(g.command(rec.command).exec_count, 1);
    }

    #[test]
    fn test_record_exec_replaces_previous_image() {
        // A shell that execs twice: the record must follow the new image.
        let mut g = graph_with(&[(100, "sh", 1)]);
        g.record_exec(100, 10);

        let mut reader = FakeProcReader::new();
        reader.insert(100, "ls", 1);
        g.reader = Box::new(reader);
        g.record_exec(100, 20);

        let rec = g.process(100).unwrap();
        assert_eq!(g.command(rec.command).name, "ls");
        assert_eq!(rec.start_ts, 20);
        assert_eq!(g.command_count(), 2);
        let total: u64 = g.commands().map(|c| c.exec_count).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_record_exec_vanished_uses_sentinel() {
        let mut g = graph_with(&[]);
        g.record_exec(300, 5);

        assert_eq!(g.counters.vanished, 1);
        let rec = g.process(300).unwrap();
        assert_eq!(rec.ppid, -1);
        let cmd = g.command(rec.command);
        assert_eq!(cmd.name, "");
        assert_eq!(cmd.display_name(), "(vanished)");
        assert_eq!(cmd.exec_count, 1);
    }

    #[test]
    fn test_ensure_process_does_not_count_an_exec() {
        let mut g = graph_with(&[(200, "bash", 1)]);
        assert!(g.ensure_process(200));

        let rec = g.process(200).unwrap();
        assert_eq!(rec.start_ts, 0);
        assert_eq!(g.command(rec.command).exec_count, 0);

        // second call is a no-op
        assert!(g.ensure_process(200));
        assert_eq!(g.process_count(), 1);
    }

    #[test]
    fn test_ensure_process_vanished() {
        let mut g = graph_with(&[]);
        assert!(!g.ensure_process(999));
        assert_eq!(g.counters.vanished, 1);
        assert_eq!(g.process_count(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut g = graph_with(&[(100, "ls", 1)]);
        g.record_exec(100, 42);
        g.counters.exec_events = 1;
        g.histogram.record(1_000);

        g.reset();
        assert_eq!(g.process_count(), 0);
        assert_eq!(g.command_count(), 0);
        assert_eq!(g.counters.exec_events, 0);
        assert_eq!(g.counters.vanished, 0);
        assert_eq!(g.histogram.total(), 0);

        // reset twice is the same as reset once
        g.reset();
        assert_eq!(g.process_count(), 0);
        assert_eq!(g.command_count(), 0);
    }
}
